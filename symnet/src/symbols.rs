// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The distributed-symbol registry.
//!
//! A local symbolic array becomes a *distributed* symbol the moment it is
//! transmitted: one shared meta record names the logical symbol globally,
//! and every state that ever observed it holds its own local image. Images
//! carry a per-state taint suffix (`@<node>`) so that two states on
//! different nodes never alias each other's view of the symbol, while the
//! meta keeps the cross-state links intact.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use symnet_shared::expr::{Array, ArrayRef};
use symnet_shared::Node;

use crate::executor::StateId;

/// Meta record of one logical distributed symbol, shared by every local
/// image. Maps each observing state to its image; per meta and state there
/// is at most one image.
#[derive(Debug)]
pub struct DistributedSymbol {
    pub global_name: String,
    images: RefCell<HashMap<StateId, ArrayRef>>,
}

pub type MetaRef = Rc<DistributedSymbol>;

impl DistributedSymbol {
    fn new(global_name: String) -> MetaRef {
        Rc::new(DistributedSymbol {
            global_name,
            images: RefCell::new(HashMap::new()),
        })
    }

    pub fn image_for(&self, state: StateId) -> Option<ArrayRef> {
        self.images.borrow().get(&state).cloned()
    }
}

/// Per-state map from local arrays to their distributed images.
#[derive(Debug)]
pub struct DistSymbols {
    pub state: StateId,
    pub node: Node,
    /// Pure (never distributed) arrays to the local image they became.
    known_arrays: HashMap<ArrayRef, ArrayRef>,
    /// Every distributed image on this state, with its meta.
    all_distributed: HashMap<ArrayRef, MetaRef>,
}

impl DistSymbols {
    pub fn new(state: StateId, node: Node) -> Self {
        DistSymbols {
            state,
            node,
            known_arrays: HashMap::new(),
            all_distributed: HashMap::new(),
        }
    }

    /// Registry for a fork of this state: same images, same metas, with the
    /// cross-links re-registered under the child's identity.
    pub fn fork_for(&self, child: StateId) -> Self {
        let copy = DistSymbols {
            state: child,
            node: self.node,
            known_arrays: self.known_arrays.clone(),
            all_distributed: self.all_distributed.clone(),
        };
        for (image, meta) in &copy.all_distributed {
            meta.images.borrow_mut().insert(child, image.clone());
        }
        copy
    }

    pub fn is_distributed(&self, array: &ArrayRef) -> bool {
        self.all_distributed.contains_key(array)
    }

    /// Iterate all distributed images known to this state.
    pub fn arrays(&self) -> impl Iterator<Item = &ArrayRef> {
        self.all_distributed.keys()
    }

    fn taint(node: Node, name: &str) -> String {
        format!("{name}@{node}")
    }

    fn make_global_name(array: &ArrayRef, tx: usize, src: Node) -> String {
        format!("{}{{node{}:tx{}}}", array.name(), src.id(), tx)
    }

    fn meta_of(&mut self, array: &ArrayRef, tx: usize) -> MetaRef {
        if let Some(meta) = self.all_distributed.get(array) {
            return meta.clone();
        }
        if let Some(image) = self.known_arrays.get(array) {
            return self.all_distributed[image].clone();
        }
        let global = Self::make_global_name(array, tx, self.node);
        let image = Array::new(Self::taint(self.node, &global), array.size());
        let meta = DistributedSymbol::new(global);
        meta.images.borrow_mut().insert(self.state, image.clone());
        self.known_arrays.insert(array.clone(), image.clone());
        self.all_distributed.insert(image, meta.clone());
        meta
    }

    /// The image of `array` on this state itself, creating the meta on
    /// first use. Referentially transparent per `(array, tx)`.
    pub fn locate_local(&mut self, array: &ArrayRef, tx: usize) -> ArrayRef {
        let meta = self.meta_of(array, tx);
        let image = meta
            .image_for(self.state)
            .expect("own image registered with the meta");
        image
    }

    /// The image of `array` on `target`'s state, creating meta and image as
    /// needed. Repeated invocation returns the same image object.
    pub fn locate(&mut self, array: &ArrayRef, tx: usize, target: &mut DistSymbols) -> ArrayRef {
        let meta = self.meta_of(array, tx);
        let existing = meta.image_for(target.state);
        if let Some(image) = existing {
            return image;
        }
        let image = Array::new(
            Self::taint(target.node, &meta.global_name),
            array.size(),
        );
        meta.images
            .borrow_mut()
            .insert(target.state, image.clone());
        target.all_distributed.insert(image.clone(), meta.clone());
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symnet_shared::FIRST_NODE;

    fn registry(state: u32, node: i32) -> DistSymbols {
        DistSymbols::new(StateId(state), Node(node))
    }

    #[test]
    fn locate_is_stable() {
        let mut src = registry(0, 1);
        let mut dst = registry(1, 2);
        let a = Array::new("a", 2);

        let t1 = src.locate(&a, 1, &mut dst);
        let t2 = src.locate(&a, 1, &mut dst);
        assert_eq!(t1, t2);
        assert_eq!(t1.name(), "a{node1:tx1}@2");
        assert!(dst.is_distributed(&t1));
        assert!(!dst.is_distributed(&a));
    }

    #[test]
    fn local_image_is_tainted_with_own_node() {
        let mut src = registry(0, 1);
        let a = Array::new("a", 2);
        let local = src.locate_local(&a, 3);
        assert_eq!(local.name(), "a{node1:tx3}@1");
        assert!(src.is_distributed(&local));
        // locating the image again resolves through the meta, not a new one
        assert_eq!(src.locate_local(&local, 9), local);
    }

    #[test]
    fn distinct_sources_make_distinct_globals() {
        let mut src1 = registry(0, FIRST_NODE.id());
        let mut src2 = registry(1, 2);
        let mut dst = registry(2, 3);
        let a = Array::new("x", 1);
        let b = Array::new("x", 1);
        let i1 = src1.locate(&a, 1, &mut dst);
        let i2 = src2.locate(&b, 1, &mut dst);
        let i3 = src1.locate(&a, 2, &mut dst);
        assert_ne!(i1.name(), i2.name());
        assert_ne!(i1.name(), i3.name());
    }

    #[test]
    fn fork_carries_registry_and_cross_links() {
        let mut src = registry(0, 1);
        let mut dst = registry(1, 2);
        let a = Array::new("a", 1);
        let img = src.locate(&a, 1, &mut dst);

        let child = dst.fork_for(StateId(7));
        assert!(child.is_distributed(&img));
        // the meta now knows the child's image, and it is the same object
        let meta = child.all_distributed.get(&img).unwrap();
        assert_eq!(meta.image_for(StateId(7)).unwrap(), img);
        // a later locate towards the child resolves to that image
        let mut child = child;
        let again = src.locate(&a, 1, &mut child);
        assert_eq!(again, img);
    }
}
