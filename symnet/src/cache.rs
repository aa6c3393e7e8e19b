// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The packet cache: deduplication of pending transmissions.
//!
//! Pending packets are grouped by [`PacketInfo`] (destination node plus
//! destination memory range) and, within a group, by a trie over the
//! payload byte atoms. Concrete atoms share a trie edge by value, symbolic
//! atoms by expression identity, so all senders that agree on the payload
//! end up in the same leaf and can be mapped in one batch when the
//! scheduler reaches a quiescent point.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use symnet_shared::error::Result;
use symnet_shared::expr::{Expr, ExprRef};
use symnet_shared::Node;

use crate::executor::{Executor, MemId, StateId};
use crate::mapper::StateMapper;

/// One byte of payload as cached: a concrete value or a symbolic
/// expression compared by identity.
#[derive(Clone, Debug)]
pub enum DataAtom {
    Concrete(u8),
    Symbolic(ExprRef),
}

impl DataAtom {
    pub fn of(e: &ExprRef) -> DataAtom {
        match (&**e, e.as_const()) {
            (Expr::Constant { .. }, Some(v)) => DataAtom::Concrete(v as u8),
            _ => DataAtom::Symbolic(e.clone()),
        }
    }

    pub fn to_expr(&self) -> ExprRef {
        match self {
            DataAtom::Concrete(v) => symnet_shared::expr::constant(*v as u64, 8),
            DataAtom::Symbolic(e) => e.clone(),
        }
    }

    fn rank(&self) -> (u8, u64) {
        match self {
            DataAtom::Concrete(v) => (0, *v as u64),
            DataAtom::Symbolic(e) => (1, e.id() as u64),
        }
    }
}

impl PartialEq for DataAtom {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for DataAtom {}

impl PartialOrd for DataAtom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DataAtom {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Identity of a transmission's destination: which node, which memory
/// object, which byte range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PacketInfo {
    pub addr: u64,
    pub offset: u64,
    pub length: usize,
    pub dest_mo: MemId,
    pub src: Node,
    pub dest: Node,
}

/// Prefix trie over payload atoms; a leaf holds the senders that agree on
/// the whole payload. Every root-to-leaf path has the same length.
#[derive(Debug, Default)]
pub struct StateTrie {
    tree: BTreeMap<DataAtom, StateTrie>,
    content: BTreeSet<StateId>,
    depth: usize,
}

impl StateTrie {
    pub fn insert(&mut self, atoms: &[DataAtom], state: StateId) -> usize {
        let d = match atoms.split_first() {
            None => {
                self.content.insert(state);
                0
            }
            Some((first, rest)) => 1 + self.tree.entry(first.clone()).or_default().insert(rest, state),
        };
        self.depth = self.depth.max(d);
        self.depth
    }

    fn collect(
        &self,
        path: &mut Vec<DataAtom>,
        remaining: usize,
        out: &mut Vec<(Vec<DataAtom>, BTreeSet<StateId>)>,
    ) {
        if !self.content.is_empty() {
            assert_eq!(remaining, 0, "ill-formed payload string: partial trie");
            out.push((path.clone(), self.content.clone()));
        }
        if !self.tree.is_empty() {
            assert!(remaining > 0, "ill-formed payload string: overlong path");
            for (atom, child) in &self.tree {
                path.push(atom.clone());
                child.collect(path, remaining - 1, out);
                path.pop();
            }
        }
    }

    /// All leaves as (payload, senders) pairs.
    pub fn leaves(&self) -> Vec<(Vec<DataAtom>, BTreeSet<StateId>)> {
        let mut out = Vec::new();
        self.collect(&mut Vec::new(), self.depth, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty() && self.content.is_empty()
    }

    fn purge_state(&mut self, state: StateId) {
        self.content.remove(&state);
        self.tree.retain(|_, child| {
            child.purge_state(state);
            !child.is_empty()
        });
    }
}

/// Delivery callback invoked once per (sender, receiver) pair at commit.
pub trait Transmitter {
    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &mut self,
        exec: &mut Executor,
        pi: &PacketInfo,
        sender: StateId,
        sender_node: Node,
        receiver: StateId,
        receiver_node: Node,
        data: &[DataAtom],
    ) -> Result<()>;
}

/// The cache proper. Owned by the run environment; lives exactly as long
/// as the top-level run.
#[derive(Default)]
pub struct PacketCache {
    packets: BTreeMap<PacketInfo, StateTrie>,
    commit_hooks: Vec<Box<dyn FnMut(Node)>>,
}

impl std::fmt::Debug for PacketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCache")
            .field("packets", &self.packets)
            .field("commit_hooks", &self.commit_hooks.len())
            .finish()
    }
}

impl PacketCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queue a pending transmission. Empty payloads are unsupported.
    pub fn cache_packet(&mut self, sender: StateId, pi: PacketInfo, data: &[DataAtom]) {
        assert!(!data.is_empty(), "transmitting empty packets is unsupported");
        self.packets.entry(pi).or_default().insert(data, sender);
        log::trace!(
            "cached packet of {sender} to node {} ({} atom(s))",
            pi.dest,
            data.len()
        );
    }

    pub fn pending(&self) -> usize {
        self.packets.len()
    }

    /// Register a hook to run (once) after the next commit.
    pub fn on_commit(&mut self, hook: Box<dyn FnMut(Node)>) {
        self.commit_hooks.push(hook);
    }

    /// Drain the cache: per leaf, map all senders in one batch, then hand
    /// every (sender, receiver) pair to the transmitter.
    pub fn commit(
        &mut self,
        exec: &mut Executor,
        mapper: &mut StateMapper,
        transmitter: &mut dyn Transmitter,
    ) -> Result<()> {
        let packets = std::mem::take(&mut self.packets);
        for (pi, trie) in packets {
            for (payload, senders) in trie.leaves() {
                mapper.map_all(&mut *exec, &senders, pi.dest);
                for sender in &senders {
                    mapper.find_targets(*sender, pi.dest);
                    let targets = mapper.targets().to_vec();
                    mapper.invalidate();
                    for receiver in targets {
                        transmitter.transmit(
                            exec,
                            &pi,
                            *sender,
                            mapper.state_node(*sender),
                            receiver,
                            mapper.state_node(receiver),
                            &payload,
                        )?;
                    }
                    exec.state_mut(*sender).completed_transmissions += 1;
                }
            }
            let mut hooks = std::mem::take(&mut self.commit_hooks);
            for hook in &mut hooks {
                hook(pi.dest);
            }
        }
        Ok(())
    }

    /// Forget a state that terminated while its packets were pending.
    pub fn remove_state(&mut self, state: StateId) {
        self.packets.retain(|_, trie| {
            trie.purge_state(state);
            !trie.is_empty()
        });
    }
}
