// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The state mapper: distributed-scenario bookkeeping.
//!
//! A *DScenario* is an equivalence class of per-node states that are
//! mutually consistent. Mapping is the operation that, on a transmission,
//! guarantees every sender sees exactly one peer per destination node,
//! forking engine states and splitting scenarios where the association
//! would otherwise be ambiguous. Four algorithms implement the contract
//! with very different cost profiles; see the per-module docs.

use std::collections::BTreeSet;
use std::fmt;

use symnet_shared::{Node, INVALID_NODE};

use crate::executor::{Executor, StateId};

pub mod cluster;
mod cob;
mod cow;
mod sds;

pub use cluster::ClusterId;

/// Which mapping algorithm a run uses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MappingAlgorithm {
    /// Fork whole scenarios eagerly at engine-fork time.
    CopyOnBranch,
    /// Split scenarios on transmission; one clone per rival.
    CopyOnWrite,
    /// Split scenarios on transmission; a single clone per map call.
    CopyOnWrite2,
    /// Virtual states with per-super-rival forking. The default.
    SuperDState,
    /// Super-DState plus breadth-first search clustering.
    SuperDStateBfClustering,
    /// Super-DState plus clustering; currently backed by the same
    /// reachability graph as [`MappingAlgorithm::SuperDStateBfClustering`].
    SuperDStateSmartClustering,
}

impl MappingAlgorithm {
    pub fn supports_clustering(&self) -> bool {
        matches!(
            self,
            MappingAlgorithm::CopyOnBranch
                | MappingAlgorithm::CopyOnWrite
                | MappingAlgorithm::CopyOnWrite2
                | MappingAlgorithm::SuperDStateBfClustering
                | MappingAlgorithm::SuperDStateSmartClustering
        )
    }
}

pub type NodeSet = BTreeSet<Node>;

/// The engine fork primitive, as consumed by the mappers.
pub trait ForkHost {
    fn fork_state(&mut self, state: StateId) -> StateId;
}

impl ForkHost for Executor {
    fn fork_state(&mut self, state: StateId) -> StateId {
        self.fork(state)
    }
}

/// Identifier of a DState inside one mapper.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DStateId(u32);

impl fmt::Debug for DStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Small slab arena with id recycling; mapper-internal storage.
#[derive(Debug, Clone)]
pub(crate) struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Slab {
            items: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> Slab<T> {
    pub fn insert(&mut self, value: T) -> u32 {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.items[idx as usize] = Some(value);
            idx
        } else {
            self.items.push(Some(value));
            (self.items.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, idx: u32) -> T {
        let v = self.items[idx as usize].take().expect("stale slab id");
        self.free.push(idx);
        self.live -= 1;
        v
    }

    pub fn get(&self, idx: u32) -> &T {
        self.items[idx as usize].as_ref().expect("stale slab id")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        self.items[idx as usize].as_mut().expect("stale slab id")
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .map(|(i, _)| i as u32)
    }
}

/// State shared by all mapping algorithms: the node universe, the target
/// buffer protocol, fork logging for explosions, and cluster accounting.
#[derive(Debug)]
pub struct MapperCore {
    pub phony_packets: bool,
    nodes: NodeSet,
    targets: Vec<StateId>,
    valid_targets: bool,
    truncated_dscenarios: u32,
    /// Stack of active explosion logs; every fork lands in all of them.
    fork_logs: Vec<Vec<StateId>>,
    pub clusters: cluster::ClusterTable,
}

impl MapperCore {
    fn new(phony_packets: bool) -> Self {
        MapperCore {
            phony_packets,
            nodes: NodeSet::new(),
            targets: Vec::new(),
            valid_targets: false,
            truncated_dscenarios: 0,
            fork_logs: Vec::new(),
            clusters: cluster::ClusterTable::default(),
        }
    }

    /// Fork `state` through the engine, recording the child in every open
    /// explosion log.
    pub(crate) fn fork(&mut self, host: &mut dyn ForkHost, state: StateId) -> StateId {
        let child = host.fork_state(state);
        for log in &mut self.fork_logs {
            log.push(child);
        }
        child
    }

    pub(crate) fn found_target(&mut self, target: StateId) {
        self.targets.push(target);
    }
}

/// The mapper front: admissibility checks, the find-targets protocol,
/// explosion and scenario removal, over a tagged union of algorithms.
#[derive(Debug)]
pub struct StateMapper {
    core: MapperCore,
    alg: Algorithm,
    term_depth: u32,
}

#[derive(Debug)]
enum Algorithm {
    Cob(cob::CobMapper),
    Cow(cow::CowMapper),
    Sds(sds::SdsMapper),
}

impl StateMapper {
    /// Build a mapper of the chosen algorithm and attach the root state.
    pub fn create(algorithm: MappingAlgorithm, phony_packets: bool, root: StateId) -> Self {
        let mut core = MapperCore::new(phony_packets);
        let alg = match algorithm {
            MappingAlgorithm::CopyOnBranch => {
                Algorithm::Cob(cob::CobMapper::new(&mut core, root))
            }
            MappingAlgorithm::CopyOnWrite => {
                Algorithm::Cow(cow::CowMapper::new(&mut core, root, false))
            }
            MappingAlgorithm::CopyOnWrite2 => {
                Algorithm::Cow(cow::CowMapper::new(&mut core, root, true))
            }
            MappingAlgorithm::SuperDState => {
                Algorithm::Sds(sds::SdsMapper::new(&mut core, root, false))
            }
            MappingAlgorithm::SuperDStateBfClustering
            | MappingAlgorithm::SuperDStateSmartClustering => {
                Algorithm::Sds(sds::SdsMapper::new(&mut core, root, true))
            }
        };
        StateMapper {
            core,
            alg,
            term_depth: 0,
        }
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.core.nodes
    }

    pub fn phony_packets(&self) -> bool {
        self.core.phony_packets
    }

    pub fn has_record(&self, state: StateId) -> bool {
        match &self.alg {
            Algorithm::Cob(m) => m.has_record(state),
            Algorithm::Cow(m) => m.has_record(state),
            Algorithm::Sds(m) => m.has_record(state),
        }
    }

    /// Node affiliation of a state; [`INVALID_NODE`] when unset or unknown.
    pub fn state_node(&self, state: StateId) -> Node {
        match &self.alg {
            Algorithm::Cob(m) => m.state_node(state),
            Algorithm::Cow(m) => m.state_node(state),
            Algorithm::Sds(m) => m.state_node(state),
        }
    }

    /// Affiliate a state with a node. Only legal in the boot phase, before
    /// any transmission, and only once per state.
    pub fn set_state_node(&mut self, state: StateId, node: Node) {
        assert!(node.is_valid(), "cannot move a state to the invalid node");
        self.core.nodes.insert(node);
        match &mut self.alg {
            Algorithm::Cob(m) => m.set_node(&mut self.core, state, node),
            Algorithm::Cow(m) => m.set_node(&mut self.core, state, node),
            Algorithm::Sds(m) => m.set_node(&mut self.core, state, node),
        }
        log::trace!("state {state} affiliated with node {node}");
    }

    /// Engine-fork notification: attach the child's mapping record. Under
    /// Copy-on-Branch this force-forks the whole scenario.
    pub fn on_state_forked(
        &mut self,
        host: &mut dyn ForkHost,
        parent: StateId,
        child: StateId,
    ) {
        match &mut self.alg {
            Algorithm::Cob(m) => m.on_fork(&mut self.core, host, parent, child),
            Algorithm::Cow(m) => m.on_fork(&mut self.core, parent, child),
            Algorithm::Sds(m) => m.on_fork(&mut self.core, parent, child),
        }
    }

    fn check_mapping_admissible(&self, state: StateId, dest: Node) -> bool {
        assert!(
            !self.core.valid_targets,
            "cannot map while targets are valid; invalidate first"
        );
        assert!(
            self.has_record(state),
            "state to map has no mapping record"
        );
        let src = self.state_node(state);
        assert!(
            self.core.nodes.contains(&src),
            "cannot map from a non-existent node"
        );
        if !self.core.nodes.contains(&dest) {
            log::warn!(
                "mapping towards node {dest} which has no states; known nodes: {:?}",
                self.core.nodes
            );
        }
        assert!(
            self.core.nodes.contains(&dest),
            "cannot map to a non-existent node"
        );
        // local delivery is a no-op
        src != dest
    }

    /// Ensure every receiver of `state` at `dest` is uniquely identifiable,
    /// forking states and splitting scenarios as required.
    pub fn map(&mut self, host: &mut dyn ForkHost, state: StateId, dest: Node) {
        if self.check_mapping_admissible(state, dest) {
            match &mut self.alg {
                Algorithm::Cob(m) => m.map(&mut self.core, host, state, dest),
                Algorithm::Cow(m) => m.map(&mut self.core, host, state, dest),
                Algorithm::Sds(m) => m.map(&mut self.core, host, state, dest),
            }
        }
    }

    /// Bulk form of [`StateMapper::map`] for several senders transmitting
    /// simultaneously. With phony packets enabled the algorithms exploit
    /// intra-scenario knowledge; otherwise this degenerates to a loop.
    pub fn map_all(&mut self, host: &mut dyn ForkHost, senders: &BTreeSet<StateId>, dest: Node) {
        let valid: Vec<StateId> = senders
            .iter()
            .copied()
            .filter(|s| self.check_mapping_admissible(*s, dest))
            .collect();
        if self.core.phony_packets {
            if !valid.is_empty() {
                match &mut self.alg {
                    Algorithm::Cob(m) => m.phony_map(&mut self.core, host, &valid, dest),
                    Algorithm::Cow(m) => m.phony_map(&mut self.core, host, &valid, dest),
                    Algorithm::Sds(m) => m.phony_map(&mut self.core, host, &valid, dest),
                }
            }
        } else {
            for s in valid {
                match &mut self.alg {
                    Algorithm::Cob(m) => m.map(&mut self.core, host, s, dest),
                    Algorithm::Cow(m) => m.map(&mut self.core, host, s, dest),
                    Algorithm::Sds(m) => m.map(&mut self.core, host, s, dest),
                }
            }
        }
    }

    /// Enumerate the receivers of `state` at `dest` into the target buffer.
    /// Must be paired with [`StateMapper::invalidate`].
    pub fn find_targets(&mut self, state: StateId, dest: Node) -> usize {
        assert!(
            !self.core.valid_targets,
            "cannot find targets while previous targets are valid; invalidate first"
        );
        assert!(
            self.has_record(state),
            "cannot find targets for a state without a mapping record"
        );
        assert!(
            self.core.nodes.contains(&dest),
            "cannot find targets on a non-existent destination node"
        );
        if self.state_node(state) == dest {
            // local delivery
            self.core.found_target(state);
        } else {
            match &mut self.alg {
                Algorithm::Cob(m) => m.find_targets(&mut self.core, state, dest),
                Algorithm::Cow(m) => m.find_targets(&mut self.core, state, dest),
                Algorithm::Sds(m) => m.find_targets(&mut self.core, state, dest),
            }
        }
        assert!(!self.core.targets.is_empty(), "no targets found");
        self.core.valid_targets = true;
        self.core.targets.len()
    }

    /// The targets produced by the last [`StateMapper::find_targets`].
    pub fn targets(&self) -> &[StateId] {
        assert!(self.core.valid_targets, "no valid targets");
        &self.core.targets
    }

    pub fn invalidate(&mut self) {
        self.core.valid_targets = false;
        self.core.targets.clear();
    }

    /// Explode the scenario of `state` so that it has exactly one peer on
    /// every node. States forked on behalf of `state`'s own node are
    /// reported as `siblings`.
    pub fn explode(
        &mut self,
        host: &mut dyn ForkHost,
        state: StateId,
        siblings: Option<&mut Vec<StateId>>,
    ) {
        let all = self.core.nodes.clone();
        self.explode_over(host, state, &all, &all, siblings)
    }

    /// Explosion over explicit node sets: map `state` towards every node in
    /// `clean_with_respect_to`, then repeat for every discovered peer on a
    /// node in `nuke_nodes` until fixpoint.
    pub fn explode_over(
        &mut self,
        host: &mut dyn ForkHost,
        state: StateId,
        clean_with_respect_to: &NodeSet,
        nuke_nodes: &NodeSet,
        mut siblings: Option<&mut Vec<StateId>>,
    ) {
        assert!(
            !self.core.valid_targets,
            "cannot explode while targets are valid; invalidate first"
        );
        assert!(self.has_record(state), "exploding state without a record");
        let nd = self.state_node(state);
        if nd == INVALID_NODE {
            return;
        }

        // every fork from here on lands in this log, so freshly created
        // siblings are revisited too
        self.core.fork_logs.push(Vec::new());

        for n in clean_with_respect_to {
            self.map(host, state, *n);
        }
        for n in nuke_nodes {
            if *n != nd {
                self.find_targets(state, *n);
                let found = self.core.targets.clone();
                self.invalidate();
                self.core
                    .fork_logs
                    .last_mut()
                    .expect("log frame pushed above")
                    .extend(found);
            }
        }

        #[cfg(feature = "paranoid-explosions")]
        let mut check: BTreeSet<StateId> = BTreeSet::new();

        loop {
            let Some(s) = self
                .core
                .fork_logs
                .last_mut()
                .expect("log frame pushed above")
                .pop()
            else {
                break;
            };
            #[cfg(feature = "paranoid-explosions")]
            check.insert(s);
            if let Some(siblings) = siblings.as_deref_mut() {
                if self.state_node(s) == nd && s != state {
                    siblings.push(s);
                }
            }
            if nuke_nodes.contains(&self.state_node(s)) {
                for n in clean_with_respect_to {
                    self.map(host, s, *n);
                }
            }
        }
        self.core.fork_logs.pop();

        #[cfg(feature = "paranoid-explosions")]
        {
            check.insert(state);
            for s in &check {
                for n in nuke_nodes {
                    let count = self.find_targets(*s, *n);
                    assert_eq!(count, 1, "explosion left ambiguous peers");
                    self.invalidate();
                }
            }
        }
    }

    /// Remove the entire (previously exploded) scenario of `state` from the
    /// mapper. The engine states themselves are untouched.
    pub fn remove(&mut self, state: StateId) -> Vec<StateId> {
        if !self.has_record(state) {
            return Vec::new();
        }
        if self.state_node(state) == INVALID_NODE {
            self.drop_record(state);
            return vec![state];
        }
        let mut states: BTreeSet<StateId> = BTreeSet::new();
        states.insert(state);
        for n in self.core.nodes.clone() {
            let count = self.find_targets(state, n);
            assert!(
                count == 1,
                "state was not exploded before removal: ambiguous peers on node {n}"
            );
            states.extend(self.core.targets.iter().copied());
            self.invalidate();
        }
        log::trace!("removing scenario of {state}: {states:?}");
        match &mut self.alg {
            Algorithm::Cob(m) => m.remove(&mut self.core, &states),
            Algorithm::Cow(m) => m.remove(&mut self.core, &states),
            Algorithm::Sds(m) => m.remove(&mut self.core, &states),
        }
        for s in &states {
            self.drop_record(*s);
        }
        self.core.truncated_dscenarios += 1;
        states.into_iter().collect()
    }

    fn drop_record(&mut self, state: StateId) {
        match &mut self.alg {
            Algorithm::Cob(m) => m.drop_record(&mut self.core, state),
            Algorithm::Cow(m) => m.drop_record(&mut self.core, state),
            Algorithm::Sds(m) => m.drop_record(&mut self.core, state),
        }
    }

    /// Terminate the scenario of `state`: explode it, hand the state, its
    /// node and its `(peer, node)` pairs to the callback, and recursively
    /// terminate the scenarios of siblings the explosion created. Returns
    /// whether `state` was known to the mapper; nested recursion is
    /// reported to the log.
    pub fn terminate_cluster(
        &mut self,
        host: &mut dyn ForkHost,
        state: StateId,
        terminate: &mut dyn FnMut(StateId, Node, &[(StateId, Node)]),
    ) -> bool {
        self.term_depth += 1;
        let known = self.has_record(state) && self.state_node(state) != INVALID_NODE;
        log::trace!(
            "terminating cluster (depth {}) around {state}, known={known}",
            self.term_depth
        );
        let nd = self.state_node(state);
        let mut targets: Vec<(StateId, Node)> = Vec::new();
        let mut siblings: Vec<StateId> = Vec::new();

        if known {
            self.explode(host, state, Some(&mut siblings));
            for n in self.core.nodes.clone() {
                if n != nd {
                    self.find_targets(state, n);
                    targets.extend(self.core.targets.iter().map(|t| (*t, n)));
                    self.invalidate();
                }
            }
            assert_eq!(
                targets.len(),
                self.core.nodes.len().saturating_sub(1),
                "incorrect number of targets after explosion"
            );
        }

        self.remove(state);
        terminate(state, nd, &targets);

        for sib in siblings {
            if sib != state && self.terminate_cluster(host, sib, terminate) {
                log::trace!("nested cluster termination of {sib} ignored");
            }
        }
        self.term_depth -= 1;
        known
    }

    /// Cluster of `state` for scheduler partitioning, when the algorithm
    /// maintains one.
    pub fn cluster_of(&self, state: StateId) -> Option<ClusterId> {
        match &self.alg {
            Algorithm::Cob(m) => m.cluster_of(state),
            Algorithm::Cow(m) => m.cluster_of(state),
            Algorithm::Sds(m) => m.cluster_of(state),
        }
    }

    /// Drain the states whose cluster changed since the last call; the
    /// cluster-partitioned searcher re-homes them.
    pub fn take_cluster_changes(&mut self) -> Vec<StateId> {
        self.core.clusters.take_changes()
    }

    pub fn truncated_dscenarios(&self) -> u32 {
        self.core.truncated_dscenarios
    }

    /// Scenarios currently represented by the mapper.
    pub fn count_current_dscenarios(&self) -> u64 {
        match &self.alg {
            Algorithm::Cob(m) => m.count_current(),
            Algorithm::Cow(m) => m.count_current(),
            Algorithm::Sds(m) => m.count_current(),
        }
    }

    /// Scenarios ever explored, including removed ones.
    pub fn count_total_dscenarios(&self) -> u64 {
        match &self.alg {
            Algorithm::Cob(m) => m.count_total(),
            Algorithm::Cow(m) => m.count_current() + self.core.truncated_dscenarios as u64,
            Algorithm::Sds(m) => m.count_current() + self.core.truncated_dscenarios as u64,
        }
    }
}
