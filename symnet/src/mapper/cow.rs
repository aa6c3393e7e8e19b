// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Copy-on-Write mapping, in two flavours.
//!
//! DState slots hold lists of states, so rivals are allowed to accumulate
//! until a transmission forces a decision. The naive variant (CoW1) clones
//! the scenario once per rival and re-forks every neighbour into every
//! clone; the minimal-split variant (CoW2) clones exactly once, migrates
//! only the sender, and leaves the remaining rivals to later map calls,
//! which restores consistency implicitly at a fraction of the forks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use symnet_shared::{Node, INVALID_NODE};

use super::cluster::ClusterId;
use super::{DStateId, ForkHost, MapperCore, Slab};
use crate::executor::StateId;

#[derive(Debug, Clone)]
struct CowInfo {
    node: Node,
    dstate: DStateId,
}

#[derive(Debug)]
struct CowDState {
    slots: BTreeMap<Node, Vec<StateId>>,
    cluster: ClusterId,
}

#[derive(Debug)]
pub(super) struct CowMapper {
    /// CoW2 when set: abort the rival scan at the first hit and split once.
    minimal_split: bool,
    records: HashMap<StateId, CowInfo>,
    dstates: Slab<CowDState>,
}

impl CowMapper {
    pub fn new(core: &mut MapperCore, root: StateId, minimal_split: bool) -> Self {
        let mut m = CowMapper {
            minimal_split,
            records: HashMap::new(),
            dstates: Slab::default(),
        };
        let cluster = core.clusters.new_cluster();
        let ds = DStateId(m.dstates.insert(CowDState {
            slots: BTreeMap::new(),
            cluster,
        }));
        m.records.insert(
            root,
            CowInfo {
                node: INVALID_NODE,
                dstate: ds,
            },
        );
        m
    }

    fn ds(&self, id: DStateId) -> &CowDState {
        self.dstates.get(id.0)
    }

    fn ds_mut(&mut self, id: DStateId) -> &mut CowDState {
        self.dstates.get_mut(id.0)
    }

    pub fn has_record(&self, state: StateId) -> bool {
        self.records.contains_key(&state)
    }

    pub fn state_node(&self, state: StateId) -> Node {
        self.records
            .get(&state)
            .map(|i| i.node)
            .unwrap_or(INVALID_NODE)
    }

    pub fn set_node(&mut self, core: &mut MapperCore, state: StateId, node: Node) {
        let info = self
            .records
            .get_mut(&state)
            .expect("setting node of an unknown state");
        let ds = info.dstate;
        let old = info.node;
        info.node = node;
        if old.is_valid() {
            self.ds_mut(ds)
                .slots
                .get_mut(&old)
                .expect("slot of previous node")
                .retain(|s| *s != state);
        }
        self.ds_mut(ds).slots.entry(node).or_default().push(state);
        let cluster = self.ds(ds).cluster;
        core.clusters.join(cluster, state);
    }

    pub fn on_fork(&mut self, core: &mut MapperCore, parent: StateId, child: StateId) {
        let pinfo = match self.records.get(&parent) {
            Some(i) => i.clone(),
            None => return,
        };
        self.records.insert(child, pinfo.clone());
        if pinfo.node.is_valid() {
            // the fork joins the same scenario as a rival
            self.ds_mut(pinfo.dstate)
                .slots
                .entry(pinfo.node)
                .or_default()
                .push(child);
            let cluster = self.ds(pinfo.dstate).cluster;
            core.clusters.join(cluster, child);
        }
    }

    /// Clone the scenario skeleton: same node universe, no members yet.
    fn clone_dstate(&mut self, core: &mut MapperCore, _from: DStateId) -> DStateId {
        let cluster = core.clusters.new_cluster();
        DStateId(self.dstates.insert(CowDState {
            slots: BTreeMap::new(),
            cluster,
        }))
    }

    fn move_peer(&mut self, core: &mut MapperCore, state: StateId, to: DStateId) {
        let info = self.records.get_mut(&state).expect("moving unknown state");
        let from = info.dstate;
        let node = info.node;
        info.dstate = to;
        self.ds_mut(from)
            .slots
            .get_mut(&node)
            .expect("slot of source scenario")
            .retain(|s| *s != state);
        self.ds_mut(to).slots.entry(node).or_default().push(state);
        let from_cluster = self.ds(from).cluster;
        let to_cluster = self.ds(to).cluster;
        core.clusters.depart(from_cluster, state);
        core.clusters.join(to_cluster, state);
    }

    pub fn map(&mut self, core: &mut MapperCore, host: &mut dyn ForkHost, state: StateId, _dest: Node) {
        let info = self.records[&state].clone();
        let nd = info.node;
        let ds = info.dstate;

        let mut rivals: Vec<StateId> = Vec::new();
        for s in &self.ds(ds).slots[&nd] {
            if *s != state {
                rivals.push(*s);
                if self.minimal_split {
                    break;
                }
            }
        }
        if rivals.is_empty() {
            return;
        }
        log::trace!("state {state} has {} rival(s) on node {nd}", rivals.len());

        // destination scenarios for the neighbour copies
        let clones: Vec<DStateId> = if self.minimal_split {
            let clone = self.clone_dstate(core, ds);
            self.move_peer(core, state, clone);
            vec![clone]
        } else {
            rivals
                .iter()
                .map(|rival| {
                    let clone = self.clone_dstate(core, ds);
                    self.move_peer(core, *rival, clone);
                    clone
                })
                .collect()
        };

        // every inhabitant of the original scenario on a foreign node gets
        // forked into each clone
        let neighbours: Vec<StateId> = self
            .ds(ds)
            .slots
            .iter()
            .filter(|(n, _)| **n != nd)
            .flat_map(|(_, slot)| slot.iter().copied())
            .collect();
        for nb in neighbours {
            for clone in &clones {
                let fork = core.fork(host, nb);
                self.on_fork(core, nb, fork);
                self.move_peer(core, fork, *clone);
            }
        }
    }

    pub fn phony_map(
        &mut self,
        core: &mut MapperCore,
        host: &mut dyn ForkHost,
        senders: &[StateId],
        dest: Node,
    ) {
        let mut chunks: BTreeMap<DStateId, Vec<StateId>> = BTreeMap::new();
        for s in senders {
            chunks.entry(self.records[s].dstate).or_default().push(*s);
        }
        // each scenario can be handled independently
        for (ds, chunk) in chunks {
            let pivot = chunk[0];
            let nd = self.records[&pivot].node;
            let slot_len = self.ds(ds).slots[&nd].len();
            assert!(slot_len >= chunk.len(), "inconsistent DState information");
            if slot_len > chunk.len() {
                // not all rivals are sending, so a split is required
                self.map(core, host, pivot, dest);
                if self.minimal_split {
                    // sneak the co-senders over into the pivot's new home
                    let home = self.records[&pivot].dstate;
                    for brother in &chunk[1..] {
                        self.move_peer(core, *brother, home);
                    }
                }
                // the naive variant unrivalled everyone already
            }
        }
    }

    pub fn find_targets(&mut self, core: &mut MapperCore, state: StateId, dest: Node) {
        let ds = self.records[&state].dstate;
        if let Some(slot) = self.ds(ds).slots.get(&dest) {
            for t in slot {
                core.found_target(*t);
            }
        }
    }

    pub fn remove(&mut self, core: &mut MapperCore, states: &BTreeSet<StateId>) {
        if states.is_empty() {
            return;
        }
        let ds = self.records[states.iter().next().expect("non-empty")].dstate;
        debug_assert!(states.iter().all(|s| self.records[s].dstate == ds));
        let removed = self.dstates.remove(ds.0);
        for slot in removed.slots.values() {
            for s in slot {
                core.clusters.depart(removed.cluster, *s);
            }
        }
        core.clusters.free(removed.cluster);
    }

    pub fn drop_record(&mut self, _core: &mut MapperCore, state: StateId) {
        self.records.remove(&state);
    }

    pub fn cluster_of(&self, state: StateId) -> Option<ClusterId> {
        let info = self.records.get(&state)?;
        Some(self.ds(info.dstate).cluster)
    }

    pub fn count_current(&self) -> u64 {
        self.dstates
            .iter_ids()
            .map(|id| {
                self.dstates
                    .get(id)
                    .slots
                    .values()
                    .map(|slot| slot.len() as u64)
                    .product::<u64>()
            })
            .sum()
    }
}
