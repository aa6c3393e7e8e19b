// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Copy-on-Branch: the baseline mapping algorithm.
//!
//! A DState table slot holds exactly one state; any divergence is resolved
//! proactively when a state forks, by force-forking every peer of its
//! scenario into a twin DState. Mapping itself is a no-op because ambiguity
//! is impossible by construction, at the price of `O(nodes)` engine forks
//! per branch and scenario-count doubling.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use symnet_shared::{Node, INVALID_NODE};

use super::cluster::ClusterId;
use super::{DStateId, ForkHost, MapperCore, Slab};
use crate::executor::StateId;

#[derive(Debug, Clone)]
struct CobInfo {
    node: Node,
    dstate: DStateId,
}

#[derive(Debug)]
struct CobDState {
    slots: BTreeMap<Node, StateId>,
    cluster: ClusterId,
    /// Twin under construction during a fork cascade; peers forked inside
    /// the cascade join it instead of cascading again.
    branch_to: Option<DStateId>,
}

#[derive(Debug)]
pub(super) struct CobMapper {
    records: HashMap<StateId, CobInfo>,
    dstates: Slab<CobDState>,
    dscenarios: u64,
}

impl CobMapper {
    pub fn new(core: &mut MapperCore, root: StateId) -> Self {
        let mut m = CobMapper {
            records: HashMap::new(),
            dstates: Slab::default(),
            dscenarios: 1,
        };
        let cluster = core.clusters.new_cluster();
        let ds = DStateId(m.dstates.insert(CobDState {
            slots: BTreeMap::new(),
            cluster,
            branch_to: None,
        }));
        m.records.insert(
            root,
            CobInfo {
                node: INVALID_NODE,
                dstate: ds,
            },
        );
        m
    }

    fn ds(&self, id: DStateId) -> &CobDState {
        self.dstates.get(id.0)
    }

    fn ds_mut(&mut self, id: DStateId) -> &mut CobDState {
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
            self.ds_mut(ds).slots.remove(&old);
        }
        let evicted = self.ds_mut(ds).slots.insert(node, state);
        assert!(
            evicted.is_none(),
            "two states on one node in a Copy-on-Branch scenario"
        );
        let cluster = self.ds(ds).cluster;
        core.clusters.join(cluster, state);
    }

    pub fn on_fork(
        &mut self,
        core: &mut MapperCore,
        host: &mut dyn ForkHost,
        parent: StateId,
        child: StateId,
    ) {
        let pinfo = match self.records.get(&parent) {
            Some(i) => i.clone(),
            None => return,
        };
        if !pinfo.node.is_valid() {
            self.records.insert(child, pinfo);
            return;
        }
        let ds = pinfo.dstate;
        let target = match self.ds(ds).branch_to {
            Some(twin) => twin,
            None => {
                // this fork causes the branch: twin the scenario and
                // force-fork every peer into it
                let cluster = core.clusters.new_cluster();
                let twin = DStateId(self.dstates.insert(CobDState {
                    slots: BTreeMap::new(),
                    cluster,
                    branch_to: None,
                }));
                self.ds_mut(ds).branch_to = Some(twin);
                self.dscenarios += 1;
                let peers: Vec<StateId> = self
                    .ds(ds)
                    .slots
                    .iter()
                    .filter(|(n, _)| **n != pinfo.node)
                    .map(|(_, s)| *s)
                    .collect();
                for peer in peers {
                    let peer_child = core.fork(host, peer);
                    self.on_fork(core, host, peer, peer_child);
                }
                self.ds_mut(ds).branch_to = None;
                twin
            }
        };
        self.records.insert(
            child,
            CobInfo {
                node: pinfo.node,
                dstate: target,
            },
        );
        let evicted = self.ds_mut(target).slots.insert(pinfo.node, child);
        assert!(evicted.is_none(), "twin scenario slot already occupied");
        let cluster = self.ds(target).cluster;
        core.clusters.join(cluster, child);
    }

    pub fn map(&mut self, _core: &mut MapperCore, _host: &mut dyn ForkHost, _s: StateId, _d: Node) {
        // conflicts were resolved when the branch arrived
    }

    pub fn phony_map(
        &mut self,
        _core: &mut MapperCore,
        _host: &mut dyn ForkHost,
        _senders: &[StateId],
        _dest: Node,
    ) {
    }

    pub fn find_targets(&mut self, core: &mut MapperCore, state: StateId, dest: Node) {
        let info = &self.records[&state];
        let target = self.ds(info.dstate).slots.get(&dest).copied();
        if let Some(t) = target {
            core.found_target(t);
        }
    }

    pub fn remove(&mut self, core: &mut MapperCore, states: &BTreeSet<StateId>) {
        if states.is_empty() {
            return;
        }
        let ds = self.records[states.iter().next().expect("non-empty")].dstate;
        debug_assert!(states.iter().all(|s| self.records[s].dstate == ds));
        let removed = self.dstates.remove(ds.0);
        debug_assert!(removed.slots.len() == states.len());
        for s in removed.slots.values() {
            core.clusters.depart(removed.cluster, *s);
        }
        core.clusters.free(removed.cluster);
    }

    pub fn drop_record(&mut self, _core: &mut MapperCore, state: StateId) {
        // cluster membership was settled when the scenario was removed;
        // unattached records never joined one
        self.records.remove(&state);
    }

    pub fn cluster_of(&self, state: StateId) -> Option<ClusterId> {
        let info = self.records.get(&state)?;
        Some(self.ds(info.dstate).cluster)
    }

    pub fn count_current(&self) -> u64 {
        self.dstates.len() as u64
    }

    pub fn count_total(&self) -> u64 {
        self.dscenarios
    }
}
