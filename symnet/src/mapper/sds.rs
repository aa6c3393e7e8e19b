// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Super-DState mapping: the default algorithm.
//!
//! Engine states are decoupled from scenarios through *virtual states*: an
//! engine state owns a set of VStates, each living in exactly one DState
//! slot. A transmission splits rivalled DStates cheaply (VState surgery
//! only) and spends engine forks exclusively on *super-rivals*, receiver
//! states whose VStates are only partially targeted. The cost is thereby
//! amortised: one fork per super-rival, zero for plain DState splits.
//!
//! With clustering enabled a bipartite reachability graph over
//! state-records and DStates partitions the pool into independently
//! schedulable clusters, merged on edge insertion and split by BFS on edge
//! removal.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use symnet_shared::{Node, INVALID_NODE};

use super::cluster::ClusterId;
use super::{DStateId, ForkHost, MapperCore, Slab};
use crate::executor::StateId;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct VStateId(u32);

impl fmt::Debug for VStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug)]
struct VState {
    state: StateId,
    dstate: Option<DStateId>,
    is_target: bool,
}

#[derive(Debug)]
struct SdsInfo {
    node: Node,
    vstates: Vec<VStateId>,
    /// Number of virtual packets currently aimed at this state; reset to
    /// zero after each mapping pass.
    input: usize,
    was_found: bool,
    cluster: ClusterId,
}

#[derive(Debug, Default)]
struct SdsDState {
    slots: BTreeMap<Node, Vec<VStateId>>,
    /// Most recent clone; only valid while the DState is marked.
    heir: Option<DStateId>,
    marked: bool,
}

#[derive(Debug)]
pub(super) struct SdsMapper {
    clustering: bool,
    records: HashMap<StateId, SdsInfo>,
    vstates: Slab<VState>,
    dstates: Slab<SdsDState>,
    /// The boot-phase DState; gone after the first transmission.
    root: Option<DStateId>,
    marked: Vec<DStateId>,
    /// Suspends the automatic vstate duplication on engine forks while the
    /// mapper itself is forking.
    ignore_proper_branches: u32,
    /// Lazily mirrored cluster of each DState.
    dstate_clusters: HashMap<DStateId, ClusterId>,
}

impl SdsMapper {
    pub fn new(core: &mut MapperCore, root_state: StateId, clustering: bool) -> Self {
        let mut m = SdsMapper {
            clustering,
            records: HashMap::new(),
            vstates: Slab::default(),
            dstates: Slab::default(),
            root: None,
            marked: Vec::new(),
            ignore_proper_branches: 0,
            dstate_clusters: HashMap::new(),
        };
        m.root = Some(DStateId(m.dstates.insert(SdsDState::default())));
        m.new_record(core, root_state, INVALID_NODE);
        m
    }

    fn new_record(&mut self, core: &mut MapperCore, state: StateId, node: Node) {
        let cluster = core.clusters.new_cluster();
        core.clusters.join(cluster, state);
        self.records.insert(
            state,
            SdsInfo {
                node,
                vstates: Vec::new(),
                input: 0,
                was_found: false,
                cluster,
            },
        );
    }

    fn ds(&self, id: DStateId) -> &SdsDState {
        self.dstates.get(id.0)
    }

    fn ds_mut(&mut self, id: DStateId) -> &mut SdsDState {
        self.dstates.get_mut(id.0)
    }

    fn vs(&self, id: VStateId) -> &VState {
        self.vstates.get(id.0)
    }

    fn state_of(&self, v: VStateId) -> StateId {
        self.vs(v).state
    }

    fn node_of(&self, v: VStateId) -> Node {
        self.records[&self.state_of(v)].node
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

    fn multiplicity(&self, state: StateId) -> usize {
        self.records[&state].vstates.len()
    }

    /// Create a fresh vstate owned by `owner`, not yet in any DState.
    fn new_vstate(&mut self, owner: StateId) -> VStateId {
        let v = VStateId(self.vstates.insert(VState {
            state: owner,
            dstate: None,
            is_target: false,
        }));
        self.records
            .get_mut(&owner)
            .expect("vstate owner has a record")
            .vstates
            .push(v);
        v
    }

    /// Put `v` into `ds`, leaving its previous DState if any.
    fn adopt(&mut self, core: &mut MapperCore, ds: DStateId, v: VStateId) {
        if self.vs(v).dstate.is_some() {
            self.abandon(core, v);
        }
        let node = self.node_of(v);
        self.ds_mut(ds).slots.entry(node).or_default().push(v);
        self.vstates.get_mut(v.0).dstate = Some(ds);
        let owner = self.state_of(v);
        self.edge_added(core, owner, ds);
    }

    fn abandon(&mut self, core: &mut MapperCore, v: VStateId) {
        let ds = self.vs(v).dstate.expect("abandoning a free vstate");
        let node = self.node_of(v);
        self.ds_mut(ds)
            .slots
            .get_mut(&node)
            .expect("vstate slot")
            .retain(|x| *x != v);
        self.vstates.get_mut(v.0).dstate = None;
        let owner = self.state_of(v);
        self.edge_removed(core, owner, ds);
    }

    /// Hand `v` over to another engine state on the same node.
    fn move_to(&mut self, core: &mut MapperCore, v: VStateId, new_owner: StateId) {
        let old_owner = self.state_of(v);
        assert_eq!(
            self.records[&old_owner].node, self.records[&new_owner].node,
            "cannot move a vstate to a different node"
        );
        self.records
            .get_mut(&old_owner)
            .expect("old owner record")
            .vstates
            .retain(|x| *x != v);
        self.vstates.get_mut(v.0).state = new_owner;
        self.records
            .get_mut(&new_owner)
            .expect("new owner record")
            .vstates
            .push(v);
        if let Some(ds) = self.vs(v).dstate {
            self.edge_removed(core, old_owner, ds);
            self.edge_added(core, new_owner, ds);
        }
    }

    fn clone_dstate(&mut self, from: DStateId) -> DStateId {
        let heir = DStateId(self.dstates.insert(SdsDState::default()));
        self.ds_mut(from).heir = Some(heir);
        heir
    }

    fn mark(&mut self, ds: DStateId) {
        if !self.ds(ds).marked {
            self.ds_mut(ds).marked = true;
            self.marked.push(ds);
        }
    }

    fn reset_marks(&mut self) {
        for ds in std::mem::take(&mut self.marked) {
            self.ds_mut(ds).marked = false;
        }
    }

    fn heir_of(&self, ds: DStateId) -> DStateId {
        debug_assert!(self.ds(ds).marked, "heir is only valid while marked");
        self.ds(ds).heir.expect("marked DState has an heir")
    }

    pub fn set_node(&mut self, core: &mut MapperCore, state: StateId, node: Node) {
        let root = self
            .root
            .expect("cannot change node affiliation after transmissions");
        assert_eq!(
            self.dstates.len(),
            1,
            "cannot change node affiliation after DState branches"
        );
        {
            let info = self
                .records
                .get_mut(&state)
                .expect("setting node of an unknown state");
            assert!(
                info.vstates.is_empty(),
                "state already has virtual states; node id set twice?"
            );
            info.node = node;
        }
        let v = self.new_vstate(state);
        self.adopt(core, root, v);
    }

    pub fn on_fork(&mut self, core: &mut MapperCore, parent: StateId, child: StateId) {
        let Some(pinfo) = self.records.get(&parent) else {
            return;
        };
        let node = pinfo.node;
        let parent_vstates = pinfo.vstates.clone();
        self.new_record(core, child, node);
        if self.ignore_proper_branches == 0 && node.is_valid() {
            // mirror the parent: one twin vstate per parent vstate, in the
            // same DStates
            assert!(!parent_vstates.is_empty());
            for pv in parent_vstates {
                let ds = self.vs(pv).dstate.expect("booted vstate has a DState");
                let nv = self.new_vstate(child);
                self.adopt(core, ds, nv);
            }
        }
    }

    pub fn map(&mut self, core: &mut MapperCore, host: &mut dyn ForkHost, es: StateId, dest: Node) {
        self.root = None;
        self.ignore_proper_branches += 1;
        let send = self.records[&es].node;
        assert!(send.is_valid());
        assert!(self.multiplicity(es) > 0);
        self.reset_marks();

        // vstates of receivers; kept for clearing the target flags
        let mut target_vstates: Vec<VStateId> = Vec::new();
        // receiver states, possibly repeated once per vstate
        let mut super_targets: Vec<StateId> = Vec::new();

        // find targets; split DStates that carry direct rivals
        for sender_v in self.records[&es].vstates.clone() {
            let ds = self.vs(sender_v).dstate.expect("sender vstate has a DState");
            let rivals = self
                .ds(ds)
                .slots
                .get(&send)
                .map(|slot| slot.len() > 1)
                .unwrap_or(false);
            if rivals {
                if !self.ds(ds).marked {
                    // the heir is only trustworthy while the mark is set
                    self.mark(ds);
                    self.clone_dstate(ds);
                }
                // the rivalled sender vstate migrates to the naked clone
                let heir = self.heir_of(ds);
                self.adopt(core, heir, sender_v);
            }
            for rv in self
                .ds(ds)
                .slots
                .get(&dest)
                .cloned()
                .unwrap_or_default()
            {
                self.vstates.get_mut(rv.0).is_target = true;
                target_vstates.push(rv);
                let ti = self.state_of(rv);
                self.records.get_mut(&ti).expect("target record").input += 1;
                super_targets.push(ti);
            }
        }

        // decide which receiver states must fork: super-rivals (partially
        // targeted) and states touching split DStates
        for st in super_targets {
            if self.records[&st].input == 0 {
                continue;
            }
            let input = self.records[&st].input;
            let mult = self.multiplicity(st);
            let mut br = input < mult;
            if !br {
                br = self.records[&st]
                    .vstates
                    .iter()
                    .any(|v| self.vs(*v).dstate.map(|d| self.ds(d).marked).unwrap_or(false));
            }
            if br {
                let ns = core.fork(host, st);
                self.on_fork(core, st, ns);
                let mut migrate: Vec<VStateId> = Vec::new();
                for v in self.records[&st].vstates.clone() {
                    if !self.vs(v).is_target {
                        continue;
                    }
                    let ods = self.vs(v).dstate.expect("target vstate has a DState");
                    if self.ds(ods).marked {
                        // the DState was split: the fork gets a fresh
                        // vstate in the heir, the original keeps its place
                        let heir = self.heir_of(ods);
                        let nv = self.new_vstate(ns);
                        self.adopt(core, heir, nv);
                    } else {
                        // plain super-rival: migrate the receiving vstate
                        migrate.push(v);
                    }
                }
                for v in migrate {
                    self.move_to(core, v, ns);
                }
            }
            self.records.get_mut(&st).expect("target record").input = 0;
        }

        // fill the heirs: duplicate every slot that is neither the sender's
        // nor the destination node
        for ds in self.marked.clone() {
            let heir = self.heir_of(ds);
            let bystanders: Vec<VStateId> = self
                .ds(ds)
                .slots
                .iter()
                .filter(|(n, _)| **n != dest && **n != send)
                .flat_map(|(_, slot)| slot.iter().copied())
                .collect();
            for v in bystanders {
                let owner = self.state_of(v);
                let nv = self.new_vstate(owner);
                self.adopt(core, heir, nv);
            }
        }

        for v in target_vstates {
            self.vstates.get_mut(v.0).is_target = false;
        }
        self.reset_marks();
        self.ignore_proper_branches -= 1;
    }

    pub fn phony_map(
        &mut self,
        core: &mut MapperCore,
        host: &mut dyn ForkHost,
        senders: &[StateId],
        dest: Node,
    ) {
        assert!(!senders.is_empty(), "empty mapping request");
        self.root = None;
        let origin = self.records[&senders[0]].node;
        self.reset_marks();

        // virtual packets: receiver vstate -> sending vstates
        let mut vpackets: BTreeMap<VStateId, BTreeSet<VStateId>> = BTreeMap::new();
        for s in senders {
            for sv in self.records[s].vstates.clone() {
                let ds = self.vs(sv).dstate.expect("sender vstate has a DState");
                for rv in self.ds(ds).slots.get(&dest).cloned().unwrap_or_default() {
                    vpackets.entry(rv).or_default().insert(sv);
                }
            }
        }

        // receiving vstates per state, after rehoming partial receivers
        let mut vtargets: BTreeMap<StateId, usize> = BTreeMap::new();
        let mut all_targets: Vec<VStateId> = Vec::new();
        for (target, sending) in &vpackets {
            let ds = self.vs(*target).dstate.expect("receiver vstate has a DState");
            let total = self
                .ds(ds)
                .slots
                .get(&origin)
                .map(|s| s.len())
                .unwrap_or(0);
            let sending = sending.len();
            assert!(sending >= 1 && sending <= total);
            let mut effective = *target;
            if sending < total {
                // only part of the scenario transmits: the packet arrives
                // in a clone of the DState
                if !self.ds(ds).marked {
                    self.clone_dstate(ds);
                    self.mark(ds);
                }
                let heir = self.heir_of(ds);
                effective = self.new_vstate(self.state_of(*target));
                self.adopt(core, heir, effective);
            }
            *vtargets.entry(self.state_of(effective)).or_default() += 1;
            assert!(!self.vs(effective).is_target);
            self.vstates.get_mut(effective.0).is_target = true;
            all_targets.push(effective);
        }

        // senders move into the heirs, bystanders are duplicated
        for ds in self.marked.clone() {
            let heir = self.heir_of(ds);
            let nodes: Vec<Node> = core.nodes.iter().copied().filter(|n| *n != dest).collect();
            for n in nodes {
                let slot: Vec<VStateId> =
                    self.ds(ds).slots.get(&n).cloned().unwrap_or_default();
                let moves: Vec<(VStateId, bool)> = slot
                    .into_iter()
                    .map(|v| (v, n == origin))
                    .collect();
                for (v, is_origin) in moves {
                    if is_origin {
                        self.adopt(core, heir, v);
                    } else {
                        let owner = self.state_of(v);
                        let nv = self.new_vstate(owner);
                        self.adopt(core, heir, nv);
                    }
                }
            }
        }

        self.ignore_proper_branches += 1;
        // fork states that have receiving and non-receiving vstates
        let mut clones: HashMap<StateId, StateId> = HashMap::new();
        let mut jobs: Vec<(VStateId, StateId)> = Vec::new();
        for (st, receiving) in &vtargets {
            let total = self.multiplicity(*st);
            assert!(total >= *receiving, "inconsistent DState");
            if total > *receiving {
                let clone = match clones.get(st) {
                    Some(c) => *c,
                    None => {
                        let c = core.fork(host, *st);
                        self.on_fork(core, *st, c);
                        clones.insert(*st, c);
                        c
                    }
                };
                for v in self.records[st].vstates.clone() {
                    if self.vs(v).is_target {
                        jobs.push((v, clone));
                    }
                }
            }
        }
        for (v, clone) in jobs {
            assert!(self.multiplicity(self.state_of(v)) > 1);
            self.move_to(core, v, clone);
        }

        for v in all_targets {
            self.vstates.get_mut(v.0).is_target = false;
        }
        self.reset_marks();
        self.ignore_proper_branches -= 1;
    }

    pub fn find_targets(&mut self, core: &mut MapperCore, state: StateId, dest: Node) {
        let mut found: Vec<StateId> = Vec::new();
        for sv in self.records[&state].vstates.clone() {
            let ds = self.vs(sv).dstate.expect("sender vstate has a DState");
            for rv in self.ds(ds).slots.get(&dest).cloned().unwrap_or_default() {
                let ti = self.state_of(rv);
                let info = self.records.get_mut(&ti).expect("target record");
                if !info.was_found {
                    info.was_found = true;
                    found.push(ti);
                }
            }
        }
        for t in &found {
            self.records.get_mut(t).expect("found record").was_found = false;
            core.found_target(*t);
        }
    }

    pub fn remove(&mut self, core: &mut MapperCore, states: &BTreeSet<StateId>) {
        if states.is_empty() {
            return;
        }
        let mut scenario_dstates: BTreeSet<DStateId> = BTreeSet::new();
        for s in states {
            let vss = self.records[s].vstates.clone();
            assert_eq!(
                vss.len(),
                1,
                "state was not exploded before removal"
            );
            let v = vss[0];
            scenario_dstates.insert(self.vs(v).dstate.expect("booted vstate has a DState"));
            self.abandon(core, v);
            self.vstates.remove(v.0);
            self.records.get_mut(s).expect("record").vstates.clear();
        }
        assert_eq!(scenario_dstates.len(), 1, "ambiguous DState");
        let ds = *scenario_dstates.iter().next().expect("one DState");
        debug_assert!(self.ds(ds).slots.values().all(|s| s.is_empty()));
        self.dstates.remove(ds.0);
        self.dstate_clusters.remove(&ds);
        self.root = None;
    }

    pub fn drop_record(&mut self, core: &mut MapperCore, state: StateId) {
        if let Some(info) = self.records.remove(&state) {
            debug_assert!(info.vstates.is_empty(), "dropping a record with vstates");
            core.clusters.depart_and_sweep(info.cluster, state);
        }
    }

    pub fn cluster_of(&self, state: StateId) -> Option<ClusterId> {
        self.records.get(&state).map(|i| i.cluster)
    }

    pub fn count_current(&self) -> u64 {
        self.dstates
            .iter_ids()
            .map(|id| {
                self.dstates
                    .get(id)
                    .slots
                    .values()
                    .filter(|slot| !slot.is_empty())
                    .map(|slot| slot.len() as u64)
                    .product::<u64>()
            })
            .sum()
    }

    // ---- clustering graph ----------------------------------------------

    fn dstate_cluster(&mut self, d: DStateId) -> Option<ClusterId> {
        if let Some(c) = self.dstate_clusters.get(&d) {
            return Some(*c);
        }
        // mirror the cluster of any member state
        let member = self
            .ds(d)
            .slots
            .values()
            .flat_map(|slot| slot.iter())
            .next()
            .copied()?;
        let c = self.records[&self.state_of(member)].cluster;
        self.dstate_clusters.insert(d, c);
        Some(c)
    }

    fn move_state_to_cluster(&mut self, core: &mut MapperCore, state: StateId, to: ClusterId) {
        let info = self.records.get_mut(&state).expect("clustered record");
        let from = info.cluster;
        if from == to {
            return;
        }
        info.cluster = to;
        let dstates: Vec<DStateId> = info
            .vstates
            .clone()
            .into_iter()
            .filter_map(|v| self.vs(v).dstate)
            .collect();
        core.clusters.depart(from, state);
        core.clusters.join(to, state);
        for d in dstates {
            self.dstate_clusters.insert(d, to);
        }
    }

    fn edge_added(&mut self, core: &mut MapperCore, state: StateId, dstate: DStateId) {
        if !self.clustering {
            return;
        }
        let mut keep = self.records[&state].cluster;
        let trash = self
            .dstate_cluster(dstate)
            .expect("dstate with an edge has a member");
        // a state with its first edge always joins the DState's cluster:
        // freshly forked states are isolated until they link up
        let degree = self.records[&state]
            .vstates
            .iter()
            .filter(|v| self.vs(**v).dstate.is_some())
            .count();
        if degree == 1 && keep != trash {
            let old = keep;
            self.move_state_to_cluster(core, state, trash);
            if core.clusters.is_alive(old) && core.clusters.len(old) == 0 {
                core.clusters.free(old);
            }
            keep = trash;
        }
        if keep == trash {
            self.dstate_clusters.insert(dstate, keep);
            return;
        }
        // merge the smaller cluster into the bigger one
        let (keep, trash) = if core.clusters.len(keep) < core.clusters.len(trash) {
            (trash, keep)
        } else {
            (keep, trash)
        };
        let moving: Vec<StateId> = core.clusters.members(trash).collect();
        for s in moving {
            self.move_state_to_cluster(core, s, keep);
        }
        core.clusters.free(trash);
        self.dstate_clusters.insert(dstate, keep);
    }

    fn edge_removed(&mut self, core: &mut MapperCore, state: StateId, dstate: DStateId) {
        if !self.clustering {
            return;
        }
        if self.reachable(state, dstate) {
            return;
        }
        let cluster = self.records[&state].cluster;
        let (comp_states, _comp_dstates) = self.component_of(state);
        let total = core.clusters.len(cluster);
        let fresh = core.clusters.new_cluster();
        if comp_states.len() * 2 <= total {
            for s in comp_states {
                self.move_state_to_cluster(core, s, fresh);
            }
        } else {
            let complement: Vec<StateId> = core
                .clusters
                .members(cluster)
                .filter(|s| !comp_states.contains(s))
                .collect();
            for s in complement {
                self.move_state_to_cluster(core, s, fresh);
            }
        }
        if core.clusters.len(fresh) == 0 {
            core.clusters.free(fresh);
        }
        log::trace!("cluster {cluster} split after edge removal at {state}/{dstate:?}");
    }

    fn reachable(&self, from: StateId, needle: DStateId) -> bool {
        let mut seen_states: BTreeSet<StateId> = BTreeSet::new();
        let mut seen_dstates: BTreeSet<DStateId> = BTreeSet::new();
        let mut queue: VecDeque<StateId> = VecDeque::new();
        seen_states.insert(from);
        queue.push_back(from);
        while let Some(s) = queue.pop_front() {
            for v in &self.records[&s].vstates {
                let Some(d) = self.vs(*v).dstate else { continue };
                if d == needle {
                    return true;
                }
                if !seen_dstates.insert(d) {
                    continue;
                }
                for other in self.ds(d).slots.values().flatten() {
                    let os = self.state_of(*other);
                    if seen_states.insert(os) {
                        queue.push_back(os);
                    }
                }
            }
        }
        false
    }

    fn component_of(&self, from: StateId) -> (BTreeSet<StateId>, BTreeSet<DStateId>) {
        let mut states: BTreeSet<StateId> = BTreeSet::new();
        let mut dstates: BTreeSet<DStateId> = BTreeSet::new();
        let mut queue: VecDeque<StateId> = VecDeque::new();
        states.insert(from);
        queue.push_back(from);
        while let Some(s) = queue.pop_front() {
            for v in &self.records[&s].vstates {
                let Some(d) = self.vs(*v).dstate else { continue };
                if !dstates.insert(d) {
                    continue;
                }
                for other in self.ds(d).slots.values().flatten() {
                    let os = self.state_of(*other);
                    if states.insert(os) {
                        queue.push_back(os);
                    }
                }
            }
        }
        (states, dstates)
    }
}
