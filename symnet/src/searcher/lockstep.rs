// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Lock-step scheduling: global virtual time advances uniformly.
//!
//! A cursor walks the state vector end to end; when it wraps, the global
//! time advances by the step increment and the vector is compacted if
//! tombstones dominate. Within one epoch every unblocked state is selected
//! exactly once. Barriers block states; when every governed state is
//! blocked the whole round unblocks at once.

use std::collections::HashMap;

use symnet_shared::Time;

use super::{Searcher, StateView};
use crate::executor::StateId;

#[derive(Debug, Clone, Default)]
struct Info {
    slot: usize,
    blocked: bool,
    virtual_time: Time,
}

#[derive(Debug)]
pub struct LockStepSearcher {
    states: Vec<Option<StateId>>,
    info: HashMap<StateId, Info>,
    next: usize,
    null_slots: usize,
    blocked: usize,
    global_time: Time,
    step_increment: Time,
    lower_bound: Time,
    phony_packets: bool,
    commit_requested: bool,
}

impl LockStepSearcher {
    pub fn new(step_increment: Time, phony_packets: bool) -> Self {
        LockStepSearcher {
            states: Vec::new(),
            info: HashMap::new(),
            // parked at the epoch boundary: the first selection advances
            // the clock into epoch one
            next: usize::MAX,
            null_slots: 0,
            blocked: 0,
            global_time: 0,
            step_increment: step_increment.max(1),
            lower_bound: 0,
            phony_packets,
            commit_requested: false,
        }
    }

    fn governed(&self) -> usize {
        self.states.len() - self.null_slots
    }

    fn fast_forward_junk(&mut self) {
        while self.next < self.states.len() && self.states[self.next].is_none() {
            self.next += 1;
        }
    }

    fn unblock_all(&mut self) {
        if self.blocked > 0 {
            for info in self.info.values_mut() {
                info.blocked = false;
            }
        }
        self.blocked = 0;
    }

    fn consolidate(&mut self) {
        self.fast_forward_junk();
        if self.next >= self.states.len() {
            // end of the epoch: compact if mostly tombstones, then advance
            // the global clock
            if self.governed() < self.states.capacity() / 4 {
                let replace: Vec<Option<StateId>> =
                    self.states.drain(..).filter(|s| s.is_some()).collect();
                self.states = replace;
                self.null_slots = 0;
                for (slot, s) in self.states.iter().enumerate() {
                    let s = s.expect("compacted vector has no tombstones");
                    self.info.get_mut(&s).expect("governed state").slot = slot;
                }
            }
            self.next = 0;
            self.fast_forward_junk();
            assert!(self.next < self.states.len(), "consolidating an empty pool");
            self.global_time += self.step_increment;
            // the epoch boundary is our quiescent point
            self.commit_requested = true;
        }
    }
}

impl Searcher for LockStepSearcher {
    fn add(&mut self, states: &[StateId], _view: &dyn StateView) {
        for s in states {
            let entry = self.info.entry(*s).or_default();
            entry.slot = self.states.len();
            if entry.blocked {
                self.blocked += 1;
            }
            self.states.push(Some(*s));
        }
    }

    fn remove(&mut self, states: &[StateId]) {
        for s in states {
            if let Some(info) = self.info.remove(s) {
                if info.blocked {
                    self.blocked -= 1;
                }
                let slot = self.states[info.slot].take();
                assert_eq!(slot, Some(*s), "slot table out of sync");
                self.null_slots += 1;
            }
        }
    }

    fn select_state(&mut self) -> Option<StateId> {
        if self.governed() == 0 {
            return None;
        }
        if self.governed() == self.blocked {
            self.unblock_all();
        }
        let selection = loop {
            self.consolidate();
            let candidate = self.states[self.next].expect("junk skipped");
            self.next += 1;
            if !self.info[&candidate].blocked {
                break candidate;
            }
        };
        let info = self.info.get_mut(&selection).expect("governed state");
        info.virtual_time = self.global_time;
        self.lower_bound = self.lower_bound.max(self.global_time);
        Some(selection)
    }

    fn is_empty(&self) -> bool {
        self.governed() == 0
    }

    fn supports_phony_packets(&self) -> bool {
        self.phony_packets
    }

    fn state_time(&self, state: StateId) -> Time {
        self.info.get(&state).map(|i| i.virtual_time).unwrap_or(0)
    }

    fn lower_bound(&self) -> Time {
        self.lower_bound
    }

    fn barrier(&mut self, state: StateId) {
        if let Some(info) = self.info.get_mut(&state) {
            if !info.blocked {
                info.blocked = true;
                self.blocked += 1;
            }
        }
    }

    fn on_state_forked(&mut self, parent: StateId, child: StateId) {
        if let Some(pinfo) = self.info.get(&parent) {
            let inherited = Info {
                slot: usize::MAX,
                blocked: pinfo.blocked,
                virtual_time: pinfo.virtual_time,
            };
            self.info.insert(child, inherited);
        }
    }

    fn take_commit_request(&mut self) -> bool {
        std::mem::take(&mut self.commit_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::searcher::StateView;
    use symnet_shared::{Node, INVALID_NODE};

    struct NoView;
    impl StateView for NoView {
        fn node_of(&self, _s: StateId) -> Node {
            INVALID_NODE
        }
        fn cluster_of(&self, _s: StateId) -> Option<crate::mapper::ClusterId> {
            None
        }
    }

    fn ids(v: &[u32]) -> Vec<StateId> {
        v.iter().map(|i| StateId(*i)).collect()
    }

    #[test]
    fn epoch_fairness() {
        let mut s = LockStepSearcher::new(1, false);
        s.add(&ids(&[0, 1, 2]), &NoView);
        let mut first_epoch: Vec<StateId> = (0..3).map(|_| s.select_state().unwrap()).collect();
        first_epoch.sort();
        assert_eq!(first_epoch, ids(&[0, 1, 2]));
        // time advances only at the epoch boundary
        assert_eq!(s.state_time(StateId(0)), 1);
        let again = s.select_state().unwrap();
        assert_eq!(s.state_time(again), 2);
    }

    #[test]
    fn blocked_states_are_skipped_until_all_block() {
        let mut s = LockStepSearcher::new(1, false);
        s.add(&ids(&[0, 1]), &NoView);
        s.barrier(StateId(0));
        assert_eq!(s.select_state(), Some(StateId(1)));
        assert_eq!(s.select_state(), Some(StateId(1)));
        s.barrier(StateId(1));
        // everyone blocked: the round unblocks and proceeds
        assert!(s.select_state().is_some());
    }

    #[test]
    fn removal_leaves_tombstones_and_compacts() {
        let mut s = LockStepSearcher::new(1, false);
        s.add(&ids(&[0, 1, 2, 3]), &NoView);
        s.remove(&ids(&[1, 2]));
        let mut seen: Vec<StateId> = (0..4).map(|_| s.select_state().unwrap()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen, ids(&[0, 3]));
        assert!(!s.is_empty());
        s.remove(&ids(&[0, 3]));
        assert!(s.is_empty());
        assert_eq!(s.select_state(), None);
    }
}
