// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Cluster accounting.
//!
//! A cluster is the schedulability partition: coarser than a DScenario in
//! general, equal to it when a clustering graph is maintained. Cluster ids
//! are recycled through a gap list so long runs do not exhaust the id
//! space.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::executor::StateId;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub u32);

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Cluster membership plus the change log the cluster searcher drains to
/// re-home states whose cluster moved under them.
#[derive(Debug, Default)]
pub struct ClusterTable {
    next: u32,
    gaps: VecDeque<u32>,
    members: HashMap<ClusterId, HashSet<StateId>>,
    changes: Vec<StateId>,
}

impl ClusterTable {
    /// Issue a cluster id, reusing gaps first.
    pub fn new_cluster(&mut self) -> ClusterId {
        let id = match self.gaps.pop_front() {
            Some(gap) => ClusterId(gap),
            None => {
                let id = ClusterId(self.next);
                self.next += 1;
                id
            }
        };
        self.members.insert(id, HashSet::new());
        id
    }

    pub fn free(&mut self, id: ClusterId) {
        let members = self.members.remove(&id);
        debug_assert!(
            members.map(|m| m.is_empty()).unwrap_or(true),
            "freeing a cluster that still has members"
        );
        self.gaps.push_back(id.0);
    }

    pub fn join(&mut self, id: ClusterId, state: StateId) {
        self.members
            .get_mut(&id)
            .expect("joining a dead cluster")
            .insert(state);
        self.changes.push(state);
    }

    pub fn depart(&mut self, id: ClusterId, state: StateId) {
        self.members
            .get_mut(&id)
            .expect("departing a dead cluster")
            .remove(&state);
        self.changes.push(state);
    }

    /// Depart and free the cluster if that left it empty.
    pub fn depart_and_sweep(&mut self, id: ClusterId, state: StateId) {
        self.depart(id, state);
        if self.len(id) == 0 {
            self.free(id);
        }
    }

    pub fn len(&self, id: ClusterId) -> usize {
        self.members.get(&id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn members(&self, id: ClusterId) -> impl Iterator<Item = StateId> + '_ {
        self.members
            .get(&id)
            .into_iter()
            .flat_map(|m| m.iter().copied())
    }

    pub fn is_alive(&self, id: ClusterId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn take_changes(&mut self) -> Vec<StateId> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_recycled_through_gaps() {
        let mut t = ClusterTable::default();
        let a = t.new_cluster();
        let b = t.new_cluster();
        assert_ne!(a, b);
        t.free(a);
        let c = t.new_cluster();
        assert_eq!(c, a);
        let d = t.new_cluster();
        assert_eq!(d.0, 2);
    }

    #[test]
    fn membership_and_changes() {
        let mut t = ClusterTable::default();
        let c = t.new_cluster();
        t.join(c, StateId(1));
        t.join(c, StateId(2));
        assert_eq!(t.len(c), 2);
        t.depart_and_sweep(c, StateId(1));
        assert!(t.is_alive(c));
        t.depart_and_sweep(c, StateId(2));
        assert!(!t.is_alive(c));
        let mut changed = t.take_changes();
        changed.sort();
        changed.dedup();
        assert_eq!(changed, vec![StateId(1), StateId(2)]);
        assert!(t.take_changes().is_empty());
    }
}
