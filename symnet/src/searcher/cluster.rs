// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Cluster-wrapping searcher: partitions the state pool by mapper cluster
//! and delegates each partition to its own inner searcher, so independent
//! scenarios are schedulable independently. An outer strategy decides
//! which cluster advances next.

use std::collections::{BTreeMap, HashMap};

use symnet_shared::{Time, INVALID_NODE};

use super::{EventKind, EventSearcher, Searcher, SearcherStrategy, StateView};
use crate::executor::StateId;
use crate::mapper::ClusterId;

pub struct ClusterSearcher {
    make_inner: Box<dyn Fn() -> Box<dyn Searcher>>,
    inner: BTreeMap<ClusterId, Box<dyn Searcher>>,
    /// Which inner searcher currently governs each state.
    location: HashMap<StateId, ClusterId>,
    strategy: Box<dyn SearcherStrategy>,
    phony_packets: bool,
}

impl std::fmt::Debug for ClusterSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSearcher")
            .field("clusters", &self.inner.keys().collect::<Vec<_>>())
            .field("states", &self.location.len())
            .finish()
    }
}

impl ClusterSearcher {
    pub fn new(
        strategy: Box<dyn SearcherStrategy>,
        make_inner: Box<dyn Fn() -> Box<dyn Searcher>>,
    ) -> Self {
        let phony_packets = make_inner().supports_phony_packets();
        ClusterSearcher {
            make_inner,
            inner: BTreeMap::new(),
            location: HashMap::new(),
            strategy,
            phony_packets,
        }
    }

    fn searcher_of(&mut self, state: StateId) -> Option<&mut Box<dyn Searcher>> {
        let cluster = self.location.get(&state)?;
        self.inner.get_mut(cluster)
    }
}

impl Searcher for ClusterSearcher {
    fn add(&mut self, states: &[StateId], view: &dyn StateView) {
        // group first so the inner searchers see one bulk add each
        let mut batches: BTreeMap<ClusterId, Vec<StateId>> = BTreeMap::new();
        for s in states {
            match view.cluster_of(*s) {
                Some(c) => batches.entry(c).or_default().push(*s),
                // states without a cluster are not schedulable yet
                None => continue,
            }
        }
        for (cluster, batch) in batches {
            if !self.inner.contains_key(&cluster) {
                self.inner.insert(cluster, (self.make_inner)());
                self.strategy.add_cluster(cluster);
            }
            for s in &batch {
                self.location.insert(*s, cluster);
            }
            self.inner
                .get_mut(&cluster)
                .expect("created above")
                .add(&batch, view);
        }
    }

    fn remove(&mut self, states: &[StateId]) {
        let mut batches: BTreeMap<ClusterId, Vec<StateId>> = BTreeMap::new();
        for s in states {
            if let Some(cluster) = self.location.remove(s) {
                batches.entry(cluster).or_default().push(*s);
            }
        }
        for (cluster, batch) in batches {
            let empty = {
                let inner = self.inner.get_mut(&cluster).expect("located cluster");
                inner.remove(&batch);
                inner.is_empty()
            };
            if empty {
                self.inner.remove(&cluster);
                self.strategy.remove_cluster(cluster);
            }
        }
    }

    fn select_state(&mut self) -> Option<StateId> {
        loop {
            let cluster = self.strategy.select_cluster()?;
            match self.inner.get_mut(&cluster) {
                Some(inner) => {
                    debug_assert!(!inner.is_empty());
                    return inner.select_state();
                }
                None => {
                    // stale pick from a composed strategy; drop and retry
                    self.strategy.remove_cluster(cluster);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn supports_phony_packets(&self) -> bool {
        self.phony_packets
    }

    fn state_time(&self, state: StateId) -> Time {
        self.location
            .get(&state)
            .and_then(|c| self.inner.get(c))
            .map(|i| i.state_time(state))
            .unwrap_or(0)
    }

    fn lower_bound(&self) -> Time {
        self.inner
            .values()
            .map(|i| i.lower_bound())
            .min()
            .unwrap_or(0)
    }

    fn barrier(&mut self, state: StateId) {
        if let Some(inner) = self.searcher_of(state) {
            inner.barrier(state);
        }
    }

    fn on_state_forked(&mut self, parent: StateId, child: StateId) {
        if let Some(inner) = self.searcher_of(parent) {
            inner.on_state_forked(parent, child);
        }
    }

    fn notify_cluster_change(&mut self, state: StateId, view: &dyn StateView) {
        let current = self.location.get(&state).copied();
        let actual = view.cluster_of(state);
        if current != actual && current.is_some() {
            self.remove(&[state]);
            if view.node_of(state) != INVALID_NODE || actual.is_some() {
                self.add(&[state], view);
            }
        }
    }

    fn take_commit_request(&mut self) -> bool {
        let mut any = false;
        for inner in self.inner.values_mut() {
            any |= inner.take_commit_request();
        }
        any
    }

    fn as_event_searcher(&mut self) -> Option<&mut dyn EventSearcher> {
        // only meaningful when the inner searchers are event driven
        if self.make_event_capable() {
            Some(self)
        } else {
            None
        }
    }
}

impl ClusterSearcher {
    fn make_event_capable(&mut self) -> bool {
        let mut probe = (self.make_inner)();
        probe.as_event_searcher().is_some()
    }
}

impl EventSearcher for ClusterSearcher {
    fn schedule_state_at(&mut self, state: StateId, time: Time, kind: EventKind) {
        if let Some(inner) = self.searcher_of(state) {
            if let Some(ev) = inner.as_event_searcher() {
                ev.schedule_state_at(state, time, kind);
            }
        }
    }

    fn schedule_state_in(&mut self, state: StateId, delta: Time, kind: EventKind) {
        if let Some(inner) = self.searcher_of(state) {
            if let Some(ev) = inner.as_event_searcher() {
                ev.schedule_state_in(state, delta, kind);
            }
        }
    }

    fn yield_state(&mut self, state: StateId) {
        if let Some(inner) = self.searcher_of(state) {
            if let Some(ev) = inner.as_event_searcher() {
                ev.yield_state(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::searcher::{FifoStrategy, LockStepSearcher};
    use symnet_shared::Node;

    struct FixedView(HashMap<StateId, ClusterId>);
    impl StateView for FixedView {
        fn node_of(&self, _s: StateId) -> Node {
            Node(1)
        }
        fn cluster_of(&self, s: StateId) -> Option<ClusterId> {
            self.0.get(&s).copied()
        }
    }

    fn searcher() -> ClusterSearcher {
        ClusterSearcher::new(
            Box::new(FifoStrategy::default()),
            Box::new(|| Box::new(LockStepSearcher::new(1, false))),
        )
    }

    #[test]
    fn partitions_by_cluster_and_rotates() {
        let view = FixedView(HashMap::from([
            (StateId(1), ClusterId(10)),
            (StateId(2), ClusterId(10)),
            (StateId(3), ClusterId(20)),
        ]));
        let mut s = searcher();
        s.add(&[StateId(1), StateId(2), StateId(3)], &view);
        let picks: Vec<StateId> = (0..4).map(|_| s.select_state().unwrap()).collect();
        // fifo alternates between the two clusters: 3 every other pick
        assert_eq!(picks[1], StateId(3));
        assert_eq!(picks[3], StateId(3));
        let mut from_first: Vec<StateId> = vec![picks[0], picks[2]];
        from_first.sort();
        assert_eq!(from_first, vec![StateId(1), StateId(2)]);
    }

    #[test]
    fn empty_clusters_are_dropped() {
        let view = FixedView(HashMap::from([(StateId(1), ClusterId(10))]));
        let mut s = searcher();
        s.add(&[StateId(1)], &view);
        assert!(!s.is_empty());
        s.remove(&[StateId(1)]);
        assert!(s.is_empty());
        assert_eq!(s.select_state(), None);
    }

    #[test]
    fn rehoming_follows_cluster_changes() {
        let mut map = HashMap::from([(StateId(1), ClusterId(10))]);
        let mut s = searcher();
        s.add(&[StateId(1)], &FixedView(map.clone()));
        map.insert(StateId(1), ClusterId(20));
        let view = FixedView(map);
        s.notify_cluster_change(StateId(1), &view);
        assert_eq!(s.select_state(), Some(StateId(1)));
        assert!(s.inner.contains_key(&ClusterId(20)));
        assert!(!s.inner.contains_key(&ClusterId(10)));
    }
}
