// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Discrete-event scheduling over a calendar queue, in the style of the
//! Cooja network simulator: a map from virtual time to per-node FIFO
//! queues of states. Selection always serves the head of the earliest
//! bucket; emptying a head bucket is the quiescent point at which the
//! packet cache is committed.

use std::collections::{BTreeMap, HashMap, VecDeque};

use symnet_shared::{Node, Time};

use super::{EventKind, EventSearcher, Searcher, StateView};
use crate::executor::StateId;

#[derive(Debug, Clone, Default)]
struct Info {
    node: Node,
    is_scheduled: bool,
    scheduled_boot_time: Time,
    scheduled_time: Time,
    virtual_time: Time,
}

/// One calendar bucket: per-node FIFO queues.
#[derive(Debug, Default)]
struct TimeEvent {
    scheduled_nodes: BTreeMap<Node, VecDeque<StateId>>,
}

impl TimeEvent {
    fn peek(&self) -> StateId {
        let (_, queue) = self
            .scheduled_nodes
            .iter()
            .next()
            .expect("no nodes scheduled in this bucket");
        *queue.front().expect("empty per-node queue kept around")
    }

    fn push_back(&mut self, node: Node, state: StateId) {
        self.scheduled_nodes.entry(node).or_default().push_back(state);
    }

    fn remove(&mut self, node: Node, state: StateId) {
        if let Some(queue) = self.scheduled_nodes.get_mut(&node) {
            queue.retain(|s| *s != state);
            if queue.is_empty() {
                self.scheduled_nodes.remove(&node);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.scheduled_nodes.is_empty()
    }
}

#[derive(Debug)]
pub struct CoojaSearcher {
    cal_queue: BTreeMap<Time, TimeEvent>,
    info: HashMap<StateId, Info>,
    lower_bound: Time,
    phony_packets: bool,
    commit_requested: bool,
}

impl CoojaSearcher {
    pub fn new(phony_packets: bool) -> Self {
        CoojaSearcher {
            cal_queue: BTreeMap::new(),
            info: HashMap::new(),
            lower_bound: 0,
            phony_packets,
            commit_requested: false,
        }
    }

    /// Pull a state out of the calendar. Returns whether it was scheduled.
    fn remove_state(&mut self, state: StateId) -> bool {
        let Some(info) = self.info.get_mut(&state) else {
            return false;
        };
        let was = info.is_scheduled;
        if was {
            let time = info.scheduled_time;
            let node = info.node;
            let head = self.cal_queue.keys().next().copied();
            if let Some(event) = self.cal_queue.get_mut(&time) {
                event.remove(node, state);
                if event.is_empty() {
                    if head == Some(time) {
                        // the head bucket drained: quiescent point
                        self.commit_requested = true;
                    }
                    self.cal_queue.remove(&time);
                }
            }
        }
        self.info.get_mut(&state).expect("checked above").is_scheduled = false;
        was
    }

    fn schedule(&mut self, state: StateId, time: Time, kind: EventKind) {
        let info = self.info.get_mut(&state).expect("scheduling unknown state");
        assert!(
            time >= self.lower_bound,
            "scheduling into the past (t={time}, bound={})",
            self.lower_bound
        );
        if kind == EventKind::Boot {
            info.scheduled_boot_time = time;
        }
        if info.is_scheduled {
            if info.scheduled_boot_time > time || info.virtual_time >= time {
                // wake-up before the boot pin or not after the present
                return;
            }
            if time < info.scheduled_time {
                self.remove_state(state);
            } else {
                // the existing, earlier event stands
                return;
            }
        }
        let info = self.info.get_mut(&state).expect("scheduling unknown state");
        info.is_scheduled = true;
        info.scheduled_time = time;
        let node = info.node;
        self.cal_queue.entry(time).or_default().push_back(node, state);
    }
}

impl Searcher for CoojaSearcher {
    fn add(&mut self, states: &[StateId], view: &dyn StateView) {
        for s in states {
            let node = view.node_of(*s);
            let entry = self.info.entry(*s).or_default();
            entry.node = node;
            entry.scheduled_time = 0;
            assert!(!entry.is_scheduled, "newly added state is already scheduled");
            let at = entry.virtual_time.max(self.lower_bound);
            self.schedule(*s, at, EventKind::Normal);
        }
    }

    fn remove(&mut self, states: &[StateId]) {
        for s in states {
            self.remove_state(*s);
            self.info.remove(s);
        }
    }

    fn select_state(&mut self) -> Option<StateId> {
        let (time, event) = self.cal_queue.iter().next()?;
        let time = *time;
        let head = event.peek();
        let info = self.info.get_mut(&head).expect("scheduled state has info");
        info.virtual_time = time;
        self.lower_bound = self.lower_bound.max(time);
        Some(head)
    }

    fn is_empty(&self) -> bool {
        self.cal_queue.is_empty()
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

    fn on_state_forked(&mut self, parent: StateId, child: StateId) {
        if let Some(pinfo) = self.info.get(&parent) {
            let inherited = Info {
                node: pinfo.node,
                is_scheduled: false,
                scheduled_boot_time: pinfo.scheduled_boot_time,
                scheduled_time: 0,
                virtual_time: pinfo.virtual_time,
            };
            self.info.insert(child, inherited);
        }
    }

    fn take_commit_request(&mut self) -> bool {
        std::mem::take(&mut self.commit_requested)
    }

    fn as_event_searcher(&mut self) -> Option<&mut dyn EventSearcher> {
        Some(self)
    }
}

impl EventSearcher for CoojaSearcher {
    fn schedule_state_at(&mut self, state: StateId, time: Time, kind: EventKind) {
        self.schedule(state, time, kind);
    }

    fn schedule_state_in(&mut self, state: StateId, delta: Time, kind: EventKind) {
        let base = self.state_time(state);
        self.schedule(state, base + delta, kind);
    }

    fn yield_state(&mut self, state: StateId) {
        assert!(!self.cal_queue.is_empty(), "yielding without active states");
        let was_in = self.remove_state(state);
        assert!(was_in, "yielded state was not scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ClusterId;
    use symnet_shared::INVALID_NODE;

    struct NoView;
    impl StateView for NoView {
        fn node_of(&self, _s: StateId) -> Node {
            INVALID_NODE
        }
        fn cluster_of(&self, _s: StateId) -> Option<ClusterId> {
            None
        }
    }

    #[test]
    fn earliest_bucket_wins_and_bound_is_monotone() {
        let mut s = CoojaSearcher::new(true);
        s.add(&[StateId(1), StateId(2), StateId(3)], &NoView);
        // everyone starts at t=0; run them forward
        let ev = s.as_event_searcher().unwrap();
        ev.schedule_state_at(StateId(1), 10, EventKind::Normal);
        ev.schedule_state_at(StateId(2), 10, EventKind::Normal);
        ev.schedule_state_at(StateId(3), 5, EventKind::Normal);
        // t=0 events stand (earlier wins); drain them first
        let mut bounds = Vec::new();
        for _ in 0..3 {
            let sel = s.select_state().unwrap();
            bounds.push(s.lower_bound());
            s.as_event_searcher().unwrap().yield_state(sel);
        }
        assert_eq!(bounds, vec![0, 0, 0]);
        assert!(s.is_empty());
    }

    #[test]
    fn reschedule_earlier_overrides_later() {
        let mut s = CoojaSearcher::new(true);
        s.add(&[StateId(1)], &NoView);
        // take it out of the boot bucket first
        let sel = s.select_state().unwrap();
        s.as_event_searcher().unwrap().yield_state(sel);
        let ev = s.as_event_searcher().unwrap();
        ev.schedule_state_at(StateId(1), 10, EventKind::Normal);
        ev.schedule_state_at(StateId(1), 5, EventKind::Normal);
        let sel = s.select_state().unwrap();
        assert_eq!(sel, StateId(1));
        assert_eq!(s.state_time(sel), 5);
        // a later request while scheduled is ignored
        let ev = s.as_event_searcher().unwrap();
        ev.schedule_state_at(StateId(1), 7, EventKind::Normal);
        assert_eq!(s.select_state(), Some(StateId(1)));
    }

    #[test]
    fn calendar_selection_order() {
        let mut s = CoojaSearcher::new(true);
        s.add(&[StateId(1), StateId(2), StateId(3)], &NoView);
        for st in [StateId(1), StateId(2), StateId(3)] {
            let sel = s.select_state().unwrap();
            assert_eq!(sel, st);
            s.as_event_searcher().unwrap().yield_state(sel);
            if sel == StateId(1) || sel == StateId(2) {
                s.as_event_searcher()
                    .unwrap()
                    .schedule_state_at(sel, 10, EventKind::Normal);
            } else {
                s.as_event_searcher()
                    .unwrap()
                    .schedule_state_at(sel, 5, EventKind::Normal);
            }
        }
        // now: 3 at t=5, 1 and 2 at t=10
        let mut bounds = Vec::new();
        let order: Vec<(StateId, Time)> = (0..3)
            .map(|_| {
                let sel = s.select_state().unwrap();
                let t = s.state_time(sel);
                bounds.push(s.lower_bound());
                s.as_event_searcher().unwrap().yield_state(sel);
                (sel, t)
            })
            .collect();
        assert_eq!(order[0], (StateId(3), 5));
        assert_eq!(order[1].1, 10);
        assert_eq!(order[2].1, 10);
        assert_eq!(bounds, vec![5, 10, 10]);
    }

    #[test]
    fn boot_time_pins_wakeups() {
        let mut s = CoojaSearcher::new(true);
        s.add(&[StateId(1)], &NoView);
        let sel = s.select_state().unwrap();
        s.as_event_searcher().unwrap().yield_state(sel);
        let ev = s.as_event_searcher().unwrap();
        ev.schedule_state_at(StateId(1), 20, EventKind::Boot);
        // a pre-boot wakeup is ignored
        ev.schedule_state_at(StateId(1), 10, EventKind::Normal);
        let sel = s.select_state().unwrap();
        assert_eq!(s.state_time(sel), 20);
    }
}
