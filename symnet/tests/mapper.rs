// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Mapper behaviour across all four algorithms: the mapping contract,
//! explosion, termination and clustering.

use pretty_assertions::assert_eq;
use symnet::executor::{Executor, StateId};
use symnet::mapper::{MappingAlgorithm, StateMapper};
use symnet_shared::Node;

const ALL_ALGORITHMS: &[MappingAlgorithm] = &[
    MappingAlgorithm::CopyOnBranch,
    MappingAlgorithm::CopyOnWrite,
    MappingAlgorithm::CopyOnWrite2,
    MappingAlgorithm::SuperDState,
    MappingAlgorithm::SuperDStateBfClustering,
];

/// One booted state per node `1..=n`.
fn setup(alg: MappingAlgorithm, n: i32) -> (Executor, StateMapper, Vec<StateId>) {
    let mut exec = Executor::with_structural_solver();
    let root = exec.create_state();
    let mut mapper = StateMapper::create(alg, false, root);
    let mut states = vec![root];
    for _ in 1..n {
        let child = exec.fork(root);
        mapper.on_state_forked(&mut exec, root, child);
        states.push(child);
    }
    for (i, s) in states.iter().enumerate() {
        mapper.set_state_node(*s, Node(1 + i as i32));
    }
    exec.take_added();
    (exec, mapper, states)
}

fn targets_of(mapper: &mut StateMapper, s: StateId, dest: Node) -> Vec<StateId> {
    mapper.find_targets(s, dest);
    let t = mapper.targets().to_vec();
    mapper.invalidate();
    t
}

fn live_count(exec: &Executor) -> usize {
    exec.live_states().count()
}

#[test]
fn map_round_trip_without_rivals() {
    for alg in ALL_ALGORITHMS {
        let (mut exec, mut mapper, states) = setup(*alg, 3);
        let s = states[0];
        mapper.map(&mut exec, s, Node(2));
        let targets = targets_of(&mut mapper, s, Node(2));
        assert!(!targets.is_empty(), "{alg:?}");
        for t in targets {
            let back = targets_of(&mut mapper, t, Node(1));
            assert_eq!(back, vec![s], "{alg:?}: visibility must be symmetric");
        }
    }
}

#[test]
fn map_round_trip_with_sender_rivals() {
    for alg in ALL_ALGORITHMS {
        let (mut exec, mut mapper, states) = setup(*alg, 2);
        let s = states[0];
        // a rival of the sender on node 1
        let rival = exec.fork(s);
        mapper.on_state_forked(&mut exec, s, rival);
        exec.take_added();

        mapper.map(&mut exec, s, Node(2));
        let targets = targets_of(&mut mapper, s, Node(2));
        for t in &targets {
            let back = targets_of(&mut mapper, *t, Node(1));
            assert_eq!(
                back,
                vec![s],
                "{alg:?}: a mapped sender must be the unique reverse target"
            );
        }
    }
}

#[test]
fn explosion_is_idempotent() {
    for alg in ALL_ALGORITHMS {
        let (mut exec, mut mapper, states) = setup(*alg, 3);
        let s = states[0];
        // make the scenario ambiguous first
        let rival = exec.fork(states[1]);
        mapper.on_state_forked(&mut exec, states[1], rival);
        exec.take_added();

        mapper.explode(&mut exec, s, None);
        let after_first = live_count(&exec);
        mapper.explode(&mut exec, s, None);
        assert_eq!(
            live_count(&exec),
            after_first,
            "{alg:?}: a second explosion must not fork"
        );
        // after explosion every node has exactly one peer
        for n in [1, 2, 3] {
            assert_eq!(targets_of(&mut mapper, s, Node(n)).len(), 1, "{alg:?}");
        }
    }
}

#[test]
fn termination_closes_scenarios() {
    for alg in ALL_ALGORITHMS {
        let (mut exec, mut mapper, states) = setup(*alg, 2);
        let s = states[0];
        // rival receiver so the explosion has something to do
        let rival = exec.fork(states[1]);
        mapper.on_state_forked(&mut exec, states[1], rival);
        exec.take_added();

        let mut terminated: Vec<StateId> = Vec::new();
        mapper.terminate_cluster(&mut exec, s, &mut |st, _, peers| {
            terminated.push(st);
            terminated.extend(peers.iter().map(|(p, _)| *p));
        });
        assert!(terminated.contains(&s), "{alg:?}");
        for t in &terminated {
            assert!(
                !mapper.has_record(*t),
                "{alg:?}: terminated state still known to the mapper"
            );
        }
        // survivors (if any) still see one peer per node and never one of
        // the removed states
        for surv in exec.live_states().collect::<Vec<_>>() {
            if !mapper.has_record(surv) || terminated.contains(&surv) {
                continue;
            }
            for n in [1, 2] {
                for t in targets_of(&mut mapper, surv, Node(n)) {
                    assert!(!terminated.contains(&t), "{alg:?}");
                }
            }
        }
    }
}

#[test]
fn cob_forks_whole_scenarios_eagerly() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::CopyOnBranch, 3);
    let before = live_count(&exec);
    // one engine fork forces a fork of both peers
    let child = exec.fork(states[0]);
    mapper.on_state_forked(&mut exec, states[0], child);
    assert_eq!(live_count(&exec), before + 3);
    assert_eq!(mapper.count_total_dscenarios(), 2);
    // the twin scenario is fully populated and disjoint
    let twin_targets = targets_of(&mut mapper, child, Node(2));
    assert_eq!(twin_targets.len(), 1);
    let original_targets = targets_of(&mut mapper, states[0], Node(2));
    assert_ne!(twin_targets, original_targets);
}

#[test]
fn cow2_splits_once_per_map() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::CopyOnWrite2, 3);
    let s = states[0];
    // two rivals of the sender
    for _ in 0..2 {
        let r = exec.fork(s);
        mapper.on_state_forked(&mut exec, s, r);
    }
    exec.take_added();
    let before = live_count(&exec);
    mapper.map(&mut exec, s, Node(2));
    // minimal split: one clone of the scenario, i.e. one fork per foreign
    // node (nodes 2 and 3)
    assert_eq!(live_count(&exec), before + 2);
}

#[test]
fn cow1_splits_once_per_rival() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::CopyOnWrite, 3);
    let s = states[0];
    for _ in 0..2 {
        let r = exec.fork(s);
        mapper.on_state_forked(&mut exec, s, r);
    }
    exec.take_added();
    let before = live_count(&exec);
    mapper.map(&mut exec, s, Node(2));
    // two rivals, each cloned a scenario with two foreign nodes
    assert_eq!(live_count(&exec), before + 4);
}

/// The super-rival scenario: a receiver whose virtual states are only
/// partially targeted engine-forks so that the receiving and bystander
/// subsets split.
#[test]
fn super_rival_receiver_forks_once() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::SuperDState, 3);
    let (a, r, _c) = (states[0], states[1], states[2]);
    // fork the sender so node 1 is rivalled, then map towards node 3:
    // the bystander on node 2 ends up with vstates in both scenarios
    let b = exec.fork(a);
    mapper.on_state_forked(&mut exec, a, b);
    exec.take_added();
    mapper.map(&mut exec, a, Node(3));
    exec.take_added();

    // now the node-2 state is in two scenarios; only one of them receives
    let before = live_count(&exec);
    mapper.map(&mut exec, b, Node(2));
    assert_eq!(
        live_count(&exec),
        before + 1,
        "a super-rivalled receiver forks exactly once"
    );
    let targets = targets_of(&mut mapper, b, Node(2));
    assert_eq!(targets.len(), 1);
    // and the receiving fork is not the original bystander copy
    let back = targets_of(&mut mapper, targets[0], Node(1));
    assert_eq!(back, vec![b]);
    // the original keeps serving the other scenario
    let a_targets = targets_of(&mut mapper, a, Node(2));
    assert_eq!(a_targets.len(), 1);
    assert_ne!(a_targets[0], targets[0]);
    assert!(r == targets[0] || r == a_targets[0]);
}

#[test]
fn repeated_map_is_a_no_op() {
    for alg in ALL_ALGORITHMS {
        let (mut exec, mut mapper, states) = setup(*alg, 3);
        let s = states[0];
        let rival = exec.fork(states[1]);
        mapper.on_state_forked(&mut exec, states[1], rival);
        exec.take_added();

        mapper.map(&mut exec, s, Node(2));
        let settled = live_count(&exec);
        let first = targets_of(&mut mapper, s, Node(2));
        mapper.map(&mut exec, s, Node(2));
        assert_eq!(live_count(&exec), settled, "{alg:?}: mapping twice forked");
        assert_eq!(targets_of(&mut mapper, s, Node(2)), first, "{alg:?}");
    }
}

#[test]
fn clustering_splits_partition_the_pool() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::SuperDStateBfClustering, 2);
    let a = states[0];
    // initially everything is one cluster
    let c0 = mapper.cluster_of(a).unwrap();
    assert_eq!(mapper.cluster_of(states[1]), Some(c0));

    // rival the sender and map: the scenarios split, and with them the
    // clusters
    let b = exec.fork(a);
    mapper.on_state_forked(&mut exec, a, b);
    exec.take_added();
    mapper.map(&mut exec, a, Node(2));
    exec.take_added();

    let ca = mapper.cluster_of(a).unwrap();
    let cb = mapper.cluster_of(b).unwrap();
    assert_ne!(ca, cb, "split scenarios must be independently schedulable");
    // each cluster contains a full scenario: sender plus its receiver
    let a_recv = targets_of(&mut mapper, a, Node(2))[0];
    assert_eq!(mapper.cluster_of(a_recv), Some(ca));
    let b_recv = targets_of(&mut mapper, b, Node(2))[0];
    assert_eq!(mapper.cluster_of(b_recv), Some(cb));
}

#[test]
fn removal_counts_truncated_scenarios() {
    let (mut exec, mut mapper, states) = setup(MappingAlgorithm::SuperDState, 2);
    mapper.explode(&mut exec, states[0], None);
    let removed = mapper.remove(states[0]);
    assert_eq!(removed.len(), 2);
    assert_eq!(mapper.truncated_dscenarios(), 1);
    assert!(!mapper.has_record(states[0]));
    assert!(!mapper.has_record(states[1]));
}

mod properties {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    #[derive(Clone, Debug)]
    enum Op {
        ForkSender,
        ForkReceiver,
        Map(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 4 {
                0 => Op::ForkSender,
                1 => Op::ForkReceiver,
                _ => Op::Map(u8::arbitrary(g)),
            }
        }
    }

    /// Whatever interleaving of forks and maps happens, mapping the same
    /// sender twice in a row never forks again (the per-pass target
    /// accounting resets), and visibility stays symmetric.
    #[quickcheck_macros::quickcheck]
    fn super_mapping_settles(ops: Vec<Op>) -> bool {
        let (mut exec, mut mapper, states) = setup(MappingAlgorithm::SuperDState, 3);
        let mut senders = vec![states[0]];
        let mut receivers = vec![states[1]];
        for op in ops.into_iter().take(12) {
            match op {
                Op::ForkSender => {
                    let s = senders[0];
                    let c = exec.fork(s);
                    mapper.on_state_forked(&mut exec, s, c);
                    senders.push(c);
                }
                Op::ForkReceiver => {
                    let r = receivers[0];
                    let c = exec.fork(r);
                    mapper.on_state_forked(&mut exec, r, c);
                    receivers.push(c);
                }
                Op::Map(pick) => {
                    let s = senders[pick as usize % senders.len()];
                    let dest = Node(2 + (pick as i32 % 2));
                    mapper.map(&mut exec, s, dest);
                    let settled = exec.live_states().count();
                    mapper.map(&mut exec, s, dest);
                    if exec.live_states().count() != settled {
                        return false;
                    }
                    mapper.find_targets(s, dest);
                    let targets = mapper.targets().to_vec();
                    mapper.invalidate();
                    for t in targets {
                        mapper.find_targets(t, Node(1));
                        let back = mapper.targets().to_vec();
                        mapper.invalidate();
                        if back != vec![s] {
                            return false;
                        }
                    }
                }
            }
            exec.take_added();
        }
        true
    }
}
