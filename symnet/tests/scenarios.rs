// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! End-to-end scenarios through the full run environment: guests calling
//! the special-function surface under the scheduling loop.

use std::collections::HashMap;

use symnet::config::{Config, SearcherKind, TerminatePolicy};
use symnet::executor::StateId;
use symnet::runtime::{CollectingHandler, NodeProgram, Runtime, Vm};
use symnet_shared::error::{Error, Result};
use symnet_shared::expr::{self, Expr, ExprRef};
use symnet_shared::Node;

/// A scripted guest: each state walks its own phase list; unknown states
/// (forks) go straight to exit.
struct Script {
    phase: HashMap<StateId, usize>,
    actions: Box<dyn FnMut(&mut Vm<'_>, usize) -> Result<bool>>,
}

impl Script {
    fn new(
        states: &[StateId],
        actions: impl FnMut(&mut Vm<'_>, usize) -> Result<bool> + 'static,
    ) -> Self {
        Script {
            phase: states.iter().map(|s| (*s, 0)).collect(),
            actions: Box::new(actions),
        }
    }
}

impl NodeProgram for Script {
    fn step(&mut self, vm: &mut Vm<'_>) -> Result<()> {
        let state = vm.state();
        let Some(phase) = self.phase.get(&state).copied() else {
            vm.exit();
            return Ok(());
        };
        let proceed = (self.actions)(vm, phase)?;
        if proceed {
            self.phase.insert(state, phase + 1);
        } else {
            vm.exit();
        }
        Ok(())
    }
}

fn u64_arg(v: u64) -> ExprRef {
    expr::constant(v, 64)
}

fn collect_names(e: &ExprRef) -> Vec<String> {
    let mut names = Vec::new();
    expr::visit::collect_arrays(e, &mut |a| {
        if !names.contains(&a.name().to_owned()) {
            names.push(a.name().to_owned());
        }
    });
    names.sort();
    names
}

/// Two nodes, one concrete byte copied across. The payload arrives
/// bit-exactly, nobody forks, and the sender's record names node 1.
#[test]
fn concrete_memcpy_between_two_nodes() {
    let mut rt = Runtime::new(Config::default(), Box::<CollectingHandler>::default()).unwrap();
    let inbox = rt.allocate_global("inbox", 1);
    let src = rt.allocate_global("src", 1);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    rt.exec
        .state_mut(s1)
        .address_space
        .writable(src.id)
        .unwrap()
        .write8(0, expr::constant(b'A' as u64, 8));

    let observed = std::rc::Rc::new(std::cell::RefCell::new(Vec::<u64>::new()));
    let obs = observed.clone();
    let (inbox_id, inbox_addr, src_addr) = (inbox.id, inbox.addr, src.addr);
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        match (vm.node(), phase) {
            (Node(1), 0) => {
                vm.call(
                    "kn_memcpy",
                    &[
                        u64_arg(inbox_addr),
                        u64_arg(src_addr),
                        expr::constant(1, 32),
                        expr::constant(2, 32),
                    ],
                )?;
            }
            (Node(2), 0) => {
                // runs after the sender within the same epoch
                let byte = vm.ctx.exec.state(vm.state()).address_space.find(inbox_id);
                if let Some(os) = byte {
                    if let Some(v) = os.read8(0).as_const() {
                        obs.borrow_mut().push(v);
                    }
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    });
    let stats = rt.run(&mut guest).unwrap();

    assert_eq!(observed.borrow().as_slice(), &[b'A' as u64]);
    // two boot states, no forks, one scenario
    assert_eq!(stats.dscenarios_explored, 1);
    // uniform policy: a record per peer; the sender's names node 1
    assert!(stats.tests_written >= 2);
}

#[test]
fn sender_record_names_its_node() {
    let handler = CollectingHandler::new();
    let mut rt = Runtime::new(Config::default(), Box::new(handler.clone())).unwrap();
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    let mut guest = Script::new(&[s1, s2], |_vm, _phase| Ok(false));
    rt.run(&mut guest).unwrap();
    let tests = handler.tests.borrow();
    assert!(tests.iter().any(|t| t.node_id == 1));
    assert!(tests.iter().any(|t| t.node_id == 2));
    assert!(tests.iter().all(|t| t.err.is_empty()));
}

/// A symbolic payload carries its symbols and the minimal constraint
/// closure to the receiver, with names mangled through the registry.
#[test]
fn symbolic_payload_translates_symbols_and_constraints() {
    let mut rt = Runtime::new(Config::default(), Box::<CollectingHandler>::default()).unwrap();
    let inbox = rt.allocate_global("inbox", 1);
    let src = rt.allocate_global("src", 1);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    let a = rt.make_symbolic(s1, &src, "a");
    // a dependent constraint that must travel, and an unrelated one that
    // must not (it is outside the closure)
    let other = rt.allocate_global("other", 1);
    let b = rt.make_symbolic(s1, &other, "b");
    rt.exec
        .state_mut(s1)
        .constraints
        .add(expr::eq(expr::read8(&a, 0), expr::constant(7, 8)));
    rt.exec
        .state_mut(s1)
        .constraints
        .add(expr::eq(expr::read8(&b, 0), expr::constant(9, 8)));

    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::<String>::new()));
    let seen2 = seen.clone();
    let (inbox_id, inbox_addr, src_addr) = (inbox.id, inbox.addr, src.addr);
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        match (vm.node(), phase) {
            (Node(1), 0) => {
                vm.call(
                    "kn_memcpy",
                    &[
                        u64_arg(inbox_addr),
                        u64_arg(src_addr),
                        expr::constant(1, 32),
                        expr::constant(2, 32),
                    ],
                )?;
            }
            (Node(2), 0) => {
                let me = vm.state();
                let st = vm.ctx.exec.state(me);
                if let Some(os) = st.address_space.find(inbox_id) {
                    seen2.borrow_mut().extend(collect_names(&os.read8(0)));
                }
                for c in st.constraints.iter() {
                    seen2.borrow_mut().extend(collect_names(c));
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    });
    rt.run(&mut guest).unwrap();

    let seen = seen.borrow();
    // the receiver sees the distributed image of `a`, constrained
    assert!(seen.iter().any(|n| n == "a{node1:tx1}@2"), "{seen:?}");
    // the unrelated symbol stayed home
    assert!(!seen.iter().any(|n| n.starts_with('b')), "{seen:?}");
}

/// A translated symbol colliding with an existing non-distributed name on
/// the receiver aborts the whole run with a diagnostic naming both nodes.
#[test]
fn name_collision_aborts_the_run() {
    let mut rt = Runtime::new(Config::default(), Box::<CollectingHandler>::default()).unwrap();
    let inbox = rt.allocate_global("inbox", 1);
    let src = rt.allocate_global("src", 1);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    rt.make_symbolic(s1, &src, "a");
    // poison the target state with the exact translated name
    rt.exec
        .state_mut(s2)
        .array_names
        .insert("a{node1:tx1}@2".to_owned());

    let (inbox_addr, src_addr) = (inbox.addr, src.addr);
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        if vm.node() == Node(1) && phase == 0 {
            vm.call(
                "kn_memcpy",
                &[
                    u64_arg(inbox_addr),
                    u64_arg(src_addr),
                    expr::constant(1, 32),
                    expr::constant(2, 32),
                ],
            )?;
            return Ok(true);
        }
        Ok(phase == 0)
    });
    let err = rt.run(&mut guest).unwrap_err();
    match err {
        Error::NameCollision {
            src: s,
            dest: d,
            symbol,
            ..
        } => {
            assert_eq!(s, Node(1));
            assert_eq!(d, Node(2));
            assert_eq!(symbol, "a");
        }
        other => panic!("expected a name collision, got {other}"),
    }
}

/// Pull: the local buffer becomes fresh symbolic data constrained to equal
/// one of the source states' byte sequences, each under that source's
/// constraints.
#[test]
fn pull_builds_a_disjunction_over_sources() {
    let mut rt = Runtime::new(Config::default(), Box::<CollectingHandler>::default()).unwrap();
    let buf = rt.allocate_global("buf", 4);
    let x = rt.allocate_global("x", 4);
    let r = rt.root_state();
    let a = rt.fork(r);
    rt.set_node(r, Node(1));
    rt.set_node(a, Node(5));
    // second source state at node 5, rival of the first
    let b = rt.fork(a);
    // distinct symbolic contents per source
    let xa = rt.make_symbolic(a, &x, "x");
    let xb = rt.make_symbolic(b, &x, "x");
    rt.exec.state_mut(a).constraints.add(expr::eq(
        expr::complete_read(&xa),
        expr::constant(0x0102_0304, 32),
    ));
    rt.exec.state_mut(b).constraints.add(expr::eq(
        expr::complete_read(&xb),
        expr::constant(0x0506_0708, 32),
    ));

    let pulled = std::rc::Rc::new(std::cell::RefCell::new(Vec::<ExprRef>::new()));
    let pulled2 = pulled.clone();
    let (buf_addr, x_addr) = (buf.addr, x.addr);
    let mut guest = Script::new(&[r, a, b], move |vm, phase| {
        match (vm.node(), phase) {
            (Node(1), 0) => {
                vm.call(
                    "kn_reverse_memcpy",
                    &[
                        u64_arg(buf_addr),
                        u64_arg(x_addr),
                        expr::constant(4, 32),
                        expr::constant(5, 32),
                    ],
                )?;
                let me = vm.state();
                pulled2
                    .borrow_mut()
                    .extend(vm.ctx.exec.state(me).constraints.iter().cloned());
            }
            _ => return Ok(false),
        }
        Ok(true)
    });
    rt.run(&mut guest).unwrap();

    let pulled = pulled.borrow();
    // the last constraint is the disjunction over both sources
    let requirement = pulled.last().expect("pull added a requirement");
    assert!(matches!(&**requirement, Expr::Or(..)));
    let names = collect_names(requirement);
    // the fresh local buffer symbol is mentioned
    assert!(names.iter().any(|n| n.starts_with("pull1(node1)")), "{names:?}");
    // both source images are, too: the two sources share the textual name
    // (same node, same tx) but are distinct symbols
    let mut images: Vec<usize> = Vec::new();
    expr::visit::collect_arrays(requirement, &mut |arr| {
        if arr.name().starts_with("x{node5:") && !images.contains(&arr.id()) {
            images.push(arr.id());
        }
    });
    assert_eq!(images.len(), 2, "{names:?}");
}

/// The calling state explodes over the network before a global symbol is
/// copied, so every sibling gets the bytes of its unique peer.
#[test]
fn get_global_symbol_copies_peer_bytes() {
    let mut rt = Runtime::new(Config::default(), Box::<CollectingHandler>::default()).unwrap();
    let buf = rt.allocate_global("buf", 2);
    let g = rt.allocate_global("g", 2);
    let name_obj = rt.allocate_global("gname", 2);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    // the symbol name string "g\0" on the caller
    {
        let os = rt
            .exec
            .state_mut(s1)
            .address_space
            .writable(name_obj.id)
            .unwrap();
        os.write8(0, expr::constant(b'g' as u64, 8));
        os.write8(1, expr::constant(0, 8));
    }
    // the global's bytes on the peer
    {
        let os = rt.exec.state_mut(s2).address_space.writable(g.id).unwrap();
        os.write8(0, expr::constant(0xca, 8));
        os.write8(1, expr::constant(0xfe, 8));
    }

    let copied = std::rc::Rc::new(std::cell::RefCell::new(Vec::<u64>::new()));
    let copied2 = copied.clone();
    let (buf_id, buf_addr, name_addr) = (buf.id, buf.addr, name_obj.addr);
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        match (vm.node(), phase) {
            (Node(1), 0) => {
                vm.call(
                    "kn_get_global_symbol",
                    &[
                        u64_arg(buf_addr),
                        u64_arg(name_addr),
                        expr::constant(2, 32),
                        expr::constant(2, 32),
                    ],
                )?;
                let me = vm.state();
                let os = vm.ctx.exec.state(me).address_space.find(buf_id).unwrap();
                for i in 0..2 {
                    copied2.borrow_mut().push(os.read8(i).as_const().unwrap());
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    });
    rt.run(&mut guest).unwrap();
    assert_eq!(copied.borrow().as_slice(), &[0xca, 0xfe]);
}

/// Invalid special-function arguments terminate only the offending state.
#[test]
fn invalid_node_id_faults_the_state() {
    let handler = CollectingHandler::new();
    let mut rt = Runtime::new(Config::default(), Box::new(handler.clone())).unwrap();
    let s1 = rt.root_state();
    let mut guest = Script::new(&[s1], |vm, phase| {
        if phase == 0 {
            vm.call("kn_set_node_id", &[expr::constant((-1i64) as u64, 32)])?;
            assert!(vm.terminated());
            return Ok(true);
        }
        Ok(false)
    });
    rt.run(&mut guest).unwrap();
    let tests = handler.tests.borrow();
    assert_eq!(tests.len(), 1);
    assert!(tests[0].err.contains("invalid node id"));
}

/// A symbolic argument to a special function is a state-local fault.
#[test]
fn non_const_argument_faults_the_state() {
    let handler = CollectingHandler::new();
    let mut rt = Runtime::new(Config::default(), Box::new(handler.clone())).unwrap();
    let s1 = rt.root_state();
    let sym = {
        let mo = rt.allocate_global("s", 1);
        rt.make_symbolic(s1, &mo, "s")
    };
    let mut guest = Script::new(&[s1], move |vm, phase| {
        if phase == 0 {
            vm.call("kn_set_node_id", &[expr::read8(&sym, 0)])?;
            assert!(vm.terminated());
            return Ok(true);
        }
        Ok(false)
    });
    rt.run(&mut guest).unwrap();
    let tests = handler.tests.borrow();
    assert_eq!(tests.len(), 1);
    assert!(tests[0].err.contains("kn_set_node_id"));
}

/// Early exit produces a tagged record for the whole scenario.
#[test]
fn early_exit_records_the_message() {
    let handler = CollectingHandler::new();
    let mut rt = Runtime::new(
        Config {
            distributed_terminate: TerminatePolicy::ForceAll,
            ..Default::default()
        },
        Box::new(handler.clone()),
    )
    .unwrap();
    let msg = rt.allocate_global("m", 5);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    {
        let os = rt.exec.state_mut(s1).address_space.writable(msg.id).unwrap();
        for (i, b) in b"boom\0".iter().enumerate() {
            os.write8(i, expr::constant(*b as u64, 8));
        }
    }
    let msg_addr = msg.addr;
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        if vm.node() == Node(1) && phase == 0 {
            vm.call("kn_early_exit", &[u64_arg(msg_addr)])?;
            return Ok(true);
        }
        Ok(false)
    });
    rt.run(&mut guest).unwrap();
    let tests = handler.tests.borrow();
    assert!(tests.iter().any(|t| t.err.contains("early exit: boom")));
    // force-all: both peers produced records
    assert!(tests.len() >= 2);
}

/// The same broadcast through the discrete-event searcher: states schedule
/// themselves forward and virtual time advances monotonically.
#[test]
fn cooja_broadcast_delivers_and_time_advances() {
    let mut rt = Runtime::new(
        Config {
            searcher: SearcherKind::Cooja,
            ..Default::default()
        },
        Box::<CollectingHandler>::default(),
    )
    .unwrap();
    let inbox = rt.allocate_global("inbox", 1);
    let src = rt.allocate_global("src", 1);
    let s1 = rt.root_state();
    let s2 = rt.fork(s1);
    rt.set_node(s1, Node(1));
    rt.set_node(s2, Node(2));
    rt.exec
        .state_mut(s1)
        .address_space
        .writable(src.id)
        .unwrap()
        .write8(0, expr::constant(0x42, 8));

    let times = std::rc::Rc::new(std::cell::RefCell::new(Vec::<u64>::new()));
    let times2 = times.clone();
    let observed = std::rc::Rc::new(std::cell::RefCell::new(Vec::<u64>::new()));
    let obs = observed.clone();
    let (inbox_id, inbox_addr, src_addr) = (inbox.id, inbox.addr, src.addr);
    let mut guest = Script::new(&[s1, s2], move |vm, phase| {
        let t = vm.call("kn_get_virtual_time", &[])?.unwrap();
        times2.borrow_mut().push(t);
        match (vm.node(), phase) {
            (_, 0) => {
                // move off the boot bucket
                vm.call("kn_yield_state", &[])?;
                vm.call("kn_schedule_state", &[expr::constant(1, 32)])?;
            }
            (Node(1), 1) => {
                vm.call(
                    "kn_memcpy",
                    &[
                        u64_arg(inbox_addr),
                        u64_arg(src_addr),
                        expr::constant(1, 32),
                        expr::constant(2, 32),
                    ],
                )?;
                vm.call("kn_yield_state", &[])?;
                vm.call("kn_schedule_state", &[expr::constant(1, 32)])?;
            }
            (Node(1), 2) => {
                // stay alive until the receiver has observed the payload
                vm.call("kn_yield_state", &[])?;
                vm.call("kn_schedule_state", &[expr::constant(1, 32)])?;
            }
            (Node(2), 1) => {
                vm.call("kn_yield_state", &[])?;
                vm.call("kn_schedule_state", &[expr::constant(1, 32)])?;
            }
            (Node(2), 2) => {
                let me = vm.state();
                if let Some(os) = vm.ctx.exec.state(me).address_space.find(inbox_id) {
                    if let Some(v) = os.read8(0).as_const() {
                        obs.borrow_mut().push(v);
                    }
                }
                return Ok(false);
            }
            _ => return Ok(false),
        }
        Ok(true)
    });
    rt.run(&mut guest).unwrap();

    assert_eq!(observed.borrow().as_slice(), &[0x42]);
    let times = times.borrow();
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
}
