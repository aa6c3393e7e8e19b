// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The run environment and scheduling loop.
//!
//! One [`Runtime`] per top-level run. It owns, in teardown order, the
//! packet cache, the transmit handler and the state mapper, together with
//! the engine facade and the configured searcher. The loop is
//! single-threaded cooperative: one state is selected and stepped until it
//! suspends (a special-function call or termination), then queued work is
//! synchronised and the next state runs.
//!
//! Termination of a single state expands into termination of its whole
//! distributed scenario: the scenario is exploded, constraints are merged
//! pairwise between peers, every peer produces a test record per the
//! configured policy, and the scenario leaves the mapper, the searcher and
//! the engine.

use std::path::PathBuf;
use std::sync::Arc;

use symnet_ktest::{KTest, KTestObject};
use symnet_shared::error::{Error, Result};
use symnet_shared::expr::{Array, ArrayRef};
use symnet_shared::Node;

use crate::cache::PacketCache;
use crate::config::{Config, TerminatePolicy};
use crate::executor::{Executor, MemoryObject, StateId, SymbolicObject};
use crate::mapper::StateMapper;
use crate::searcher::Searcher;
use crate::sfh::{CallContext, Flow, Registry};
use crate::transmit::{self, CacheTransmitter, TransmitHandler};

/// Consumer of finished test records.
pub trait RunHandler {
    /// Process one record; `forced` bypasses any drop-heuristics the
    /// handler applies. Returns whether the record was kept.
    fn process_test_case(&mut self, test: &KTest, forced: bool) -> bool;
}

/// Keeps every record in memory behind a shared handle; the default for
/// tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct CollectingHandler {
    pub tests: std::rc::Rc<std::cell::RefCell<Vec<KTest>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Default::default()
    }
}

impl RunHandler for CollectingHandler {
    fn process_test_case(&mut self, test: &KTest, _forced: bool) -> bool {
        self.tests.borrow_mut().push(test.clone());
        true
    }
}

/// Writes numbered `.ktest` files into a directory.
#[derive(Debug)]
pub struct DirRunHandler {
    dir: PathBuf,
    written: u32,
}

impl DirRunHandler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirRunHandler {
            dir: dir.into(),
            written: 0,
        }
    }

    pub fn written(&self) -> u32 {
        self.written
    }
}

impl RunHandler for DirRunHandler {
    fn process_test_case(&mut self, test: &KTest, _forced: bool) -> bool {
        self.written += 1;
        let path = self.dir.join(format!("test{:06}.ktest", self.written));
        match test.to_file(&path) {
            Ok(()) => true,
            Err(e) => {
                log::error!("failed to write {}: {e}", path.display());
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub clusters_explored: u32,
    pub dscenarios_explored: u32,
    pub tests_written: u32,
    pub steps: u64,
}

/// How a state asked to leave the scheduling loop.
#[derive(Debug)]
enum Exit {
    Normal,
    Early(String),
    Fault(Error),
}

/// A program running on the nodes: stepped with the active state until it
/// suspends. The guest calls back into the engine through [`Vm`].
pub trait NodeProgram {
    fn step(&mut self, vm: &mut Vm<'_>) -> Result<()>;
}

/// The guest-facing view of one scheduled step.
pub struct Vm<'a> {
    pub ctx: CallContext<'a>,
    registry: &'a Registry,
    pending_exit: Option<Exit>,
}

impl Vm<'_> {
    pub fn state(&self) -> StateId {
        self.ctx.state
    }

    pub fn node(&self) -> Node {
        self.ctx.mapper.state_node(self.ctx.state)
    }

    /// Call a special function by its C-visible name.
    pub fn call(
        &mut self,
        name: &str,
        args: &[symnet_shared::expr::ExprRef],
    ) -> Result<Option<u64>> {
        if self.pending_exit.is_some() {
            // the state is already on its way out
            return Ok(None);
        }
        match self.registry.call(&mut self.ctx, name, args) {
            Ok(Flow::Value(v)) => Ok(Some(v)),
            Ok(Flow::Void) => Ok(None),
            Ok(Flow::TerminateEarly(msg)) => {
                self.pending_exit = Some(Exit::Early(msg));
                Ok(None)
            }
            Err(e) if e.is_state_local() => {
                log::debug!("state {} faulted: {e}", self.ctx.state);
                self.pending_exit = Some(Exit::Fault(e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Normal guest exit; the scenario terminates after this step.
    pub fn exit(&mut self) {
        if self.pending_exit.is_none() {
            self.pending_exit = Some(Exit::Normal);
        }
    }

    pub fn terminated(&self) -> bool {
        self.pending_exit.is_some()
    }

    /// Engine fork visible to the guest (a symbolic branch).
    pub fn fork(&mut self) -> StateId {
        let child = self.ctx.exec.fork(self.ctx.state);
        self.ctx
            .mapper
            .on_state_forked(&mut *self.ctx.exec, self.ctx.state, child);
        child
    }
}

/// The run environment.
pub struct Runtime {
    pub config: Config,
    phony_packets: bool,
    registry: Registry,
    // teardown order: cache, then transmit handler, then mapper
    cache: PacketCache,
    transmit: TransmitHandler,
    mapper: StateMapper,
    searcher: Box<dyn Searcher>,
    pub exec: Executor,
    handler: Box<dyn RunHandler>,
    stats: Statistics,
    root: StateId,
}

impl Runtime {
    pub fn new(config: Config, handler: Box<dyn RunHandler>) -> Result<Self> {
        config.validate()?;
        let mut exec = Executor::with_structural_solver();
        let root = exec.create_state();
        let searcher = config.build_searcher();
        let phony_packets = config.phony_packets && searcher.supports_phony_packets();
        let mapper = StateMapper::create(config.state_mapping, phony_packets, root);
        let transmit = TransmitHandler::new(
            config.constraints_transmission,
            config.add_packet_symbols,
        );
        Ok(Runtime {
            config,
            phony_packets,
            registry: Registry::new(),
            cache: PacketCache::new(),
            transmit,
            mapper,
            searcher,
            exec,
            handler,
            stats: Statistics::default(),
            root,
        })
    }

    pub fn root_state(&self) -> StateId {
        self.root
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    pub fn mapper(&self) -> &StateMapper {
        &self.mapper
    }

    /// Pre-run fork, e.g. to create one boot state per node.
    pub fn fork(&mut self, parent: StateId) -> StateId {
        let child = self.exec.fork(parent);
        self.mapper.on_state_forked(&mut self.exec, parent, child);
        child
    }

    /// Affiliate a state with a node without going through the guest call.
    pub fn set_node(&mut self, state: StateId, node: Node) {
        self.mapper.set_state_node(state, node);
    }

    /// Allocate a global memory object and bind it in every live state.
    pub fn allocate_global(&mut self, name: &str, size: usize) -> Arc<MemoryObject> {
        let mo = self.exec.memory.allocate(name, size);
        let states: Vec<StateId> = self.exec.live_states().collect();
        for s in states {
            self.exec.state_mut(s).address_space.bind(&mo);
        }
        mo
    }

    /// Make a buffer symbolic on one state: the named array backs the
    /// object's bytes and is captured into that state's test records.
    pub fn make_symbolic(&mut self, state: StateId, mo: &MemoryObject, name: &str) -> ArrayRef {
        let array = Array::new(name, mo.size);
        let st = self.exec.state_mut(state);
        st.array_names.insert(name.to_owned());
        st.address_space.bind(mo).bind_array(&array);
        st.symbolics.push(SymbolicObject {
            array: array.clone(),
            mo: Some(mo.id),
        });
        array
    }

    /// Propagate forks and cluster changes to the searcher.
    fn sync_states(&mut self) {
        for (parent, child) in self.exec.take_added() {
            self.searcher.on_state_forked(parent, child);
            if self.exec.is_alive(child) {
                self.searcher.add(&[child], &self.mapper);
            }
        }
        for s in self.mapper.take_cluster_changes() {
            if self.exec.is_alive(s) {
                self.searcher.notify_cluster_change(s, &self.mapper);
            }
        }
    }

    fn build_record(&self, state: StateId, node: Node, scenario: u32, err: &str) -> KTest {
        let mut test = KTest::new();
        test.node_id = node.id().max(0) as u32;
        test.dscenario_id = scenario;
        test.err = err.to_owned();
        let st = self.exec.state(state);
        for sym in &st.symbolics {
            let bytes: Vec<u8> = match sym.mo.and_then(|id| st.address_space.find(id)) {
                Some(os) => (0..os.len())
                    .map(|i| os.read8(i).as_const().unwrap_or(0) as u8)
                    .collect(),
                None => vec![0; sym.array.size()],
            };
            test.objects.push(KTestObject {
                name: sym.array.name().to_owned(),
                bytes,
            });
        }
        test
    }

    /// Expand a single-state termination into the termination of its whole
    /// scenario. `silent` suppresses records (infeasible receivers).
    fn terminate_cluster_of(&mut self, pivot: StateId, err: &str, silent: bool) -> Result<()> {
        if !self.exec.is_alive(pivot) {
            return Ok(());
        }
        self.stats.clusters_explored += 1;
        let mut groups: Vec<(StateId, Node, Vec<(StateId, Node)>)> = Vec::new();
        self.mapper
            .terminate_cluster(&mut self.exec, pivot, &mut |s, nd, peers| {
                groups.push((s, nd, peers.to_vec()));
            });
        // explosion may have forked; let the searcher know while parents
        // are still governed
        self.sync_states();

        for (s, nd, peers) in groups {
            self.stats.dscenarios_explored += 1;
            let scenario = self.stats.dscenarios_explored;
            for (p, _) in &peers {
                transmit::transfer_constraints(&mut self.exec, *p, s)?;
            }
            for (p, _) in &peers {
                transmit::transfer_constraints(&mut self.exec, s, *p)?;
            }
            let force_all = self.config.distributed_terminate == TerminatePolicy::ForceAll;
            if !silent {
                let test = self.build_record(s, nd, scenario, err);
                if self.handler.process_test_case(&test, false) {
                    self.stats.tests_written += 1;
                }
                if self.config.distributed_terminate != TerminatePolicy::Single {
                    for (p, pn) in &peers {
                        let test = self.build_record(*p, *pn, scenario, err);
                        if self.handler.process_test_case(&test, force_all) {
                            self.stats.tests_written += 1;
                        }
                    }
                }
            } else if force_all {
                // silent terminations still produce records under force-all
                for (p, pn) in std::iter::once((&s, &nd)).chain(peers.iter().map(|(p, n)| (p, n))) {
                    let test = self.build_record(*p, *pn, scenario, err);
                    if self.handler.process_test_case(&test, true) {
                        self.stats.tests_written += 1;
                    }
                }
            }
            for (st, _) in std::iter::once((s, nd)).chain(peers.into_iter()) {
                self.cache.remove_state(st);
                self.searcher.remove(&[st]);
                self.exec.remove_state(st);
            }
        }
        Ok(())
    }

    fn commit_cache(&mut self) -> Result<()> {
        let mut tx = CacheTransmitter {
            handler: &self.transmit,
            infeasible: Vec::new(),
        };
        self.cache.commit(&mut self.exec, &mut self.mapper, &mut tx)?;
        let infeasible = tx.infeasible;
        self.sync_states();
        for r in infeasible {
            self.terminate_cluster_of(r, "", true)?;
        }
        Ok(())
    }

    /// The top-level scheduling loop: run `guest` over every live state
    /// until the pool is exhausted.
    pub fn run(&mut self, guest: &mut dyn NodeProgram) -> Result<Statistics> {
        self.exec.take_added();
        let live: Vec<StateId> = self.exec.live_states().collect();
        self.searcher.add(&live, &self.mapper);

        loop {
            if self.searcher.is_empty() {
                break;
            }
            let Some(state) = self.searcher.select_state() else {
                break;
            };
            if !self.exec.is_alive(state) {
                self.searcher.remove(&[state]);
                continue;
            }
            self.stats.steps += 1;

            let (exit, infeasible) = {
                let mut vm = Vm {
                    ctx: CallContext {
                        exec: &mut self.exec,
                        mapper: &mut self.mapper,
                        cache: &mut self.cache,
                        searcher: self.searcher.as_mut(),
                        transmit: &self.transmit,
                        config: &self.config,
                        state,
                        phony_packets: self.phony_packets,
                        infeasible: Vec::new(),
                    },
                    registry: &self.registry,
                    pending_exit: None,
                };
                guest.step(&mut vm)?;
                (vm.pending_exit, vm.ctx.infeasible)
            };
            self.sync_states();

            for r in infeasible {
                self.terminate_cluster_of(r, "", true)?;
            }
            match exit {
                None => {}
                Some(Exit::Normal) => self.terminate_cluster_of(state, "", false)?,
                Some(Exit::Early(msg)) => {
                    let err = format!("early exit: {msg}");
                    self.terminate_cluster_of(state, &err, false)?;
                }
                Some(Exit::Fault(e)) => {
                    let err = e.to_string();
                    self.terminate_cluster_of(state, &err, false)?;
                }
            }

            if self.phony_packets && self.searcher.take_commit_request() && self.cache.pending() > 0
            {
                self.commit_cache()?;
            }
            self.sync_states();
        }
        log::debug!(
            "run finished: {} clusters, {} scenarios, {} tests",
            self.stats.clusters_explored,
            self.stats.dscenarios_explored,
            self.stats.tests_written
        );
        Ok(self.stats)
    }
}
