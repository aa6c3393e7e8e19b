// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Command line driver: runs a small built-in broadcast scenario through
//! the engine layer, mostly useful for smoke-testing configurations and
//! producing test records to inspect.
//!
//! Exit codes: 0 on success, 1 for invalid arguments, 2 for runtime
//! errors.

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use symnet::config::{Config, SearcherKind, StrategyKind};
use symnet::executor::StateId;
use symnet::runtime::{DirRunHandler, NodeProgram, Runtime, Vm};
use symnet_shared::error::Error;
use symnet_shared::expr;
use symnet_shared::{Node, NodeId};

#[derive(Parser, Debug)]
#[command(name = "symnet-run", about, version)]
struct Args {
    /// State mapping algorithm: cob|cow|cow2|super|super-bfc|super-sc
    #[arg(long, default_value = "super")]
    state_mapping: String,

    /// Allow transmissions to stay pending until a scheduler quiescent point
    #[arg(long)]
    phony_packets: bool,

    /// Scenario termination policy: single|uniform|force-all
    #[arg(long, default_value = "uniform")]
    distributed_terminate: String,

    /// Constraint selection on transmission: closure|force-all
    #[arg(long, default_value = "closure")]
    constraints_transmission: String,

    /// Use the lock-step searcher
    #[arg(long)]
    use_lockstep_search: bool,

    /// Use the discrete-event (Cooja-style) searcher
    #[arg(long)]
    use_cooja_search: bool,

    /// Cluster-partitioned lock-step search
    #[arg(long)]
    use_lockstep_cluster_search: bool,

    /// Cluster-partitioned discrete-event search
    #[arg(long)]
    use_cooja_cluster_search: bool,

    /// Virtual time increment per lock-step epoch
    #[arg(long, default_value_t = 1)]
    lockstep_increment: u64,

    /// Consecutive selections a cluster keeps before rotation
    #[arg(long, default_value_t = 10_000)]
    cluster_instructions: usize,

    /// Round-robin cluster strategy
    #[arg(long)]
    fifo_strategy: bool,

    /// Random cluster strategy
    #[arg(long)]
    random_strategy: bool,

    /// Attach transmitted payload symbols as visible objects
    #[arg(long)]
    add_packet_symbols: bool,

    /// Number of nodes in the demo scenario
    #[arg(long, default_value_t = 2)]
    nodes: NodeId,

    /// Where test records are written
    #[arg(long, default_value = "symnet-out")]
    output_dir: String,
}

fn config_from_args(args: &Args) -> Result<Config, Error> {
    let mut config = Config {
        state_mapping: Config::parse_state_mapping(&args.state_mapping)?,
        phony_packets: args.phony_packets,
        distributed_terminate: Config::parse_distributed_terminate(&args.distributed_terminate)?,
        constraints_transmission: Config::parse_constraints_transmission(
            &args.constraints_transmission,
        )?,
        lockstep_increment: args.lockstep_increment,
        cluster_instructions: args.cluster_instructions,
        add_packet_symbols: args.add_packet_symbols,
        ..Default::default()
    };

    let searchers = [
        (args.use_lockstep_search, SearcherKind::LockStep),
        (args.use_cooja_search, SearcherKind::Cooja),
        (args.use_lockstep_cluster_search, SearcherKind::LockStepCluster),
        (args.use_cooja_cluster_search, SearcherKind::CoojaCluster),
    ];
    let picked: Vec<SearcherKind> = searchers
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, k)| *k)
        .collect();
    match picked.as_slice() {
        [] => {}
        [one] => config.searcher = *one,
        more => {
            return Err(Error::CliConflict(format!(
                "more than one searcher selected: {more:?}"
            )))
        }
    }

    match (args.fifo_strategy, args.random_strategy) {
        (false, false) => {}
        (true, false) => config.strategy = StrategyKind::Fifo,
        (false, true) => config.strategy = StrategyKind::Random,
        (true, true) => {
            return Err(Error::CliConflict(
                "both --fifo-strategy and --random-strategy selected".to_owned(),
            ))
        }
    }

    config.validate()?;
    Ok(config)
}

const MSG_LEN: usize = 4;

/// The demo guest: node 1 broadcasts a symbolic message, everyone else
/// receives and exits.
struct Broadcast {
    nodes: NodeId,
    inbox_addr: u64,
    msg_addr: u64,
    assigned: HashMap<StateId, NodeId>,
    phase: HashMap<StateId, u8>,
}

impl Broadcast {
    fn phase_of(&self, state: StateId) -> u8 {
        // forked receivers resume at the exit phase
        *self.phase.get(&state).unwrap_or(&2)
    }
}

impl NodeProgram for Broadcast {
    fn step(&mut self, vm: &mut Vm<'_>) -> symnet_shared::error::Result<()> {
        let state = vm.state();
        match self.phase_of(state) {
            0 => {
                let id = self.assigned[&state];
                vm.call("kn_set_node_id", &[expr::constant(id as u64, 32)])?;
                self.phase.insert(state, 1);
            }
            1 => {
                if vm.node() == Node(1) {
                    for dest in 2..=self.nodes {
                        vm.call(
                            "kn_memcpy",
                            &[
                                expr::constant(self.inbox_addr, 64),
                                expr::constant(self.msg_addr, 64),
                                expr::constant(MSG_LEN as u64, 32),
                                expr::constant(dest as u64, 32),
                            ],
                        )?;
                    }
                }
                self.phase.insert(state, 2);
            }
            _ => vm.exit(),
        }
        Ok(())
    }
}

fn run(args: &Args, config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.output_dir)?;
    let handler = DirRunHandler::new(&args.output_dir);
    let mut rt = Runtime::new(config, Box::new(handler))?;

    let inbox = rt.allocate_global("inbox", MSG_LEN);
    let msg = rt.allocate_global("msg", MSG_LEN);

    // one boot state per node
    let mut assigned = HashMap::new();
    let mut phase = HashMap::new();
    let root = rt.root_state();
    assigned.insert(root, 1);
    phase.insert(root, 0);
    for id in 2..=args.nodes {
        let s = rt.fork(root);
        assigned.insert(s, id);
        phase.insert(s, 0);
    }
    // the broadcast payload is symbolic on the sender
    rt.make_symbolic(root, &msg, "msg");

    let mut guest = Broadcast {
        nodes: args.nodes,
        inbox_addr: inbox.addr,
        msg_addr: msg.addr,
        assigned,
        phase,
    };
    let stats = rt.run(&mut guest)?;
    println!(
        "done: {} scenario(s) explored, {} test record(s) in {}",
        stats.dscenarios_explored, stats.tests_written, args.output_dir
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    if args.nodes < 1 {
        eprintln!("error: --nodes must be at least 1");
        return ExitCode::from(1);
    }
    let config = match config_from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };
    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("runtime error: {e}");
            ExitCode::from(2)
        }
    }
}
