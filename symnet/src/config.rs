// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Run configuration: typed targets for the CLI surface.

use symnet_shared::error::{Error, Result};
use symnet_shared::Time;

use crate::mapper::MappingAlgorithm;
use crate::searcher::{
    ClusterSearcher, CoojaSearcher, FifoStrategy, LockStepSearcher, NullStrategy, RandomStrategy,
    RepeatStrategy, Searcher, SearcherStrategy,
};
use crate::transmit::ConstraintPolicy;

/// What to do when a distributed scenario terminates.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TerminatePolicy {
    /// One test case, for the state that terminates.
    Single,
    /// One test case per peer, through the standard generator (which may
    /// drop records that carry no new information).
    #[default]
    Uniform,
    /// One test case per peer, unconditionally.
    ForceAll,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SearcherKind {
    #[default]
    LockStep,
    Cooja,
    LockStepCluster,
    CoojaCluster,
}

impl SearcherKind {
    pub fn is_clustered(&self) -> bool {
        matches!(
            self,
            SearcherKind::LockStepCluster | SearcherKind::CoojaCluster
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StrategyKind {
    #[default]
    Null,
    Fifo,
    Random,
}

/// Everything a run needs to know. Defaults mirror the flag defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// `--state-mapping`, default `super`.
    pub state_mapping: MappingAlgorithm,
    /// `--phony-packets`, default off.
    pub phony_packets: bool,
    /// `--distributed-terminate`, default `uniform`.
    pub distributed_terminate: TerminatePolicy,
    /// `--constraints-transmission`, default `closure`.
    pub constraints_transmission: ConstraintPolicy,
    /// Searcher selection, default lock-step.
    pub searcher: SearcherKind,
    /// `--fifo-strategy` / `--random-strategy` for cluster searchers.
    pub strategy: StrategyKind,
    /// `--lockstep-increment`, default 1.
    pub lockstep_increment: Time,
    /// `--cluster-instructions`, default 10000: how many consecutive
    /// selections stay with one cluster.
    pub cluster_instructions: usize,
    /// `--add-packet-symbols`: attach transmitted payload symbols as
    /// visible objects.
    pub add_packet_symbols: bool,
    /// Seed for the random strategy.
    pub random_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_mapping: MappingAlgorithm::SuperDState,
            phony_packets: false,
            distributed_terminate: TerminatePolicy::Uniform,
            constraints_transmission: ConstraintPolicy::Closure,
            searcher: SearcherKind::LockStep,
            strategy: StrategyKind::Null,
            lockstep_increment: 1,
            cluster_instructions: 10_000,
            add_packet_symbols: false,
            random_seed: 0x5eed,
        }
    }
}

impl Config {
    pub fn parse_state_mapping(value: &str) -> Result<MappingAlgorithm> {
        Ok(match value {
            "cob" => MappingAlgorithm::CopyOnBranch,
            "cow" => MappingAlgorithm::CopyOnWrite,
            "cow2" => MappingAlgorithm::CopyOnWrite2,
            "super" => MappingAlgorithm::SuperDState,
            "super-bfc" => MappingAlgorithm::SuperDStateBfClustering,
            "super-sc" => MappingAlgorithm::SuperDStateSmartClustering,
            other => {
                return Err(Error::CliBadValue(format!(
                    "unknown state mapping algorithm '{other}'"
                )))
            }
        })
    }

    pub fn parse_distributed_terminate(value: &str) -> Result<TerminatePolicy> {
        Ok(match value {
            "single" => TerminatePolicy::Single,
            "uniform" => TerminatePolicy::Uniform,
            "force-all" => TerminatePolicy::ForceAll,
            other => {
                return Err(Error::CliBadValue(format!(
                    "unknown distributed-terminate policy '{other}'"
                )))
            }
        })
    }

    pub fn parse_constraints_transmission(value: &str) -> Result<ConstraintPolicy> {
        Ok(match value {
            "closure" => ConstraintPolicy::Closure,
            "force-all" => ConstraintPolicy::ForceAll,
            other => {
                return Err(Error::CliBadValue(format!(
                    "unknown constraints-transmission policy '{other}'"
                )))
            }
        })
    }

    /// Cross-field checks the flag parser cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.searcher.is_clustered() && !self.state_mapping.supports_clustering() {
            return Err(Error::CliConflict(format!(
                "a cluster searcher requires a clustering state mapping, not {:?}",
                self.state_mapping
            )));
        }
        Ok(())
    }

    fn build_strategy(&self) -> Box<dyn SearcherStrategy> {
        let base: Box<dyn SearcherStrategy> = match self.strategy {
            StrategyKind::Null => Box::new(NullStrategy::default()),
            StrategyKind::Fifo => Box::new(FifoStrategy::default()),
            StrategyKind::Random => Box::new(RandomStrategy::new(self.random_seed)),
        };
        if self.cluster_instructions > 1 {
            Box::new(RepeatStrategy::new(base, self.cluster_instructions))
        } else {
            base
        }
    }

    /// Build the configured searcher. The packet cache always exists in a
    /// run environment, so every searcher supports phony packets.
    pub fn build_searcher(&self) -> Box<dyn Searcher> {
        let increment = self.lockstep_increment;
        match self.searcher {
            SearcherKind::LockStep => Box::new(LockStepSearcher::new(increment, true)),
            SearcherKind::Cooja => Box::new(CoojaSearcher::new(true)),
            SearcherKind::LockStepCluster => Box::new(ClusterSearcher::new(
                self.build_strategy(),
                Box::new(move || {
                    Box::new(LockStepSearcher::new(increment, true)) as Box<dyn Searcher>
                }),
            )),
            SearcherKind::CoojaCluster => Box::new(ClusterSearcher::new(
                self.build_strategy(),
                Box::new(|| Box::new(CoojaSearcher::new(true)) as Box<dyn Searcher>),
            )),
        }
    }
}
