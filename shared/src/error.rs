// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::node::{Node, NodeId, FIRST_NODE};

/// Result alias used by the expression helpers and everything above them.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the distributed layer.
///
/// The propagation policy is split by blast radius: variants tied to a
/// single state ([`Error::SymbolicIndex`], [`Error::InvalidNodeId`],
/// [`Error::NonConstArg`]) terminate that state only;
/// [`Error::Infeasible`] silently terminates the receiver path;
/// [`Error::NameCollision`] is a model bug and aborts the whole run;
/// the CLI variants abort startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(
        "while translating a read of '{array}': encountered a symbolic index, \
         which is not supported for packet data"
    )]
    SymbolicIndex { array: String },

    #[error(
        "in transmission of symbol '{symbol}' from node {src} to node {dest}: \
         symbol '{translated}' already exists on the target state; this is \
         either a bug in the engine or the symbol name contains the reserved \
         marker '{{'"
    )]
    NameCollision {
        src: Node,
        dest: Node,
        symbol: String,
        translated: String,
    },

    #[error("receiver constraint set became unsatisfiable during transmission")]
    Infeasible,

    #[error(
        "invalid node id ({id}): node ids start at {first} and {id} is reserved \
         or out of range",
        first = FIRST_NODE.0
    )]
    InvalidNodeId { id: NodeId },

    #[error(
        "argument {index} of {count} to special function `{binding}` does not \
         evaluate to a constant expression"
    )]
    NonConstArg {
        binding: &'static str,
        index: usize,
        count: usize,
    },

    #[error("conflicting command line options: {0}")]
    CliConflict(String),

    #[error("unrecognised command line value: {0}")]
    CliBadValue(String),
}

impl Error {
    /// True for errors that terminate the offending state but leave the rest
    /// of the exploration running.
    pub fn is_state_local(&self) -> bool {
        matches!(
            self,
            Error::SymbolicIndex { .. }
                | Error::Infeasible
                | Error::InvalidNodeId { .. }
                | Error::NonConstArg { .. }
        )
    }
}
