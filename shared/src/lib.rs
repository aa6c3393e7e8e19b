// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Shared types for the SymNet distributed symbolic execution layer.
//!
//! This crate is the leaf of the workspace: node identities, virtual time,
//! the symbolic expression algebra the rest of the system is written
//! against, and the error kinds surfaced to embedders.

pub mod error;
pub mod expr;
pub mod node;
pub mod time;

pub use node::{Node, NodeId, FIRST_NODE, INVALID_NODE};
pub use time::Time;
