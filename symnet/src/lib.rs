// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! SymNet: a distributed-system layer over a symbolic execution engine.
//!
//! A single engine instance explores the symbolic state spaces of several
//! cooperating network nodes at once. The layer keeps track of which
//! per-node states are mutually consistent (distributed scenarios), forks
//! states on demand when a transmission would otherwise be ambiguous, and
//! rewrites symbolic packet payloads together with the minimal set of
//! sender constraints so that the joint constraint system stays sound.
//!
//! The crate is organised bottom up:
//!
//! - [`executor`] is the facade over the underlying symbolic executor:
//!   the state arena with fork support, constraint managers, the solver
//!   seam and byte-addressed memory.
//! - [`symbols`], [`graph`] and [`txdata`] implement the distributed-symbol
//!   registry, the constraint dependency graph and the per-transmission
//!   payload rewriting.
//! - [`mapper`] maintains distributed scenarios under four mapping
//!   algorithms.
//! - [`cache`] and [`transmit`] queue, deduplicate and deliver packets.
//! - [`searcher`] schedules states (lock-step, discrete-event, or
//!   cluster-partitioned).
//! - [`sfh`] binds the guest-callable special functions.
//! - [`runtime`] ties everything into a run environment with distributed
//!   termination.

pub mod cache;
pub mod config;
pub mod executor;
pub mod graph;
pub mod mapper;
pub mod runtime;
pub mod searcher;
pub mod sfh;
pub mod symbols;
pub mod transmit;
pub mod txdata;

pub use symnet_shared::error::{Error, Result};
pub use symnet_shared::{Node, NodeId, Time, FIRST_NODE, INVALID_NODE};
