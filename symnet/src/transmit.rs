// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Delivery of a mapped transmission into a receiver state.
//!
//! Given a (sender, receiver) pair produced by the mapper, the handler
//! writes the translated payload into the receiver's destination memory
//! and imports the required sender constraints plus the symbol
//! declarations they mention, checking each constraint against the
//! receiver's constraint set on the way in.

use itertools::Itertools;
use symnet_shared::error::{Error, Result};
use symnet_shared::expr::{self, ExprRef};
use symnet_shared::Node;

use crate::cache::{DataAtom, PacketInfo, Transmitter};
use crate::executor::{Executor, StateId, SymbolicObject, Validity};
use crate::txdata::{GeneratedSymbol, PerReceiverData, TransmissionKind, TxContext};

/// How the constraints accompanying a symbolic payload are chosen.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ConstraintPolicy {
    /// Minimal closure over the payload symbols.
    #[default]
    Closure,
    /// Everything touching any distributed symbol of the sender.
    ForceAll,
}

/// Whether a delivery kept the receiver feasible.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransmitOutcome {
    Delivered,
    /// The receiver's constraint set became unsatisfiable; the caller
    /// terminates that receiver path silently.
    Infeasible,
}

/// Result of translating a payload towards one receiver.
pub struct Extraction {
    /// The payload expressions in receiver form.
    pub payload: Vec<ExprRef>,
    /// The accompanying constraints in receiver form, not yet installed.
    pub constraints: Vec<ExprRef>,
}

/// Translate `seq` from `from` towards `onto` and collect the constraint
/// set per `force_all`. New-symbol installation (names, sender-side
/// pinning) happens immediately; the constraints are left to the caller.
pub fn extract_for(
    exec: &mut Executor,
    from: (StateId, Node),
    onto: (StateId, Node),
    kind: TransmissionKind,
    seq: Vec<ExprRef>,
    force_all: bool,
    attach_objects: bool,
) -> Result<Extraction> {
    let (from_id, from_node) = from;
    let (onto_id, onto_node) = onto;
    exec.state_mut(from_id).configure(from_id, from_node);
    exec.state_mut(onto_id).configure(onto_id, onto_node);

    let current_tx = exec.state(from_id).completed_transmissions + 1;
    let (extraction, news) = {
        let (sender, receiver) = exec.state_pair_mut(from_id, onto_id);
        let sender_cm = &sender.constraints;
        let cfg = sender.config.as_mut().expect("configured above");
        cfg.tx_data(current_tx, kind, || seq);
        let (tx, src, graph) = cfg.tx_parts();
        let dest = &mut receiver.config.as_mut().expect("configured above").symbols;
        let mut cx = TxContext {
            tx,
            src,
            graph,
            sender_cm,
            dest,
        };
        let mut prd = PerReceiverData::new(&cx);
        let mut payload = Vec::with_capacity(cx.tx.payload_len());
        for i in 0..cx.tx.payload_len() {
            payload.push(prd.translate(&mut cx, i)?);
        }
        let constraints = if prd.is_non_const_transmission(&cx) {
            prd.compute_new_receiver_constraints(&mut cx, force_all)?
        } else {
            Vec::new()
        };
        let news = prd.new_symbols(&mut cx);
        (
            Extraction {
                payload,
                constraints,
            },
            news,
        )
    };
    install_generated_symbols(exec, &news, from_id, from_node, onto_node, attach_objects)?;
    Ok(extraction)
}

/// Install freshly generated symbols on their states: reserve the name,
/// pin sender-owned pairs together with an equality, optionally attach a
/// visible memory object.
fn install_generated_symbols(
    exec: &mut Executor,
    news: &[GeneratedSymbol],
    sender: StateId,
    src: Node,
    dest: Node,
    attach_objects: bool,
) -> Result<()> {
    for sym in news {
        let state = exec.state_mut(sym.belongs_to);
        let fresh = state.array_names.insert(sym.translated.name().to_owned());
        if !fresh {
            let distributed = state
                .config
                .as_ref()
                .map(|c| c.symbols.is_distributed(&sym.translated))
                .unwrap_or(false);
            if !distributed {
                return Err(Error::NameCollision {
                    src,
                    dest,
                    symbol: sym.was.name().to_owned(),
                    translated: sym.translated.name().to_owned(),
                });
            }
        }
        if sym.belongs_to == sender {
            // the sender's local and distributed views of the symbol are
            // pinned together
            let pin = expr::array_equality(&sym.was, &sym.translated);
            exec.state_mut(sender).constraints.add(pin);
        } else if attach_objects {
            let mo = exec
                .memory
                .allocate(sym.translated.name(), sym.translated.size());
            let state = exec.state_mut(sym.belongs_to);
            state.address_space.bind(&mo).bind_array(&sym.translated);
            state.symbolics.push(SymbolicObject {
                array: sym.translated.clone(),
                mo: Some(mo.id),
            });
        }
    }
    Ok(())
}

/// Add `constraints` to `receiver`, checking each against the existing
/// set. Returns `false` as soon as one is refuted.
pub fn install_constraints(
    exec: &mut Executor,
    receiver: StateId,
    constraints: &[ExprRef],
) -> bool {
    for c in constraints {
        let simplified = exec.state(receiver).constraints.simplify(c);
        match exec.evaluate(receiver, &simplified) {
            Validity::True => {
                // already implied
            }
            Validity::False => {
                log::debug!("constraint refuted on {receiver}; path infeasible");
                return false;
            }
            Validity::Unknown => {
                exec.state_mut(receiver).constraints.add(simplified);
            }
        }
    }
    true
}

/// Merge the constraints of `from` into `onto`, translating distributed
/// symbols on the way. Used pairwise at scenario termination. Returns
/// whether `onto` stayed feasible.
pub fn transfer_constraints(exec: &mut Executor, from: StateId, onto: StateId) -> Result<bool> {
    let (from_cfg, onto_cfg) = (
        exec.state(from).config.as_ref().map(|c| c.node),
        exec.state(onto).config.as_ref().map(|c| c.node),
    );
    let (Some(from_node), Some(onto_node)) = (from_cfg, onto_cfg) else {
        // a state that never communicated has nothing to transfer
        return Ok(true);
    };
    let arrays: Vec<_> = exec
        .state(from)
        .config
        .as_ref()
        .expect("checked above")
        .symbols
        .arrays()
        .cloned()
        .sorted_by(|a, b| a.name().cmp(b.name()).then(a.id().cmp(&b.id())))
        .collect();
    let seq: Vec<ExprRef> = arrays.iter().map(expr::complete_read).collect();
    if seq.is_empty() {
        return Ok(true);
    }
    let extraction = extract_for(
        exec,
        (from, from_node),
        (onto, onto_node),
        TransmissionKind::Merge,
        seq,
        true,
        false,
    )?;
    Ok(install_constraints(exec, onto, &extraction.constraints))
}

/// The transmit handler: glue between cache commits and receiver
/// materialisation.
#[derive(Debug, Default)]
pub struct TransmitHandler {
    pub constraints_transmission: ConstraintPolicy,
    pub add_packet_symbols: bool,
}

impl TransmitHandler {
    pub fn new(constraints_transmission: ConstraintPolicy, add_packet_symbols: bool) -> Self {
        TransmitHandler {
            constraints_transmission,
            add_packet_symbols,
        }
    }

    /// Deliver one mapped transmission.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_transmission(
        &self,
        exec: &mut Executor,
        pi: &PacketInfo,
        sender: StateId,
        receiver: StateId,
        sender_node: Node,
        receiver_node: Node,
        data: &[DataAtom],
    ) -> Result<TransmitOutcome> {
        let current_tx = exec.state(sender).completed_transmissions + 1;
        log::debug!(
            "transmission #{current_tx}: node {sender_node} ({sender}) -> node {receiver_node} ({receiver})"
        );
        let seq: Vec<ExprRef> = data.iter().map(DataAtom::to_expr).collect();
        let force_all = self.constraints_transmission == ConstraintPolicy::ForceAll;
        let extraction = extract_for(
            exec,
            (sender, sender_node),
            (receiver, receiver_node),
            TransmissionKind::Tx,
            seq,
            force_all,
            self.add_packet_symbols,
        )?;

        // write the payload; shorter payloads wrap, longer ones truncate
        let os = exec
            .state_mut(receiver)
            .address_space
            .writable(pi.dest_mo)
            .expect("destination object not found on receiver");
        for i in 0..pi.length {
            let b = extraction.payload[i % extraction.payload.len()].clone();
            os.write8(pi.offset as usize + i, b);
        }

        if extraction.constraints.is_empty() {
            // purely concrete packet
            return Ok(TransmitOutcome::Delivered);
        }
        if !install_constraints(exec, receiver, &extraction.constraints) {
            return Ok(TransmitOutcome::Infeasible);
        }
        Ok(TransmitOutcome::Delivered)
    }
}

/// Adapter that lets the packet cache drive a [`TransmitHandler`] and
/// collect infeasible receivers for the runtime to reap.
pub struct CacheTransmitter<'a> {
    pub handler: &'a TransmitHandler,
    pub infeasible: Vec<StateId>,
}

impl Transmitter for CacheTransmitter<'_> {
    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &mut self,
        exec: &mut Executor,
        pi: &PacketInfo,
        sender: StateId,
        sender_node: Node,
        receiver: StateId,
        receiver_node: Node,
        data: &[DataAtom],
    ) -> Result<()> {
        let outcome = self.handler.handle_transmission(
            exec,
            pi,
            sender,
            receiver,
            sender_node,
            receiver_node,
            data,
        )?;
        if outcome == TransmitOutcome::Infeasible {
            self.infeasible.push(receiver);
        }
        Ok(())
    }
}
