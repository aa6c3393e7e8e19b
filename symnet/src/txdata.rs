// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Per-transmission payload rewriting.
//!
//! While a sender state has a pending transmission it carries a [`TxData`]:
//! the payload expressions, the set of sender symbols discovered in them,
//! and the gate that forbids late symbol discovery once the constraint
//! closure has been computed. For every receiver a [`PerReceiverData`]
//! lazily translates payload atoms and sender constraints into the
//! receiver's symbol images, memoised by payload index.

use std::collections::HashMap;

use symnet_shared::error::Result;
use symnet_shared::expr::visit::substitute_arrays;
use symnet_shared::expr::{ArrayRef, ExprRef};
use symnet_shared::Node;

use crate::executor::{ConstraintManager, StateId};
use crate::graph::ConstraintsGraph;
use crate::symbols::DistSymbols;

/// What a transmission is for; affects bookkeeping, not the rewriting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransmissionKind {
    /// A regular packet send.
    Tx,
    /// A pull request (`kn_reverse_memcpy`).
    Pull,
    /// Constraint merging between peers at termination.
    Merge,
}

/// Distributed configuration record attached to a state on first need:
/// symbol registry, constraint dependency graph, pending transmission.
#[derive(Debug)]
pub struct ConfigurationData {
    pub state: StateId,
    pub node: Node,
    pub symbols: DistSymbols,
    pub graph: ConstraintsGraph,
    tx: Option<TxData>,
}

impl ConfigurationData {
    pub fn new(state: StateId, node: Node) -> Self {
        ConfigurationData {
            state,
            node,
            symbols: DistSymbols::new(state, node),
            graph: ConstraintsGraph::new(),
            tx: None,
        }
    }

    /// Record for a fork of this state. The registry carries over with
    /// fresh cross-links; a pending transmission does not.
    pub fn fork_for(&self, child: StateId) -> Self {
        ConfigurationData {
            state: child,
            node: self.node,
            symbols: self.symbols.fork_for(child),
            graph: self.graph.clone(),
            tx: None,
        }
    }

    /// The pending [`TxData`] for transmission number `current_tx`,
    /// creating it (and discarding any stale one) as needed.
    pub fn tx_data(
        &mut self,
        current_tx: usize,
        kind: TransmissionKind,
        seq: impl FnOnce() -> Vec<ExprRef>,
    ) -> &mut TxData {
        let stale = match &self.tx {
            Some(tx) => tx.current_tx != current_tx || tx.kind != kind,
            None => true,
        };
        if stale {
            self.tx = Some(TxData::new(current_tx, kind, seq()));
        }
        self.tx.as_mut().expect("just installed")
    }

    pub fn pending_tx(&self) -> Option<&TxData> {
        self.tx.as_ref()
    }

    /// Split borrow for the transmission machinery: the pending tx, the
    /// sender registry and the dependency graph.
    pub fn tx_parts(&mut self) -> (&mut TxData, &mut DistSymbols, &mut ConstraintsGraph) {
        (
            self.tx.as_mut().expect("no pending transmission"),
            &mut self.symbols,
            &mut self.graph,
        )
    }
}

/// The sender-side record of one pending transmission.
#[derive(Debug)]
pub struct TxData {
    pub current_tx: usize,
    pub kind: TransmissionKind,
    seq: Vec<ExprRef>,
    /// Sender arrays appearing in the payload or its dependencies, in
    /// discovery order.
    sender_symbols: Vec<ArrayRef>,
    /// Cleared by the first constraint-closure computation; afterwards the
    /// payload must not reveal new symbols.
    allow_more_packet_symbols: bool,
    sender_reflexives_computed: bool,
    /// Untranslated constraint closure, cached across receivers.
    sender_constraints: Option<Vec<ExprRef>>,
}

impl TxData {
    fn new(current_tx: usize, kind: TransmissionKind, seq: Vec<ExprRef>) -> Self {
        TxData {
            current_tx,
            kind,
            seq,
            sender_symbols: Vec::new(),
            allow_more_packet_symbols: true,
            sender_reflexives_computed: false,
            sender_constraints: None,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.seq.len()
    }

    pub fn sender_symbols(&self) -> &[ArrayRef] {
        &self.sender_symbols
    }

    fn note_symbol(&mut self, array: &ArrayRef) -> bool {
        if self.sender_symbols.contains(array) {
            return false;
        }
        debug_assert!(
            self.allow_more_packet_symbols,
            "found a new packet symbol after the symbol set was frozen"
        );
        self.sender_symbols.push(array.clone());
        true
    }

    /// The sender-side constraint closure for this transmission. Under
    /// `force_all` the request covers every distributed symbol of the
    /// sender, not just the payload symbols.
    fn compute_sender_constraints(
        &mut self,
        graph: &mut ConstraintsGraph,
        src: &DistSymbols,
        cm: &ConstraintManager,
        force_all: bool,
    ) -> &[ExprRef] {
        if self.sender_constraints.is_none() {
            let mut request: Vec<ArrayRef> = self.sender_symbols.clone();
            if force_all {
                for a in src.arrays() {
                    if !request.contains(a) {
                        request.push(a.clone());
                    }
                }
            }
            self.sender_constraints = Some(graph.eval(cm, request.iter()));
        }
        self.sender_constraints.as_deref().expect("just computed")
    }
}

/// A fully qualified new symbol produced by a transmission: the state it
/// must be installed on, the array it was, and its translated image.
#[derive(Debug, Clone)]
pub struct GeneratedSymbol {
    pub belongs_to: StateId,
    pub was: ArrayRef,
    pub translated: ArrayRef,
}

/// Borrowed context for translating one sender's pending transmission
/// towards one receiver.
pub struct TxContext<'a> {
    pub tx: &'a mut TxData,
    pub src: &'a mut DistSymbols,
    pub graph: &'a mut ConstraintsGraph,
    pub sender_cm: &'a ConstraintManager,
    pub dest: &'a mut DistSymbols,
}

/// Receiver-side view of a pending transmission: lazily memoised payload
/// translation plus the translated constraint closure.
#[derive(Debug, Default)]
pub struct PerReceiverData {
    lookup: Vec<Option<ExprRef>>,
    tx_map: HashMap<ArrayRef, ArrayRef>,
    constraints_computed: bool,
    receiver_constraints: Vec<ExprRef>,
}

impl PerReceiverData {
    pub fn new(cx: &TxContext<'_>) -> Self {
        PerReceiverData {
            lookup: vec![None; cx.tx.payload_len()],
            ..Default::default()
        }
    }

    fn translate_expr(&mut self, cx: &mut TxContext<'_>, expr: &ExprRef) -> Result<ExprRef> {
        let tx_number = cx.tx.current_tx;
        substitute_arrays(expr, &mut |array| {
            cx.tx.note_symbol(array);
            if let Some(t) = self.tx_map.get(array) {
                return t.clone();
            }
            let translated = cx.src.locate(array, tx_number, cx.dest);
            self.tx_map.insert(array.clone(), translated.clone());
            translated
        })
    }

    /// Translate payload atom `index`, memoised modulo the payload length.
    /// Epsilon payloads are forbidden.
    pub fn translate(&mut self, cx: &mut TxContext<'_>, index: usize) -> Result<ExprRef> {
        assert!(
            !self.lookup.is_empty(),
            "epsilon cannot be expanded into a non-empty sequence"
        );
        let norm = index % self.lookup.len();
        if let Some(e) = &self.lookup[norm] {
            return Ok(e.clone());
        }
        let source = cx.tx.seq[norm].clone();
        let translated = self.translate_expr(cx, &source)?;
        self.lookup[norm] = Some(translated.clone());
        Ok(translated)
    }

    /// Force translation of the whole payload, populating the symbol set.
    pub fn precompute(&mut self, cx: &mut TxContext<'_>) -> Result<()> {
        for i in 0..self.lookup.len() {
            self.translate(cx, i)?;
        }
        Ok(())
    }

    /// True when the transmission involves any symbolic data at all.
    pub fn is_non_const_transmission(&self, cx: &TxContext<'_>) -> bool {
        !(cx.tx.sender_symbols.is_empty() && self.tx_map.is_empty())
    }

    /// The sender's constraint closure translated to receiver form.
    /// Idempotent; the first call freezes the packet symbol set.
    pub fn compute_new_receiver_constraints(
        &mut self,
        cx: &mut TxContext<'_>,
        force_all: bool,
    ) -> Result<Vec<ExprRef>> {
        if !self.constraints_computed {
            self.constraints_computed = true;
            cx.tx.allow_more_packet_symbols = false;
            let sender_constraints: Vec<ExprRef> = cx
                .tx
                .compute_sender_constraints(cx.graph, cx.src, cx.sender_cm, force_all)
                .to_vec();
            let mut out = Vec::with_capacity(sender_constraints.len());
            for c in &sender_constraints {
                out.push(self.translate_expr(cx, c)?);
            }
            self.receiver_constraints = out;
        }
        Ok(self.receiver_constraints.clone())
    }

    /// Pairs `(original, local image)` for sender symbols whose own-state
    /// image differs from the original; the caller pins them together with
    /// an equality on the sender.
    pub fn additional_sender_only_constraints(
        &mut self,
        cx: &mut TxContext<'_>,
    ) -> Vec<(ArrayRef, ArrayRef)> {
        let mut out = Vec::new();
        if !cx.tx.sender_reflexives_computed {
            cx.tx.sender_reflexives_computed = true;
            cx.tx.allow_more_packet_symbols = false;
            let tx_number = cx.tx.current_tx;
            let symbols: Vec<ArrayRef> = cx.tx.sender_symbols.clone();
            for s in symbols {
                let reflex = cx.src.locate_local(&s, tx_number);
                if reflex != s {
                    out.push((s, reflex));
                }
            }
        }
        out
    }

    /// Every new symbol this transmission generates, sender side first.
    pub fn new_symbols(&mut self, cx: &mut TxContext<'_>) -> Vec<GeneratedSymbol> {
        let sender_only = self.additional_sender_only_constraints(cx);
        let mut out = Vec::with_capacity(sender_only.len() + self.tx_map.len());
        for (was, translated) in sender_only {
            out.push(GeneratedSymbol {
                belongs_to: cx.src.state,
                was,
                translated,
            });
        }
        let mut pairs: Vec<(&ArrayRef, &ArrayRef)> = self
            .tx_map
            .iter()
            .filter(|(was, translated)| was != translated)
            .collect();
        pairs.sort_by(|a, b| a.1.name().cmp(b.1.name()));
        for (was, translated) in pairs {
            out.push(GeneratedSymbol {
                belongs_to: cx.dest.state,
                was: was.clone(),
                translated: translated.clone(),
            });
        }
        out
    }
}
