// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use symnet_shared::expr::{self, Expr, ExprRef};

/// Outcome of a solver validity query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Validity {
    /// The expression is implied by the constraint set.
    True,
    /// The expression contradicts the constraint set.
    False,
    Unknown,
}

/// An ordered set of path constraints. Indices are stable: constraints are
/// only ever appended, which the incremental dependency graph relies on.
#[derive(Debug, Clone, Default)]
pub struct ConstraintManager {
    constraints: Vec<ExprRef>,
}

impl ConstraintManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExprRef> {
        self.constraints.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ExprRef> {
        self.constraints.get(index)
    }

    /// Append a constraint. Trivially-true and duplicate constraints are
    /// dropped.
    pub fn add(&mut self, constraint: ExprRef) {
        if constraint.as_const() == Some(1) {
            return;
        }
        if self.constraints.contains(&constraint) {
            return;
        }
        self.constraints.push(constraint);
    }

    /// Rewrite `expr` against this constraint set: constant folding plus
    /// replacement of whole constraints already known to hold.
    pub fn simplify(&self, expr: &ExprRef) -> ExprRef {
        if let Some(v) = expr.as_const() {
            return expr::constant(v, expr.width());
        }
        if self.constraints.contains(expr) {
            return expr::make_true();
        }
        expr.clone()
    }
}

/// Decides validity of expressions against a state's constraint set.
///
/// The engine proper plugs in a real SMT-backed implementation; the
/// [`StructuralSolver`] shipped here decides only what syntax alone can.
pub trait Solver {
    fn evaluate(&self, constraints: &ConstraintManager, expr: &ExprRef) -> Validity;
}

/// Purely syntactic solver: constant folding and membership in the
/// constraint set. Anything else is [`Validity::Unknown`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralSolver;

impl Solver for StructuralSolver {
    fn evaluate(&self, constraints: &ConstraintManager, expr: &ExprRef) -> Validity {
        let simplified = constraints.simplify(expr);
        match simplified.as_const() {
            Some(0) => Validity::False,
            Some(_) => Validity::True,
            None => {
                // a == b with structurally equal sides holds regardless of
                // the valuation
                if let Expr::Eq(a, b) = &*simplified {
                    if a == b {
                        return Validity::True;
                    }
                }
                Validity::Unknown
            }
        }
    }
}
