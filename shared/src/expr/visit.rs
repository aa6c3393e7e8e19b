// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Expression walks: array substitution and read collection.

use super::{Expr, ExprRef};
use crate::error::{Error, Result};
use crate::expr::ArrayRef;

/// Rewrite every read in `expr`, replacing the array through `map` while
/// preserving the read's index. Fails with [`Error::SymbolicIndex`] when a
/// read's index does not fold to a constant; packet data with symbolic
/// offsets is unsupported.
///
/// Subtrees that contain no reads are shared, not copied.
pub fn substitute_arrays(
    expr: &ExprRef,
    map: &mut impl FnMut(&ArrayRef) -> ArrayRef,
) -> Result<ExprRef> {
    Ok(walk(expr, map)?.unwrap_or_else(|| expr.clone()))
}

// Some(new) when the subtree changed, None when it can be shared.
fn walk(
    expr: &ExprRef,
    map: &mut impl FnMut(&ArrayRef) -> ArrayRef,
) -> Result<Option<ExprRef>> {
    let rebuild2 = |a: Option<ExprRef>,
                    b: Option<ExprRef>,
                    oa: &ExprRef,
                    ob: &ExprRef,
                    mk: fn(ExprRef, ExprRef) -> Expr| {
        if a.is_none() && b.is_none() {
            None
        } else {
            Some(ExprRef::new(mk(
                a.unwrap_or_else(|| oa.clone()),
                b.unwrap_or_else(|| ob.clone()),
            )))
        }
    };
    Ok(match &**expr {
        Expr::Constant { .. } => None,
        Expr::Read { array, index } => {
            if index.as_const().is_none() {
                return Err(Error::SymbolicIndex {
                    array: array.name().to_owned(),
                });
            }
            let replacement = map(array);
            if replacement == *array {
                None
            } else {
                Some(ExprRef::new(Expr::Read {
                    array: replacement,
                    index: index.clone(),
                }))
            }
        }
        Expr::Concat { msb, lsb } => rebuild2(
            walk(msb, map)?,
            walk(lsb, map)?,
            msb,
            lsb,
            |m, l| Expr::Concat { msb: m, lsb: l },
        ),
        Expr::Eq(a, b) => rebuild2(walk(a, map)?, walk(b, map)?, a, b, Expr::Eq),
        Expr::And(a, b) => rebuild2(walk(a, map)?, walk(b, map)?, a, b, Expr::And),
        Expr::Or(a, b) => rebuild2(walk(a, map)?, walk(b, map)?, a, b, Expr::Or),
        Expr::Not(a) => walk(a, map)?.map(|a| ExprRef::new(Expr::Not(a))),
    })
}

/// Visit every array read by `expr`, outermost reads only: the index of a
/// read is not descended into, matching how constraints are attributed to
/// symbols in the dependency graph.
pub fn collect_arrays(expr: &ExprRef, sink: &mut impl FnMut(&ArrayRef)) {
    match &**expr {
        Expr::Constant { .. } => {}
        Expr::Read { array, .. } => sink(array),
        Expr::Concat { msb, lsb } => {
            collect_arrays(msb, sink);
            collect_arrays(lsb, sink);
        }
        Expr::Eq(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            collect_arrays(a, sink);
            collect_arrays(b, sink);
        }
        Expr::Not(a) => collect_arrays(a, sink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{self, Array};

    #[test]
    fn substitution_replaces_arrays_and_keeps_indices() {
        let a = Array::new("a", 2);
        let b = Array::new("b", 2);
        let e = expr::eq(expr::read8(&a, 1), expr::constant(3, 8));
        let out = substitute_arrays(&e, &mut |arr| {
            assert_eq!(*arr, a);
            b.clone()
        })
        .unwrap();
        let mut seen = Vec::new();
        collect_arrays(&out, &mut |arr| seen.push(arr.clone()));
        assert_eq!(seen, vec![b]);
        match &*out {
            Expr::Eq(lhs, _) => match &**lhs {
                Expr::Read { index, .. } => assert_eq!(index.as_const(), Some(1)),
                other => panic!("unexpected lhs {other:?}"),
            },
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn symbolic_index_is_rejected() {
        let a = Array::new("a", 2);
        let sym_index = expr::read8(&a, 0);
        let e = ExprRef::new(Expr::Read {
            array: a.clone(),
            index: sym_index,
        });
        let err = substitute_arrays(&e, &mut |arr| arr.clone()).unwrap_err();
        assert!(matches!(err, Error::SymbolicIndex { .. }));
    }

    #[test]
    fn untouched_subtrees_are_shared() {
        let a = Array::new("a", 1);
        let e = expr::and(expr::make_true(), expr::assert_true(expr::read8(&a, 0)));
        let out = substitute_arrays(&e, &mut |arr| arr.clone()).unwrap();
        assert_eq!(out.id(), e.id());
    }
}
