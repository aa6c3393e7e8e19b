// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! The symbolic expression term algebra.
//!
//! Expressions are immutable, reference counted trees over byte reads of
//! named arrays. The surface is deliberately small: the distributed layer
//! only ever builds byte reads, endian-aware concatenations and boolean
//! combinations thereof, and rewrites arrays inside existing trees (see
//! [`visit`]).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::OnceCell;

pub mod visit;


/// Width of an expression in bits. Booleans are width 1.
pub type Width = u32;

pub const BOOL_WIDTH: Width = 1;
pub const BYTE_WIDTH: Width = 8;

/// A named symbolic byte array. Identity (not the name) is what makes two
/// arrays the same symbol; see [`ArrayRef`].
#[derive(Debug)]
pub struct Array {
    pub name: String,
    pub size: usize,
}

impl Array {
    pub fn new(name: impl Into<String>, size: usize) -> ArrayRef {
        ArrayRef(Arc::new(Array {
            name: name.into(),
            size,
        }))
    }
}

/// Shared handle to an [`Array`]. Equality and hashing are by object
/// identity: two arrays with equal names are still distinct symbols.
#[derive(Debug, Clone)]
pub struct ArrayRef(Arc<Array>);

impl ArrayRef {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Stable identity token, usable as a map key.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for ArrayRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ArrayRef {}

impl Hash for ArrayRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.id());
    }
}

impl std::ops::Deref for ArrayRef {
    type Target = Array;
    fn deref(&self) -> &Array {
        &self.0
    }
}

impl fmt::Display for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// One node of an expression tree.
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    /// A constant of the given bit width. Booleans are `width == 1` with
    /// value 0 or 1.
    Constant { value: u64, width: Width },
    /// An 8-bit read of `array` at `index`.
    Read { array: ArrayRef, index: ExprRef },
    /// Bit concatenation; `msb` ends up in the high-order bits.
    Concat { msb: ExprRef, lsb: ExprRef },
    Eq(ExprRef, ExprRef),
    And(ExprRef, ExprRef),
    Or(ExprRef, ExprRef),
    Not(ExprRef),
}

/// Shared handle to an [`Expr`]. Structural equality; use [`ExprRef::id`]
/// where object identity is the intended notion (e.g. packet-trie atoms).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExprRef(Arc<Expr>);

impl ExprRef {
    pub fn new(e: Expr) -> Self {
        ExprRef(Arc::new(e))
    }

    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn width(&self) -> Width {
        match &*self.0 {
            Expr::Constant { width, .. } => *width,
            Expr::Read { .. } => BYTE_WIDTH,
            Expr::Concat { msb, lsb } => msb.width() + lsb.width(),
            Expr::Eq(..) | Expr::And(..) | Expr::Or(..) | Expr::Not(..) => BOOL_WIDTH,
        }
    }

    /// The constant value of this expression, if it folds to one that fits
    /// 64 bits.
    pub fn as_const(&self) -> Option<u64> {
        match &*self.0 {
            Expr::Constant { value, .. } => Some(*value),
            Expr::Read { .. } => None,
            Expr::Concat { msb, lsb } => {
                let l = lsb.as_const()?;
                let m = msb.as_const()?;
                let shift = lsb.width();
                if shift >= 64 {
                    return None;
                }
                m.checked_shl(shift).map(|m| m | l)
            }
            Expr::Eq(a, b) => Some((a.as_const()? == b.as_const()?) as u64),
            Expr::And(a, b) => Some(((a.as_const()? != 0) && (b.as_const()? != 0)) as u64),
            Expr::Or(a, b) => Some(((a.as_const()? != 0) || (b.as_const()? != 0)) as u64),
            Expr::Not(a) => Some((a.as_const()? == 0) as u64),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(&*self.0, Expr::Constant { .. })
    }
}

impl std::ops::Deref for ExprRef {
    type Target = Expr;
    fn deref(&self) -> &Expr {
        &self.0
    }
}

pub fn constant(value: u64, width: Width) -> ExprRef {
    ExprRef::new(Expr::Constant { value, width })
}

pub fn zero_bits(width: Width) -> ExprRef {
    constant(0, width)
}

pub fn one_bits(width: Width) -> ExprRef {
    let value = if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    constant(value, width)
}

pub fn make_true() -> ExprRef {
    one_bits(BOOL_WIDTH)
}

pub fn make_false() -> ExprRef {
    zero_bits(BOOL_WIDTH)
}

/// An 8-bit read of `array[offset]`.
pub fn read8(array: &ArrayRef, offset: usize) -> ExprRef {
    ExprRef::new(Expr::Read {
        array: array.clone(),
        index: constant(offset as u64, 32),
    })
}

pub fn eq(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    ExprRef::new(Expr::Eq(lhs, rhs))
}

pub fn and(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    ExprRef::new(Expr::And(lhs, rhs))
}

pub fn or(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    ExprRef::new(Expr::Or(lhs, rhs))
}

pub fn not(e: ExprRef) -> ExprRef {
    ExprRef::new(Expr::Not(e))
}

/// Coerce an arbitrary-width expression to a boolean asserting it is
/// non-zero. Not-equal directly would be the obvious choice, but equality
/// against zero under a negation folds better.
pub fn assert_true(e: ExprRef) -> ExprRef {
    let width = e.width();
    not(eq(zero_bits(width), e))
}

/// Boolean asserting the expression is zero.
pub fn assert_false(e: ExprRef) -> ExprRef {
    let width = e.width();
    eq(zero_bits(width), e)
}

pub fn ne(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    not(eq(lhs, rhs))
}

pub fn concat(msb: ExprRef, lsb: ExprRef) -> ExprRef {
    ExprRef::new(Expr::Concat { msb, lsb })
}

/// Left fold with a mapping step, seeded with `start`. The shape shared by
/// [`conjunction`], [`disjunction`] and the multi-byte concatenations.
pub fn foldl_map<T>(
    bin_op: impl Fn(ExprRef, ExprRef) -> ExprRef,
    start: ExprRef,
    un_op: impl Fn(T) -> ExprRef,
    items: impl IntoIterator<Item = T>,
) -> ExprRef {
    items
        .into_iter()
        .fold(start, |acc, it| bin_op(acc, un_op(it)))
}

pub fn conjunction(items: impl IntoIterator<Item = ExprRef>) -> ExprRef {
    foldl_map(and, make_true(), assert_true, items)
}

pub fn disjunction(items: impl IntoIterator<Item = ExprRef>) -> ExprRef {
    foldl_map(or, make_false(), assert_true, items)
}

/// Concatenate a sequence of byte expressions into one word, newest byte at
/// the high-order end. Empty sequences are a caller bug.
pub fn concat_bytes(bytes: impl IntoIterator<Item = ExprRef>) -> ExprRef {
    let mut it = bytes.into_iter();
    let first = it
        .next()
        .expect("cannot concatenate an empty byte sequence");
    it.fold(first, |acc, b| concat(b, acc))
}

/// A read of the whole array, bytes visited in the order dictated by the
/// process-wide [`Context`] endianness and accumulated with the newest byte
/// at the high-order end.
pub fn complete_read(array: &ArrayRef) -> ExprRef {
    let mut order = Context::get().byte_order(array.size());
    let first = order
        .next()
        .expect("cannot build a read expression of a zero length array");
    let mut cat = read8(array, first);
    for i in order {
        cat = concat(read8(array, i), cat);
    }
    cat
}

/// Equality over the complete contents of two arrays of equal size.
pub fn array_equality(lhs: &ArrayRef, rhs: &ArrayRef) -> ExprRef {
    eq(complete_read(lhs), complete_read(rhs))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endianness {
    Little,
    Big,
}

/// Process-wide target description. Mirrors the engine's notion of the
/// guest's byte order; initialised once at startup, read everywhere.
#[derive(Debug)]
pub struct Context {
    endianness: Endianness,
}

static CONTEXT: OnceCell<Context> = OnceCell::new();

impl Context {
    /// Install the context. Later calls are ignored; the first one wins.
    pub fn initialize(endianness: Endianness) {
        let _ = CONTEXT.set(Context { endianness });
    }

    /// The installed context, defaulting to little endian when nobody
    /// initialised one (tests mostly).
    pub fn get() -> &'static Context {
        CONTEXT.get_or_init(|| Context {
            endianness: Endianness::Little,
        })
    }

    pub fn is_little_endian(&self) -> bool {
        self.endianness == Endianness::Little
    }

    /// Byte indices of an object of `size` bytes, least significant first.
    pub fn byte_order(&self, size: usize) -> Box<dyn Iterator<Item = usize>> {
        if self.is_little_endian() {
            Box::new(0..size)
        } else {
            Box::new((0..size).rev())
        }
    }
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &**self {
            Expr::Constant { value, width } => write!(f, "{value}:w{width}"),
            Expr::Read { array, index } => write!(f, "{}[{}]", array, index),
            Expr::Concat { msb, lsb } => write!(f, "({msb} . {lsb})"),
            Expr::Eq(a, b) => write!(f, "({a} == {b})"),
            Expr::And(a, b) => write!(f, "({a} && {b})"),
            Expr::Or(a, b) => write!(f, "({a} || {b})"),
            Expr::Not(a) => write!(f, "!{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_folding() {
        assert_eq!(constant(3, 8).as_const(), Some(3));
        assert_eq!(eq(constant(3, 8), constant(3, 8)).as_const(), Some(1));
        assert_eq!(eq(constant(3, 8), constant(4, 8)).as_const(), Some(0));
        assert_eq!(
            and(make_true(), not(make_false())).as_const(),
            Some(1)
        );
        // 0x01 in the low byte, 0x02 above it
        let c = concat(constant(2, 8), constant(1, 8));
        assert_eq!(c.as_const(), Some(0x0201));
        assert_eq!(c.width(), 16);
    }

    #[test]
    fn reads_are_not_constant() {
        let a = Array::new("a", 4);
        assert_eq!(read8(&a, 0).as_const(), None);
        assert_eq!(complete_read(&a).width(), 32);
    }

    #[test]
    fn array_identity_not_name() {
        let a = Array::new("x", 1);
        let b = Array::new("x", 1);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn assert_wrappers() {
        assert_eq!(assert_true(constant(7, 8)).as_const(), Some(1));
        assert_eq!(assert_true(constant(0, 8)).as_const(), Some(0));
        assert_eq!(assert_false(constant(0, 8)).as_const(), Some(1));
    }

    #[test]
    fn conjunction_disjunction() {
        assert_eq!(conjunction(vec![make_true(), make_true()]).as_const(), Some(1));
        assert_eq!(conjunction(vec![make_true(), make_false()]).as_const(), Some(0));
        assert_eq!(disjunction(vec![make_false(), make_true()]).as_const(), Some(1));
        assert_eq!(disjunction(Vec::new()).as_const(), Some(0));
    }

    /// Bytes concatenate with the newest byte at the high-order end, so a
    /// constant byte sequence folds to its little-endian composition.
    #[quickcheck_macros::quickcheck]
    fn concat_of_constant_bytes_folds(bytes: Vec<u8>) -> quickcheck::TestResult {
        if bytes.is_empty() || bytes.len() > 8 {
            return quickcheck::TestResult::discard();
        }
        let cat = concat_bytes(bytes.iter().map(|b| constant(*b as u64, 8)));
        let expect = bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        quickcheck::TestResult::from_bool(
            cat.as_const() == Some(expect) && cat.width() as usize == 8 * bytes.len(),
        )
    }
}
