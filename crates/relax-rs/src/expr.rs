//! Symbolic integer expressions and dependent values.
//!
//! Expressions are trees over integer constants, symbol references, layout
//! locations, and substitution placeholders.  The optimizer decomposes the
//! absolute portion of a [`Value`] into location-distance terms with
//! [`Expr::subst_dist`], re-evaluates it cheaply with [`Expr::substitute`] +
//! [`Expr::simplify`], and falls back to the long-form sentinel whenever the
//! result does not fold to a plain integer.

use alloc::boxed::Box;
#[allow(unused_imports)]
use alloc::vec;

use crate::bytecode::Location;
use crate::object::{Object, Symbol, SymbolDef, SymbolId};

/// EQU definitions may reference other EQUs; resolution stops after this
/// many levels and leaves the reference symbolic.
const MAX_EQU_DEPTH: u8 = 16;

/// An expression node for layout arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A numeric literal.
    Int(i64),
    /// A symbol reference (unresolved until [`Object::finalize`]).
    Sym(SymbolId),
    /// A resolved layout location.
    Loc(Location),
    /// A substitution placeholder left by [`Expr::subst_dist`].
    Subst(usize),
    /// Negation.
    Neg(Box<Expr>),
    /// Addition: left + right.
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction: left - right.
    Sub(Box<Expr>, Box<Expr>),
    /// Multiplication: left * right.
    Mul(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Try to fold to a constant integer.
    ///
    /// Returns `None` if the expression still contains symbols, locations,
    /// or placeholders, or if folding overflows.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Sym(_) | Expr::Loc(_) | Expr::Subst(_) => None,
            Expr::Neg(a) => a.as_int()?.checked_neg(),
            Expr::Add(a, b) => a.as_int()?.checked_add(b.as_int()?),
            Expr::Sub(a, b) => a.as_int()?.checked_sub(b.as_int()?),
            Expr::Mul(a, b) => a.as_int()?.checked_mul(b.as_int()?),
        }
    }

    /// Constant-fold in place.  Sub-trees that fold to an integer are
    /// replaced by [`Expr::Int`]; anything symbolic is left untouched.
    pub fn simplify(&mut self) {
        match self {
            Expr::Int(_) | Expr::Sym(_) | Expr::Loc(_) | Expr::Subst(_) => {}
            Expr::Neg(a) => {
                a.simplify();
                if let Some(v) = self.as_int() {
                    *self = Expr::Int(v);
                }
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.simplify();
                b.simplify();
                if let Some(v) = self.as_int() {
                    *self = Expr::Int(v);
                }
            }
        }
    }

    /// Replace every `Subst(i)` placeholder with `slots[i]`.
    pub fn substitute(&mut self, slots: &[i64]) {
        match self {
            Expr::Subst(i) => {
                if let Some(v) = slots.get(*i) {
                    *self = Expr::Int(*v);
                }
            }
            Expr::Int(_) | Expr::Sym(_) | Expr::Loc(_) => {}
            Expr::Neg(a) => a.substitute(slots),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.substitute(slots);
                b.substitute(slots);
            }
        }
    }

    /// Replace every `loc2 - loc1` sub-expression whose locations lie in the
    /// same section with a fresh placeholder slot, calling
    /// `f(slot, loc1, loc2)` exactly once per replacement.
    ///
    /// Cross-section pairs are left in place; they can never fold to an
    /// integer, which forces the long-form sentinel downstream.
    pub fn subst_dist<F>(&mut self, next_slot: &mut usize, f: &mut F)
    where
        F: FnMut(usize, Location, Location),
    {
        if let Expr::Sub(a, b) = self {
            if let (Expr::Loc(l2), Expr::Loc(l1)) = (&**a, &**b) {
                if l1.bc.sect == l2.bc.sect {
                    let (l1, l2) = (*l1, *l2);
                    let slot = *next_slot;
                    *next_slot += 1;
                    *self = Expr::Subst(slot);
                    f(slot, l1, l2);
                    return;
                }
            }
        }
        match self {
            Expr::Int(_) | Expr::Sym(_) | Expr::Loc(_) | Expr::Subst(_) => {}
            Expr::Neg(a) => a.subst_dist(next_slot, f),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.subst_dist(next_slot, f);
                b.subst_dist(next_slot, f);
            }
        }
    }

    /// Evaluate against a finished layout: locations become their section
    /// offsets.  `None` for unresolved symbols or placeholders.
    #[must_use]
    pub fn eval(&self, obj: &Object) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Sym(_) | Expr::Subst(_) => None,
            Expr::Loc(loc) => Some(obj.loc_offset(*loc) as i64),
            Expr::Neg(a) => a.eval(obj)?.checked_neg(),
            Expr::Add(a, b) => a.eval(obj)?.checked_add(b.eval(obj)?),
            Expr::Sub(a, b) => a.eval(obj)?.checked_sub(b.eval(obj)?),
            Expr::Mul(a, b) => a.eval(obj)?.checked_mul(b.eval(obj)?),
        }
    }

    pub(crate) fn resolve(&mut self, symbols: &[Symbol], depth: u8) {
        match self {
            Expr::Sym(id) => match symbols[id.index()].def() {
                SymbolDef::Label(loc) => *self = Expr::Loc(*loc),
                SymbolDef::Equ(expr) if depth < MAX_EQU_DEPTH => {
                    let mut inner = expr.clone();
                    inner.resolve(symbols, depth + 1);
                    *self = inner;
                }
                _ => {}
            },
            Expr::Int(_) | Expr::Loc(_) | Expr::Subst(_) => {}
            Expr::Neg(a) => a.resolve(symbols, depth),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.resolve(symbols, depth);
                b.resolve(symbols, depth);
            }
        }
    }
}

/// Signed byte distance `loc2 - loc1`, or `None` when the locations lie in
/// different sections (the distance is then not a layout-time constant).
#[must_use]
pub fn calc_dist(obj: &Object, loc1: Location, loc2: Location) -> Option<i64> {
    if loc1.bc.sect != loc2.bc.sect {
        return None;
    }
    Some(obj.loc_offset(loc2) as i64 - obj.loc_offset(loc1) as i64)
}

/// A value a bytecode's length may depend on: an optional absolute
/// expression plus an optional section-relative symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    abs: Option<Expr>,
    rel: Option<SymbolId>,
    size: u8,
}

impl Value {
    /// A purely absolute value.
    #[must_use]
    pub fn from_expr(abs: Expr, size: u8) -> Self {
        Self {
            abs: Some(abs),
            rel: None,
            size,
        }
    }

    /// Shorthand for a bare symbol reference.
    #[must_use]
    pub fn from_sym(sym: SymbolId, size: u8) -> Self {
        Self::from_expr(Expr::Sym(sym), size)
    }

    /// A value relative to a symbol in another section or object.
    #[must_use]
    pub fn relative(rel: SymbolId, size: u8) -> Self {
        Self {
            abs: None,
            rel: Some(rel),
            size,
        }
    }

    /// True if the value carries an absolute portion.
    #[must_use]
    pub fn has_abs(&self) -> bool {
        self.abs.is_some()
    }

    /// The absolute portion, if any.
    #[must_use]
    pub fn abs(&self) -> Option<&Expr> {
        self.abs.as_ref()
    }

    /// True if the value is relative to a symbol (cross-section/external).
    #[must_use]
    pub fn is_relative(&self) -> bool {
        self.rel.is_some()
    }

    /// The relative symbol, if any.
    #[must_use]
    pub fn rel(&self) -> Option<SymbolId> {
        self.rel
    }

    /// Value size in bits (as the emitter will encode it).
    #[must_use]
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Evaluate against a finished layout.  `None` when the value is
    /// relative or does not fold to an integer.
    #[must_use]
    pub fn eval(&self, obj: &Object) -> Option<i64> {
        if self.rel.is_some() {
            return None;
        }
        match &self.abs {
            Some(expr) => expr.eval(obj),
            None => Some(0),
        }
    }

    pub(crate) fn resolve(&mut self, symbols: &[Symbol]) {
        if let Some(abs) = &mut self.abs {
            abs.resolve(symbols, 0);
            abs.simplify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BcId;

    fn loc(sect: u32, idx: u32) -> Location {
        Location {
            bc: BcId { sect, idx },
            off: 0,
        }
    }

    #[test]
    fn fold_constants() {
        let mut e = Expr::Add(
            Box::new(Expr::Int(4)),
            Box::new(Expr::Mul(Box::new(Expr::Int(3)), Box::new(Expr::Int(5)))),
        );
        e.simplify();
        assert_eq!(e, Expr::Int(19));
        assert_eq!(e.as_int(), Some(19));
    }

    #[test]
    fn fold_leaves_symbols() {
        let mut e = Expr::Add(
            Box::new(Expr::Sym(SymbolId::new(0))),
            Box::new(Expr::Sub(Box::new(Expr::Int(8)), Box::new(Expr::Int(3)))),
        );
        e.simplify();
        match e {
            Expr::Add(_, rhs) => assert_eq!(*rhs, Expr::Int(5)),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn fold_overflow_stays_symbolic() {
        let e = Expr::Add(Box::new(Expr::Int(i64::MAX)), Box::new(Expr::Int(1)));
        assert_eq!(e.as_int(), None);
    }

    #[test]
    fn subst_dist_replaces_same_section_pairs() {
        // (l2 - l1) + ((l4 - l3) * 2)
        let mut e = Expr::Add(
            Box::new(Expr::Sub(
                Box::new(Expr::Loc(loc(0, 2))),
                Box::new(Expr::Loc(loc(0, 1))),
            )),
            Box::new(Expr::Mul(
                Box::new(Expr::Sub(
                    Box::new(Expr::Loc(loc(0, 4))),
                    Box::new(Expr::Loc(loc(0, 3))),
                )),
                Box::new(Expr::Int(2)),
            )),
        );
        let mut slot = 0;
        let mut seen = vec![];
        e.subst_dist(&mut slot, &mut |s, l1, l2| seen.push((s, l1, l2)));
        assert_eq!(slot, 2);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, loc(0, 1), loc(0, 2)));
        assert_eq!(seen[1], (1, loc(0, 3), loc(0, 4)));

        // Substituting distances folds the whole thing.
        e.substitute(&[10, 7]);
        e.simplify();
        assert_eq!(e.as_int(), Some(24));
    }

    #[test]
    fn subst_dist_skips_cross_section_pairs() {
        let mut e = Expr::Sub(
            Box::new(Expr::Loc(loc(1, 0))),
            Box::new(Expr::Loc(loc(0, 0))),
        );
        let mut slot = 0;
        e.subst_dist(&mut slot, &mut |_, _, _| {});
        assert_eq!(slot, 0);
        assert_eq!(e.as_int(), None);
    }

    #[test]
    fn relative_value_never_evaluates() {
        let v = Value::relative(SymbolId::new(3), 32);
        assert!(v.is_relative());
        assert!(!v.has_abs());
        let obj = Object::new();
        assert_eq!(v.eval(&obj), None);
    }
}
