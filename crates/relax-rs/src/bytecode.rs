//! The editable layout unit: bytecodes and their contents.
//!
//! A bytecode is an immutable fixed byte prefix plus a variable-length tail
//! owned by its [`Contents`].  During relaxation the tail of a plain
//! bytecode only ever *grows* (short branch form to long form, replication
//! count upward), which is what guarantees the fixpoint terminates.
//! Offset-setting contents (alignment, origin) are the exception: their tail
//! is a function of their own offset and may shrink while absorbing growth
//! from earlier bytecodes.

use alloc::boxed::Box;
#[allow(unused_imports)]
use alloc::format;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Diagnostics, LayoutError};
use crate::expr::{Expr, Value};
use crate::object::{Object, SymbolId};

/// Stable handle of a bytecode within an [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BcId {
    /// Index of the containing section.
    pub sect: u32,
    /// Index of the bytecode within the section.
    pub idx: u32,
}

/// A point in the layout, anchored just past the end of a bytecode.
///
/// The denoted address is `bc.offset + bc.total_len + off`.  Anchoring to
/// the *end* of the preceding bytecode is what keeps incremental distance
/// updates exact: the distance `loc2 - loc1` changes if and only if a
/// bytecode with index in `(loc1.bc.index, loc2.bc.index]` changes length.
/// A label at the very start of a section anchors to the section's empty
/// head bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    /// The bytecode this location is anchored to.
    pub bc: BcId,
    /// Additional byte offset past the end of `bc`.
    pub off: u64,
}

/// Layout classification of a bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BcKind {
    /// Ordinary contents; the tail never shrinks.
    Plain,
    /// Alignment/origin: places the next bytecode at a computed offset and
    /// can absorb preceding growth.
    OffsetSetting,
}

/// One encoding form of a relaxable jump: opcode bytes plus the width of the
/// trailing displacement field.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JumpForm {
    /// Opcode bytes emitted before the displacement.
    pub opcode: Vec<u8>,
    /// Displacement width in bytes (1, 2, 4, or 8).
    pub disp_len: u8,
}

impl JumpForm {
    /// Create a form from opcode bytes and a displacement width.
    #[must_use]
    pub fn new(opcode: Vec<u8>, disp_len: u8) -> Self {
        Self { opcode, disp_len }
    }

    /// Encoded length of this form in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.opcode.len() as u64 + u64::from(self.disp_len)
    }

    /// True if the form encodes to zero bytes (never for real forms).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn disp_range(&self) -> (i64, i64) {
        if self.disp_len >= 8 {
            return (i64::MIN, i64::MAX);
        }
        let pos = (1i64 << (8 * i64::from(self.disp_len) - 1)) - 1;
        (-pos - 1, pos)
    }
}

/// Outcome of an expansion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expansion {
    /// The bytecode reached a form that no longer depends on the span.
    Done,
    /// Still dependent; retain the current length while the span value stays
    /// inside `[neg_thres, pos_thres]`.
    Dependent { neg_thres: i64, pos_thres: i64 },
}

/// Implementation-specific bytecode contents.
///
/// A closed enum rather than a trait object: every kind is known to the
/// crate, and the optimizer matches on the classification in hot paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Contents {
    /// No tail.  Used for pure data bytecodes and section head sentinels.
    Empty,
    /// A run of `size` identical fill bytes (reserved space).
    Gap {
        /// Gap length in bytes.
        size: u64,
        /// Byte value emitted for the gap.
        fill: u8,
    },
    /// A relaxable jump.  Starts in `short` form; promoted to `long` when
    /// the target displacement leaves the short form's range.  Promotion is
    /// irreversible.
    Jump {
        /// The jump target.
        target: Value,
        /// Short encoding form.
        short: JumpForm,
        /// Long encoding form.
        long: JumpForm,
        /// Whether the jump has been promoted to the long form.
        is_long: bool,
    },
    /// `body` replicated `count` times.  A count that depends on the layout
    /// is re-evaluated on any change during relaxation.
    Times {
        /// Replication count.
        count: Value,
        /// Bytes of one copy.
        body: Vec<u8>,
    },
    /// Pad to the next multiple of `alignment`.
    Align {
        /// Required alignment in bytes (power of two).
        alignment: u64,
        /// Fill byte for the padding.
        fill: u8,
        /// Skip the alignment entirely when the padding would exceed this.
        max_skip: Option<u64>,
    },
    /// Advance the location counter to the absolute offset `target`.
    Org {
        /// Target section offset.
        target: u64,
        /// Fill byte for the gap.
        fill: u8,
    },
}

/// Padding needed to align `offset` upward, honoring `max_skip`.
fn align_pad(offset: u64, alignment: u64, max_skip: Option<u64>) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    let rem = offset % alignment;
    let pad = if rem == 0 { 0 } else { alignment - rem };
    if max_skip.is_some_and(|ms| pad > ms) {
        return 0;
    }
    pad
}

/// The atomic unit of layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    /// Fixed data preceding the variable-length tail.
    pub(crate) fixed: Vec<u8>,
    pub(crate) contents: Contents,
    tail_len: u64,
    line: u32,
    offset: u64,
    index: u64,
    pub(crate) symbols_here: Vec<SymbolId>,
}

impl Bytecode {
    /// Create a bytecode of the given contents.
    #[must_use]
    pub fn new(contents: Contents, line: u32) -> Self {
        Self {
            fixed: Vec::new(),
            contents,
            tail_len: 0,
            line,
            offset: 0,
            index: 0,
            symbols_here: Vec::new(),
        }
    }

    /// Create an empty bytecode (section head sentinel, data carrier).
    #[must_use]
    pub fn empty(line: u32) -> Self {
        Self::new(Contents::Empty, line)
    }

    /// Section-relative start offset.  Valid only after optimization.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Dense per-run index.  Valid only during/after optimization.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Source line of the bytecode.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Length of the fixed prefix in bytes.
    #[must_use]
    pub fn fixed_len(&self) -> u64 {
        self.fixed.len() as u64
    }

    /// Length of the variable tail in bytes.
    #[must_use]
    pub fn tail_len(&self) -> u64 {
        self.tail_len
    }

    /// Total encoded length in bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.fixed_len() + self.tail_len
    }

    /// Offset of the next bytecode (which need not exist).
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + self.total_len()
    }

    /// The bytecode's contents.
    #[must_use]
    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    /// Symbols defined at this bytecode's end.
    #[must_use]
    pub fn symbols_here(&self) -> &[SymbolId] {
        &self.symbols_here
    }

    /// Layout classification of the contents.
    #[must_use]
    pub fn classify(&self) -> BcKind {
        match self.contents {
            Contents::Align { .. } | Contents::Org { .. } => BcKind::OffsetSetting,
            _ => BcKind::Plain,
        }
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn set_index(&mut self, index: u64) {
        self.index = index;
    }

    /// Compute the minimum tail length under the all-short assumption,
    /// registering layout dependencies through `add_span`.
    ///
    /// The bytecode's offset must already be set: alignment and origin
    /// derive their initial padding from it.
    pub(crate) fn calc_len(
        &mut self,
        id: BcId,
        diag: &mut Diagnostics,
        add_span: &mut dyn FnMut(i32, &Value, i64, i64),
    ) -> Result<(), LayoutError> {
        match &self.contents {
            Contents::Empty => {
                self.tail_len = 0;
            }
            Contents::Gap { size, .. } => {
                self.tail_len = *size;
            }
            Contents::Jump {
                target,
                short,
                long,
                is_long,
            } => {
                if *is_long {
                    // Already promoted (re-run on optimized output); no
                    // further dependence to register.
                    self.tail_len = long.len();
                    return Ok(());
                }
                self.tail_len = short.len();
                // The dependent value is the displacement: target minus the
                // point just past this jump.
                let end = Location { bc: id, off: 0 };
                let depval = if let Some(rel) = target.rel() {
                    Value::relative(rel, target.size())
                } else {
                    let abs = match target.abs() {
                        Some(expr) => {
                            Expr::Sub(Box::new(expr.clone()), Box::new(Expr::Loc(end)))
                        }
                        None => Expr::Neg(Box::new(Expr::Loc(end))),
                    };
                    Value::from_expr(abs, target.size())
                };
                let (neg, pos) = short.disp_range();
                add_span(1, &depval, neg, pos);
            }
            Contents::Times { count, body } => {
                if body.is_empty() {
                    return Err(LayoutError::Contents {
                        detail: "replication body is empty".into(),
                    });
                }
                let folded = if count.is_relative() {
                    None
                } else {
                    count.abs().and_then(Expr::as_int)
                };
                match folded {
                    Some(n) if n < 0 => {
                        return Err(LayoutError::Contents {
                            detail: format!("replication count is negative ({})", n),
                        });
                    }
                    Some(n) => {
                        self.tail_len = n as u64 * body.len() as u64;
                    }
                    None => {
                        // Layout-dependent count: assume zero copies for the
                        // minimum layout, re-evaluate on any change.
                        self.tail_len = 0;
                        add_span(0, count, 0, 0);
                    }
                }
            }
            Contents::Align {
                alignment,
                max_skip,
                ..
            } => {
                let pad = align_pad(self.offset, *alignment, *max_skip);
                if pad == 0 && self.offset % *alignment != 0 {
                    diag.warning(
                        self.line,
                        format!(
                            "required padding exceeds maximum skip of {} bytes; alignment ignored",
                            max_skip.unwrap_or(0)
                        ),
                    );
                }
                self.tail_len = pad;
            }
            Contents::Org { target, .. } => {
                if *target < self.offset {
                    return Err(LayoutError::OffsetRegression {
                        current: self.offset,
                        wanted: *target as i64,
                    });
                }
                self.tail_len = target - self.offset;
            }
        }
        Ok(())
    }

    /// Grow the tail to accommodate a new span value.
    ///
    /// For offset-setting contents, `span_id` is 1 and the values are the
    /// bytecode's current/new offsets (absorption protocol).  Contents that
    /// never registered a span reject the call.
    pub(crate) fn expand(
        &mut self,
        span_id: i32,
        cur_val: i64,
        new_val: i64,
    ) -> Result<Expansion, LayoutError> {
        let _ = (span_id, cur_val);
        match &mut self.contents {
            Contents::Empty | Contents::Gap { .. } => Err(LayoutError::Contents {
                detail: "internal: expansion requested for a fixed-length bytecode".into(),
            }),
            Contents::Jump { long, is_long, .. } => {
                *is_long = true;
                self.tail_len = long.len();
                Ok(Expansion::Done)
            }
            Contents::Times { body, .. } => {
                if new_val == i64::MAX {
                    return Err(LayoutError::Contents {
                        detail: "replication count is not a layout-time constant".into(),
                    });
                }
                if new_val < 0 {
                    return Err(LayoutError::Contents {
                        detail: format!("replication count is negative ({})", new_val),
                    });
                }
                let new_len = new_val as u64 * body.len() as u64;
                if new_len < self.tail_len {
                    return Err(LayoutError::Contents {
                        detail: "replication count shrank during relaxation".into(),
                    });
                }
                self.tail_len = new_len;
                Ok(Expansion::Dependent {
                    neg_thres: new_val,
                    pos_thres: new_val,
                })
            }
            Contents::Align {
                alignment,
                max_skip,
                ..
            } => {
                let offset = new_val as u64;
                let pad = align_pad(offset, *alignment, *max_skip);
                self.tail_len = pad;
                Ok(Expansion::Dependent {
                    neg_thres: 0,
                    pos_thres: (offset + pad) as i64,
                })
            }
            Contents::Org { target, .. } => {
                let offset = new_val as u64;
                if new_val < 0 || offset > *target {
                    return Err(LayoutError::OffsetRegression {
                        current: offset,
                        wanted: *target as i64,
                    });
                }
                self.tail_len = *target - offset;
                Ok(Expansion::Dependent {
                    neg_thres: 0,
                    pos_thres: *target as i64,
                })
            }
        }
    }

    /// Re-derive the tail of an offset-setting bytecode from its (already
    /// assigned) offset.  No-op for plain contents.
    pub(crate) fn refresh_offset_tail(&mut self) -> Result<(), LayoutError> {
        match &self.contents {
            Contents::Align {
                alignment,
                max_skip,
                ..
            } => {
                self.tail_len = align_pad(self.offset, *alignment, *max_skip);
                Ok(())
            }
            Contents::Org { target, .. } => {
                if *target < self.offset {
                    return Err(LayoutError::OffsetRegression {
                        current: self.offset,
                        wanted: *target as i64,
                    });
                }
                self.tail_len = target - self.offset;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Render the tail into `out`.  The fixed prefix is the caller's job.
    pub(crate) fn emit_tail(
        &self,
        obj: &Object,
        id: BcId,
        out: &mut Vec<u8>,
    ) -> Result<(), LayoutError> {
        match &self.contents {
            Contents::Empty => Ok(()),
            Contents::Gap { size, fill } => {
                out.extend(core::iter::repeat(*fill).take(*size as usize));
                Ok(())
            }
            Contents::Jump {
                target,
                short,
                long,
                is_long,
            } => {
                let form = if *is_long { long } else { short };
                out.extend_from_slice(&form.opcode);
                // Displacement relative to the end of the jump, folded from
                // same-section distances.  A target that does not fold
                // (external/cross-section) gets a zero placeholder;
                // patching it is the object writer's job.
                let disp = if target.rel().is_some() {
                    None
                } else {
                    let end = Location { bc: id, off: 0 };
                    let mut expr = match target.abs() {
                        Some(abs) => {
                            Expr::Sub(Box::new(abs.clone()), Box::new(Expr::Loc(end)))
                        }
                        None => Expr::Neg(Box::new(Expr::Loc(end))),
                    };
                    let mut slot = 0usize;
                    let mut dists = Vec::new();
                    expr.subst_dist(&mut slot, &mut |_, l1, l2| {
                        dists.push(obj.loc_offset(l2) as i64 - obj.loc_offset(l1) as i64);
                    });
                    expr.substitute(&dists);
                    expr.simplify();
                    expr.as_int()
                };
                match disp {
                    Some(disp) => {
                        let (neg, pos) = form.disp_range();
                        if disp < neg || disp > pos {
                            return Err(LayoutError::Contents {
                                detail: format!(
                                    "branch displacement {} does not fit in {} bytes",
                                    disp, form.disp_len
                                ),
                            });
                        }
                        let bytes = disp.to_le_bytes();
                        out.extend_from_slice(&bytes[..form.disp_len as usize]);
                    }
                    None => {
                        out.extend(core::iter::repeat(0).take(form.disp_len as usize));
                    }
                }
                Ok(())
            }
            Contents::Times { body, .. } => {
                if body.is_empty() {
                    return Ok(());
                }
                let copies = self.tail_len / body.len() as u64;
                for _ in 0..copies {
                    out.extend_from_slice(body);
                }
                Ok(())
            }
            Contents::Align { fill, .. } | Contents::Org { fill, .. } => {
                out.extend(core::iter::repeat(*fill).take(self.tail_len as usize));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bc_id() -> BcId {
        BcId { sect: 0, idx: 1 }
    }

    #[test]
    fn align_pad_basics() {
        assert_eq!(align_pad(0, 16, None), 0);
        assert_eq!(align_pad(1, 16, None), 15);
        assert_eq!(align_pad(16, 16, None), 0);
        assert_eq!(align_pad(17, 4, None), 3);
        assert_eq!(align_pad(1, 1, None), 0);
    }

    #[test]
    fn align_pad_max_skip() {
        assert_eq!(align_pad(1, 16, Some(15)), 15);
        assert_eq!(align_pad(1, 16, Some(14)), 0);
    }

    #[test]
    fn gap_initial_length() {
        let mut diag = Diagnostics::new();
        let mut bc = Bytecode::new(Contents::Gap { size: 42, fill: 0 }, 1);
        bc.calc_len(bc_id(), &mut diag, &mut |_, _, _, _| {}).unwrap();
        assert_eq!(bc.total_len(), 42);
        assert_eq!(bc.classify(), BcKind::Plain);
    }

    #[test]
    fn jump_registers_span_with_short_thresholds() {
        let mut diag = Diagnostics::new();
        let target = Value::from_expr(
            Expr::Loc(Location {
                bc: BcId { sect: 0, idx: 3 },
                off: 0,
            }),
            8,
        );
        let mut bc = Bytecode::new(
            Contents::Jump {
                target,
                short: JumpForm::new(vec![0xEB], 1),
                long: JumpForm::new(vec![0xE9], 4),
                is_long: false,
            },
            1,
        );
        let mut spans = vec![];
        bc.calc_len(bc_id(), &mut diag, &mut |id, _, neg, pos| {
            spans.push((id, neg, pos));
        })
        .unwrap();
        assert_eq!(bc.total_len(), 2);
        assert_eq!(spans, vec![(1, -128, 127)]);
    }

    #[test]
    fn jump_expand_promotes_to_long_once() {
        let target = Value::from_expr(Expr::Int(0), 8);
        let mut bc = Bytecode::new(
            Contents::Jump {
                target,
                short: JumpForm::new(vec![0xEB], 1),
                long: JumpForm::new(vec![0xE9], 4),
                is_long: false,
            },
            1,
        );
        let result = bc.expand(1, 0, 300).unwrap();
        assert_eq!(result, Expansion::Done);
        assert_eq!(bc.tail_len(), 5);
    }

    #[test]
    fn constant_times_folds_without_a_span() {
        let mut diag = Diagnostics::new();
        let mut bc = Bytecode::new(
            Contents::Times {
                count: Value::from_expr(Expr::Int(3), 64),
                body: vec![0xAA, 0xBB],
            },
            1,
        );
        let mut n_spans = 0;
        bc.calc_len(bc_id(), &mut diag, &mut |_, _, _, _| n_spans += 1)
            .unwrap();
        assert_eq!(n_spans, 0);
        assert_eq!(bc.total_len(), 6);
    }

    #[test]
    fn negative_times_count_is_an_error() {
        let mut diag = Diagnostics::new();
        let mut bc = Bytecode::new(
            Contents::Times {
                count: Value::from_expr(Expr::Int(-2), 64),
                body: vec![0],
            },
            1,
        );
        let err = bc
            .calc_len(bc_id(), &mut diag, &mut |_, _, _, _| {})
            .unwrap_err();
        assert!(matches!(err, LayoutError::Contents { .. }));
    }

    #[test]
    fn org_behind_current_position_is_a_regression() {
        let mut diag = Diagnostics::new();
        let mut bc = Bytecode::new(Contents::Org { target: 8, fill: 0 }, 4);
        bc.set_offset(16);
        let err = bc
            .calc_len(bc_id(), &mut diag, &mut |_, _, _, _| {})
            .unwrap_err();
        assert!(matches!(err, LayoutError::OffsetRegression { .. }));
    }

    #[test]
    fn align_absorbs_growth_until_the_boundary() {
        let mut bc = Bytecode::new(
            Contents::Align {
                alignment: 16,
                fill: 0x90,
                max_skip: None,
            },
            1,
        );
        bc.set_offset(10);
        bc.refresh_offset_tail().unwrap();
        assert_eq!(bc.tail_len(), 6);

        // Growth of 3 before the align: offset 10 -> 13, padding 6 -> 3,
        // the next bytecode stays at 16.
        let exp = bc.expand(1, 10, 13).unwrap();
        assert_eq!(bc.tail_len(), 3);
        assert_eq!(
            exp,
            Expansion::Dependent {
                neg_thres: 0,
                pos_thres: 16
            }
        );
    }

    #[test]
    fn fixed_contents_reject_expansion() {
        let mut bc = Bytecode::empty(1);
        assert!(bc.expand(1, 0, 1).is_err());
    }
}
