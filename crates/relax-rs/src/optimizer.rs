//! Fixed-point layout optimizer.
//!
//! Loosely follows Robertson's short/long address assignment algorithm
//! (E. L. Robertson, *Code Generation for Short/Long Address Machines*,
//! MRC Technical Summary Report #1779, 1977), extended with cycle
//! detection, arbitrary location-difference values, offset-setting
//! bytecodes (alignment/origin) that can absorb growth, and layout-
//! dependent replication counts.
//!
//! Outline:
//!
//! 1. Initialization:
//!    a. Number bytecodes sequentially and compute offsets assuming every
//!       length-variable bytecode takes its minimum form, collecting a span
//!       for each recorded length dependency.  Replication counts that
//!       depend on the layout are assumed zero; alignment and origin
//!       advance the offset as normal.
//!    b. Evaluate every span once.  Spans that are certainly long
//!       (cross-section, external, or already past their threshold) expand
//!       their bytecode immediately; spans whose bytecode can grow no
//!       further are dropped.
//!    c. Refresh all offsets from the expanded lengths.
//!    d. Re-evaluate surviving spans against the refreshed offsets; spans
//!       past their thresholds queue for expansion.  If the queue is empty
//!       the layout is already final.
//!    e. Insert every span term into the interval tree and check
//!       replication-count spans for dependency cycles.
//! 2. Pop spans and expand their bytecodes until both queues drain,
//!    rippling every length change through the interval tree and the chain
//!    of following offset-setters.
//! 3. Final offset refresh.
//!
//! Lengths only ever grow (offset-setters absorbing growth are the bounded
//! exception), so the total work is bounded by the sum of long-minus-short
//! widths and the loop terminates.

use alloc::collections::VecDeque;
#[allow(unused_imports)]
use alloc::format;
use alloc::string::ToString;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::bytecode::{BcId, BcKind, Expansion, Location};
use crate::error::{Diagnostics, LayoutError};
use crate::expr::{calc_dist, Expr, Value};
use crate::itree::IntervalTree;
use crate::object::Object;

/// Forces "long form, never re-evaluate" on values that stop being
/// layout-time integers.
const LONG_SENTINEL: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanState {
    Active,
    Inactive,
    OnQueue,
}

/// One location-distance placeholder inside a span's absolute expression.
#[derive(Debug)]
struct Term {
    subst: usize,
    loc: Location,
    loc2: Location,
    cur_val: i64,
    new_val: i64,
}

/// A recorded dependency of one bytecode's length on a layout value.
#[derive(Debug)]
struct Span {
    bc: BcId,
    line: u32,
    /// Positive: expand only past thresholds.  Zero or negative: re-expand
    /// on any change (replication counts).
    id: i32,
    depval: Value,
    /// Absolute expression with distance placeholders, after term creation.
    cached_abs: Option<Expr>,
    terms: Vec<Term>,
    cur_val: i64,
    new_val: i64,
    neg_thres: i64,
    pos_thres: i64,
    state: SpanState,
    /// Spans that transitively forced this one; cycle detection only.
    backtrace: Vec<usize>,
    /// First offset-setter at or after this span's bytecode.
    os_index: usize,
}

impl Span {
    /// Decompose the absolute portion of the dependent value into
    /// location-distance terms.
    fn create_terms(&mut self, obj: &Object) -> Result<(), LayoutError> {
        let Some(abs) = self.depval.abs() else {
            return Ok(());
        };
        let mut expr = abs.clone();
        let mut pairs = Vec::new();
        let mut slot = 0usize;
        expr.subst_dist(&mut slot, &mut |s, l1, l2| pairs.push((s, l1, l2)));

        let my_index = obj.bc(self.bc).index();
        for (s, l1, l2) in pairs {
            let dist = calc_dist(obj, l1, l2).ok_or_else(|| LayoutError::Contents {
                detail: "internal: could not compute bytecode distance".into(),
            })?;
            if self.id <= 0 {
                // A replication count whose distance straddles its own
                // bytecode re-grows itself on every expansion.
                let i1 = obj.bc(l1.bc).index();
                let i2 = obj.bc(l2.bc).index();
                let (lo, hi) = if i1 < i2 { (i1, i2) } else { (i2, i1) };
                if my_index > lo && my_index <= hi {
                    return Err(LayoutError::CircularReference);
                }
            }
            self.terms.push(Term {
                subst: s,
                loc: l1,
                loc2: l2,
                cur_val: 0,
                new_val: dist,
            });
        }
        self.cached_abs = Some(expr);
        Ok(())
    }

    /// Re-evaluate the span from its terms' tentative distances.
    ///
    /// Returns true if the bytecode must be re-expanded: for
    /// recompute-on-change spans, any difference from the committed value;
    /// for threshold spans, a value outside `[neg_thres, pos_thres]`.
    fn recalc_normal(&mut self) -> bool {
        self.new_val = 0;

        if let Some(abs) = &self.cached_abs {
            let mut expr = abs.clone();
            let mut slots = vec![0i64; self.terms.len()];
            for term in &self.terms {
                if let Some(slot) = slots.get_mut(term.subst) {
                    *slot = term.new_val;
                }
            }
            expr.substitute(&slots);
            expr.simplify();
            // Too complex to fold: force the longest form.
            self.new_val = expr.as_int().unwrap_or(LONG_SENTINEL);
        }

        if self.depval.is_relative() {
            self.new_val = LONG_SENTINEL;
        }

        if self.new_val == LONG_SENTINEL {
            self.state = SpanState::Inactive;
        }

        if self.id <= 0 {
            self.new_val != self.cur_val
        } else {
            self.new_val < self.neg_thres || self.new_val > self.pos_thres
        }
    }
}

/// An alignment/origin bytecode in section order, with its absorption state.
#[derive(Debug)]
struct OffsetSetter {
    bc: Option<BcId>,
    cur_val: u64,
    new_val: u64,
    /// Offset at which absorption saturates.
    thres: u64,
}

impl OffsetSetter {
    fn placeholder() -> Self {
        Self {
            bc: None,
            cur_val: 0,
            new_val: 0,
            thres: 0,
        }
    }
}

struct Optimizer {
    spans: Vec<Span>,
    qa: VecDeque<usize>,
    qb: VecDeque<usize>,
    itree: IntervalTree<(usize, usize)>,
    offset_setters: Vec<OffsetSetter>,
    hits: Vec<(usize, usize)>,
}

impl Optimizer {
    fn new() -> Self {
        Self {
            spans: Vec::new(),
            qa: VecDeque::new(),
            qb: VecDeque::new(),
            itree: IntervalTree::new(),
            // Trailing placeholder for spans to bind to; filled in when an
            // offset-setter is actually encountered.
            offset_setters: vec![OffsetSetter::placeholder()],
            hits: Vec::new(),
        }
    }

    fn add_span(&mut self, bc: BcId, line: u32, id: i32, value: &Value, neg: i64, pos: i64) {
        self.spans.push(Span {
            bc,
            line,
            id,
            depval: value.clone(),
            cached_abs: None,
            terms: Vec::new(),
            cur_val: 0,
            new_val: 0,
            neg_thres: neg,
            pos_thres: pos,
            state: SpanState::Active,
            backtrace: Vec::new(),
            os_index: self.offset_setters.len() - 1,
        });
    }

    fn add_offset_setter(&mut self, bc: BcId, next_offset: u64) {
        // Fill the trailing placeholder and start a new one.
        if let Some(os) = self.offset_setters.last_mut() {
            os.bc = Some(bc);
            os.thres = next_offset;
        }
        self.offset_setters.push(OffsetSetter::placeholder());
    }

    /// Pre-tree expansion: spans that are certainly long expand right away;
    /// spans whose bytecode has no further growth are deleted.
    fn step_1b(&mut self, obj: &mut Object, diag: &mut Diagnostics) -> bool {
        let mut saw_error = false;
        let mut kept = Vec::with_capacity(self.spans.len());

        for mut span in core::mem::take(&mut self.spans) {
            let mut terms_ok = true;
            if let Err(err) = span.create_terms(obj) {
                diag.error(span.line, err.to_string());
                saw_error = true;
                terms_ok = false;
            }

            if terms_ok && span.recalc_normal() {
                match obj.bc_mut(span.bc).expand(span.id, span.cur_val, span.new_val) {
                    Err(err) => {
                        diag.error(span.line, err.to_string());
                        saw_error = true;
                    }
                    Ok(Expansion::Dependent {
                        neg_thres,
                        pos_thres,
                    }) => {
                        span.neg_thres = neg_thres;
                        span.pos_thres = pos_thres;
                        if span.state == SpanState::Inactive {
                            // A sentinel-valued span must not stay in the
                            // expansion loop; malformed input.
                            diag.error(span.line, LayoutError::SecondaryExpansion.to_string());
                            self.spans = kept;
                            return true;
                        }
                    }
                    Ok(Expansion::Done) => {
                        // Swallowed every threshold; drop the span entirely.
                        continue;
                    }
                }
            }
            span.cur_val = span.new_val;
            kept.push(span);
        }

        self.spans = kept;
        saw_error
    }

    /// Post-refresh re-evaluation.  Returns true when no span crossed its
    /// thresholds (the layout is already final).
    fn step_1d(&mut self, obj: &Object, diag: &mut Diagnostics) -> bool {
        for si in 0..self.spans.len() {
            let span = &mut self.spans[si];
            for term in &mut span.terms {
                term.cur_val = term.new_val;
                match calc_dist(obj, term.loc, term.loc2) {
                    Some(dist) => term.new_val = dist,
                    None => {
                        diag.error(span.line, "internal: could not compute bytecode distance");
                        return true;
                    }
                }
            }
            let fires = span.recalc_normal();
            if fires {
                span.state = SpanState::OnQueue;
                self.qb.push_back(si);
            }
        }
        self.qb.is_empty()
    }

    /// Prime offset-setters, build the interval tree, and check
    /// recompute-on-change spans for dependency cycles.
    fn step_1e(&mut self, obj: &Object, diag: &mut Diagnostics) -> bool {
        let mut saw_error = false;

        for os in &mut self.offset_setters {
            if let Some(bc) = os.bc {
                os.thres = obj.bc(bc).next_offset();
                os.new_val = obj.bc(bc).offset();
                os.cur_val = os.new_val;
            }
        }

        for (si, span) in self.spans.iter().enumerate() {
            for (ti, term) in span.terms.iter().enumerate() {
                let i1 = obj.bc(term.loc.bc).index();
                let i2 = obj.bc(term.loc2.bc).index();
                if i1 == i2 {
                    // Both ends on one bytecode: the distance can never
                    // change.
                    continue;
                }
                let (low, high) = if i1 < i2 { (i1 + 1, i2) } else { (i2 + 1, i1) };
                self.itree.insert(low, high, (si, ti));
            }
        }

        for si in 0..self.spans.len() {
            if self.spans[si].id > 0 {
                continue;
            }
            let index = obj.bc(self.spans[si].bc).index();
            let Self { itree, hits, .. } = self;
            hits.clear();
            itree.enumerate(index, index, &mut |&(dsi, _)| hits.push((dsi, 0)));

            let mut cycle = false;
            for k in 0..self.hits.len() {
                let dsi = self.hits[k].0;
                if self.spans[dsi].id > 0 {
                    continue;
                }
                if dsi == si || self.spans[si].backtrace.contains(&dsi) {
                    cycle = true;
                    break;
                }
                // Propagate our backtrace (plus ourselves) to the dependent
                // span, deduplicating on insertion.
                let mut add = self.spans[si].backtrace.clone();
                add.push(si);
                let dep = &mut self.spans[dsi].backtrace;
                for x in add {
                    if !dep.contains(&x) {
                        dep.push(x);
                    }
                }
            }
            if cycle {
                diag.error(self.spans[si].line, LayoutError::CircularReference.to_string());
                saw_error = true;
            }
        }

        saw_error
    }

    /// Main fixpoint loop.
    fn step_2(&mut self, obj: &mut Object, diag: &mut Diagnostics) -> bool {
        let mut saw_error = false;

        loop {
            // Replication counts first: they can absorb increases before
            // threshold spans are forced long.
            let si = if let Some(si) = self.qa.pop_front() {
                si
            } else if let Some(si) = self.qb.pop_front() {
                si
            } else {
                break;
            };

            {
                let span = &mut self.spans[si];
                if span.state == SpanState::Inactive {
                    continue;
                }
                span.state = SpanState::Active;
                // An offset-setter may have absorbed the growth that queued
                // us; make sure thresholds are still exceeded.
                if !span.recalc_normal() {
                    continue;
                }
            }

            let (bc, id, cur_val, new_val, line) = {
                let span = &self.spans[si];
                (span.bc, span.id, span.cur_val, span.new_val, span.line)
            };
            let orig_total = obj.bc(bc).total_len();

            match obj.bc_mut(bc).expand(id, cur_val, new_val) {
                Err(err) => {
                    diag.error(line, err.to_string());
                    saw_error = true;
                    continue;
                }
                Ok(Expansion::Dependent {
                    neg_thres,
                    pos_thres,
                }) => {
                    let span = &mut self.spans[si];
                    span.neg_thres = neg_thres;
                    span.pos_thres = pos_thres;
                    for term in &mut span.terms {
                        term.cur_val = term.new_val;
                    }
                    span.cur_val = span.new_val;
                }
                Ok(Expansion::Done) => {
                    self.spans[si].state = SpanState::Inactive;
                }
            }

            let len_diff = obj.bc(bc).total_len() as i64 - orig_total as i64;
            if len_diff == 0 {
                continue;
            }

            let index = obj.bc(bc).index();
            self.ripple_terms(index, len_diff, obj);

            let os_start = self.spans[si].os_index;
            if self
                .ripple_setters(os_start, bc.sect, len_diff, obj, diag)
                .is_err()
            {
                return true;
            }
        }

        saw_error
    }

    /// Bump every term crossing `index` by `len_diff`, queueing spans that
    /// cross their thresholds.
    fn ripple_terms(&mut self, index: u64, len_diff: i64, obj: &Object) {
        let Self { itree, hits, .. } = self;
        hits.clear();
        itree.enumerate(index, index, &mut |&entry| hits.push(entry));
        for k in 0..self.hits.len() {
            let (si, ti) = self.hits[k];
            self.expand_term(si, ti, len_diff, obj);
        }
    }

    fn expand_term(&mut self, si: usize, ti: usize, len_diff: i64, obj: &Object) {
        let span = &mut self.spans[si];
        if span.state == SpanState::Inactive {
            return;
        }
        let (i1, i2) = {
            let term = &span.terms[ti];
            (obj.bc(term.loc.bc).index(), obj.bc(term.loc2.bc).index())
        };
        let term = &mut span.terms[ti];
        if i1 < i2 {
            term.new_val += len_diff;
        } else {
            term.new_val -= len_diff;
        }
        if span.state == SpanState::OnQueue {
            return;
        }
        if !span.recalc_normal() {
            return;
        }
        let id = span.id;
        span.state = SpanState::OnQueue;
        if id <= 0 {
            self.qa.push_back(si);
        } else {
            self.qb.push_back(si);
        }
    }

    /// Walk the offset-setters following an expanded bytecode, letting each
    /// absorb what it can of the offset shift.  Stops at a section boundary
    /// or when the shift is fully absorbed.
    fn ripple_setters(
        &mut self,
        start: usize,
        sect: u32,
        len_diff: i64,
        obj: &mut Object,
        diag: &mut Diagnostics,
    ) -> Result<(), ()> {
        let mut offset_diff = len_diff;
        let mut i = start;

        while i < self.offset_setters.len() && offset_diff != 0 {
            let (osbc, cur_val, val) = {
                let os = &self.offset_setters[i];
                match os.bc {
                    Some(bc) if bc.sect == sect => (bc, os.cur_val, os.new_val),
                    _ => break,
                }
            };
            let line = obj.bc(osbc).line();
            let old_next = cur_val + obj.bc(osbc).total_len();

            if offset_diff < 0 && offset_diff.unsigned_abs() > val {
                let err = LayoutError::OffsetRegression {
                    current: val,
                    wanted: val as i64 + offset_diff,
                };
                diag.error(line, err.to_string());
                return Err(());
            }
            let new_val = (val as i64 + offset_diff) as u64;

            let orig_tail = obj.bc(osbc).tail_len();
            match obj.bc_mut(osbc).expand(1, cur_val as i64, new_val as i64) {
                Err(err) => {
                    diag.error(line, err.to_string());
                    return Err(());
                }
                Ok(Expansion::Dependent { pos_thres, .. }) => {
                    self.offset_setters[i].thres = pos_thres.max(0) as u64;
                }
                Ok(Expansion::Done) => {}
            }

            offset_diff = new_val as i64 + obj.bc(osbc).total_len() as i64 - old_next as i64;
            let tail_diff = obj.bc(osbc).tail_len() as i64 - orig_tail as i64;
            {
                let os = &mut self.offset_setters[i];
                os.new_val = new_val;
                os.cur_val = new_val;
                // The saturation offset never falls behind the setter.
                debug_assert!(os.thres >= new_val);
            }
            if tail_diff != 0 {
                let index = obj.bc(osbc).index();
                self.ripple_terms(index, tail_diff, obj);
            }
            i += 1;
        }

        Ok(())
    }
}

impl Object {
    /// Fix every length-variable bytecode's final form and every offset.
    ///
    /// Runs the five-phase fixpoint described in the module docs.  Errors
    /// are recorded in `diag`; on error the object is left consistent up to
    /// the failing phase but must not be emitted.  Call
    /// [`Object::finalize`] first.
    pub fn optimize(&mut self, diag: &mut Diagnostics) {
        if diag.num_errors() > 0 {
            return;
        }

        let mut opt = Optimizer::new();
        let mut bc_index = 0u64;
        let mut saw_error = false;

        // Step 1a: number bytecodes, lay out minimum lengths, collect spans.
        for si in 0..self.sections.len() {
            let mut offset = 0u64;
            let n = self.sections[si].bytecodes.len();
            for bi in 0..n {
                let id = BcId {
                    sect: si as u32,
                    idx: bi as u32,
                };
                {
                    let bc = &mut self.sections[si].bytecodes[bi];
                    bc.set_index(bc_index);
                    bc_index += 1;
                    bc.set_offset(offset);
                }
                if bi == 0 {
                    // Head sentinel: zero length at offset 0.
                    continue;
                }

                let spans_before = opt.spans.len();
                let line = self.sections[si].bytecodes[bi].line();
                let result = {
                    let bc = &mut self.sections[si].bytecodes[bi];
                    bc.calc_len(id, diag, &mut |span_id, value, neg, pos| {
                        opt.add_span(id, line, span_id, value, neg, pos);
                    })
                };
                match result {
                    Err(err) => {
                        diag.error(line, err.to_string());
                        saw_error = true;
                    }
                    Ok(()) => {
                        let bc = &self.sections[si].bytecodes[bi];
                        if bc.classify() == BcKind::OffsetSetting {
                            if opt.spans[spans_before..].iter().any(|s| s.id <= 0) {
                                diag.error(
                                    line,
                                    "internal: offset-setting bytecode with a \
                                     replication-dependent length",
                                );
                                saw_error = true;
                            } else {
                                opt.add_offset_setter(id, bc.next_offset());
                            }
                        }
                        offset = self.sections[si].bytecodes[bi].next_offset();
                    }
                }
            }
        }
        if saw_error || diag.num_errors() > 0 {
            return;
        }

        // Step 1b: pre-tree expansion.
        if opt.step_1b(self, diag) {
            return;
        }

        // Step 1c: offset refresh.
        self.update_offsets(diag);
        if diag.num_errors() > 0 {
            return;
        }

        // Step 1d: re-evaluate; nothing queued means we are done.
        if opt.step_1d(self, diag) {
            return;
        }

        // Step 1e: interval tree and cycle check.
        if opt.step_1e(self, diag) {
            return;
        }

        // Step 2: main fixpoint.
        if opt.step_2(self, diag) {
            return;
        }

        // Step 3: final offsets.
        self.update_offsets(diag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Contents, JumpForm};

    fn jump(target: Value) -> Contents {
        Contents::Jump {
            target,
            short: JumpForm::new(vec![0xEB], 1),
            long: JumpForm::new(vec![0xE9], 4),
            is_long: false,
        }
    }

    #[test]
    fn spans_bind_to_the_current_setter_tail() {
        let mut opt = Optimizer::new();
        let bc = BcId { sect: 0, idx: 1 };
        let v = Value::from_expr(Expr::Int(0), 8);

        opt.add_span(bc, 1, 1, &v, -128, 127);
        assert_eq!(opt.spans[0].os_index, 0);

        opt.add_offset_setter(BcId { sect: 0, idx: 2 }, 16);
        opt.add_span(bc, 1, 1, &v, -128, 127);
        assert_eq!(opt.spans[1].os_index, 1);
        assert_eq!(opt.offset_setters.len(), 2);
        assert_eq!(opt.offset_setters[0].thres, 16);
        assert!(opt.offset_setters[1].bc.is_none());
    }

    #[test]
    fn short_jump_stays_short() {
        let mut obj = Object::new();
        let text = obj.add_section(".text");
        let sym = obj.use_symbol("l", 1);
        obj.append(text, jump(Value::from_sym(sym, 8)), 1);
        obj.define_label("l", text, 2).unwrap();

        let mut diag = Diagnostics::new();
        obj.finalize(&mut diag);
        obj.optimize(&mut diag);
        assert_eq!(diag.num_errors(), 0);

        let bcs = obj.section(text).bytecodes();
        assert_eq!(bcs[1].total_len(), 2);
    }

    #[test]
    fn far_forward_jump_expands_once() {
        let mut obj = Object::new();
        let text = obj.add_section(".text");
        let sym = obj.use_symbol("target", 1);
        obj.append(text, jump(Value::from_sym(sym, 8)), 1);
        obj.append_gap(text, 130, 0, 2);
        obj.define_label("target", text, 3).unwrap();

        let mut diag = Diagnostics::new();
        obj.finalize(&mut diag);
        obj.optimize(&mut diag);
        assert_eq!(diag.num_errors(), 0);

        let bcs = obj.section(text).bytecodes();
        assert_eq!(bcs[1].total_len(), 5);
        assert_eq!(obj.symbol_offset(sym), Some(135));
    }
}
