//! # relax-rs — Bytecode Layout & Branch Relaxation Engine
//!
//! `relax-rs` is the layout core of an assembler back end: given sections of
//! already-parsed bytecodes, it decides the final encoded length of every
//! length-variable bytecode (short vs. long jump forms, layout-dependent
//! replication counts), resolves the ripple effects on all offsets and
//! symbol addresses, detects unsatisfiable circular dependencies, and
//! leaves the object ready for byte emission.
//!
//! ## Quick Start
//!
//! ```rust
//! use relax_rs::{layout, Contents, Diagnostics, JumpForm, Object, Value};
//!
//! let mut obj = Object::new();
//! let text = obj.add_section(".text");
//! let target = obj.use_symbol("done", 1);
//! obj.append(
//!     text,
//!     Contents::Jump {
//!         target: Value::from_sym(target, 8),
//!         short: JumpForm::new(vec![0xEB], 1),
//!         long: JumpForm::new(vec![0xE9], 4),
//!         is_long: false,
//!     },
//!     1,
//! );
//! obj.append_data(text, &[0x90], 2);
//! obj.define_label("done", text, 3).unwrap();
//!
//! let mut diag = Diagnostics::new();
//! assert!(layout(&mut obj, &mut diag));
//! assert_eq!(obj.emit_section(text).unwrap(), vec![0xEB, 0x01, 0x90]);
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C/C++ FFI, no system toolchain at runtime.
//! - **`no_std` + `alloc`** — embeddable in firmware, kernels, WASM.
//! - **Monotone relaxation** — lengths only grow, so the fixpoint always
//!   terminates; alignment and origin bytecodes absorb growth where they
//!   can, so nearby code does not shift needlessly.
//! - **Batched diagnostics** — as many input errors as possible are
//!   surfaced per run through a [`Diagnostics`] sink.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// A layout engine converts between offsets (u64), distances (i64), and
// field widths (u8) constantly; the narrowing/sign casts below are
// expected and checked at their use sites.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::match_same_arms,
    clippy::return_self_not_must_use
)]

extern crate alloc;

/// The layout unit: bytecodes, contents kinds, locations.
pub mod bytecode;
/// Error kinds and the diagnostic sink.
pub mod error;
/// Symbolic expressions, values, and location distances.
pub mod expr;
/// Sections, symbols, and the object container.
pub mod object;

mod itree;
mod optimizer;

// Re-exports
pub use bytecode::{BcId, BcKind, Bytecode, Contents, JumpForm, Location};
pub use error::{Diagnostics, LayoutError, Level, Record};
pub use expr::{calc_dist, Expr, Value};
pub use object::{Object, Section, SectionId, Symbol, SymbolDef, SymbolId};

/// Finalize and optimize an object in one call.
///
/// Resolves symbol references, runs the relaxation fixpoint, and returns
/// `true` when the object is ready for emission.  Collected errors and
/// warnings are left in `diag` either way.
pub fn layout(obj: &mut Object, diag: &mut Diagnostics) -> bool {
    obj.finalize(diag);
    obj.optimize(diag);
    diag.num_errors() == 0
}
