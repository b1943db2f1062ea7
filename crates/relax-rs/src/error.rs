//! Error kinds and the diagnostic sink.
//!
//! The layout engine never aborts on the first problem: recoverable errors
//! are recorded in a [`Diagnostics`] sink together with their source line,
//! and each optimization phase checks the running error count before moving
//! on.  This surfaces as many input problems per run as possible.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// A layout or relaxation error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayoutError {
    /// A set of layout-dependent replication counts mutually depend on each
    /// other in a way the fixpoint cannot resolve.
    CircularReference,

    /// A value that became cross-section or non-integer was re-entered into
    /// the expansion loop.  Indicates malformed input.
    SecondaryExpansion,

    /// An origin or alignment bytecode would need to place its successor at
    /// a smaller offset than it already occupies.
    OffsetRegression {
        /// Offset the setter currently places its successor at.
        current: u64,
        /// The (impossible) offset the layout change would require.
        wanted: i64,
    },

    /// A symbol was defined more than once.
    DuplicateSymbol {
        /// The symbol name.
        name: String,
    },

    /// An error raised by a bytecode contents callback.
    Contents {
        /// Description of the problem.
        detail: String,
    },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::CircularReference => {
                write!(f, "circular reference detected")
            }
            LayoutError::SecondaryExpansion => {
                write!(f, "secondary expansion of an external or complex value")
            }
            LayoutError::OffsetRegression { current, wanted } => {
                write!(
                    f,
                    "origin/alignment cannot move backwards (currently at 0x{:X}, layout requires {})",
                    current, wanted
                )
            }
            LayoutError::DuplicateSymbol { name } => {
                write!(f, "symbol '{}' is already defined", name)
            }
            LayoutError::Contents { detail } => {
                write!(f, "{}", detail)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LayoutError {}

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Level {
    /// A fatal input problem; the layout is not emitable.
    Error,
    /// A suspicious construct that does not prevent emission.
    Warning,
}

/// One collected diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    /// Severity.
    pub level: Level,
    /// 1-based source line the diagnostic refers to (0 for generated code).
    pub line: u32,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Error => "error",
            Level::Warning => "warning",
        };
        write!(f, "{}: {}: {}", self.line, level, self.message)
    }
}

/// Sink collecting errors and warnings with a running error count.
#[derive(Debug, Default)]
pub struct Diagnostics {
    records: Vec<Record>,
    num_errors: usize,
}

impl Diagnostics {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error at `line`.
    pub fn error(&mut self, line: u32, message: impl Into<String>) {
        self.records.push(Record {
            level: Level::Error,
            line,
            message: message.into(),
        });
        self.num_errors += 1;
    }

    /// Record a warning at `line`.
    pub fn warning(&mut self, line: u32, message: impl Into<String>) {
        self.records.push(Record {
            level: Level::Warning,
            line,
            message: message.into(),
        });
    }

    /// Number of `Error`-level records collected so far.
    #[must_use]
    pub fn num_errors(&self) -> usize {
        self.num_errors
    }

    /// All collected records, in recording order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// True if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_reference_display() {
        assert_eq!(
            format!("{}", LayoutError::CircularReference),
            "circular reference detected"
        );
    }

    #[test]
    fn offset_regression_display() {
        let err = LayoutError::OffsetRegression {
            current: 0x82,
            wanted: 0x85,
        };
        assert_eq!(
            format!("{}", err),
            "origin/alignment cannot move backwards (currently at 0x82, layout requires 133)"
        );
    }

    #[test]
    fn duplicate_symbol_display() {
        let err = LayoutError::DuplicateSymbol {
            name: "start".into(),
        };
        assert_eq!(format!("{}", err), "symbol 'start' is already defined");
    }

    #[test]
    fn sink_counts_errors_not_warnings() {
        let mut diag = Diagnostics::new();
        diag.warning(1, "odd alignment");
        assert_eq!(diag.num_errors(), 0);
        diag.error(2, "bad value");
        diag.error(7, "worse value");
        assert_eq!(diag.num_errors(), 2);
        assert_eq!(diag.records().len(), 3);
    }

    #[test]
    fn record_display() {
        let rec = Record {
            level: Level::Error,
            line: 12,
            message: "circular reference detected".into(),
        };
        assert_eq!(format!("{}", rec), "12: error: circular reference detected");
    }
}
