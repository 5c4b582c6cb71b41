//! Common definitions that are shared between different parts of the compiler.

use thiserror::Error;

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers.
pub type Id = internment::Intern<String>;

/// Intern a string slice as an [Id].
pub fn id(s: &str) -> Id {
    Id::new(s.to_string())
}

/// A source position, tracked by the lexer and carried on AST nodes for
/// diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// The two user-visible failure kinds.  Everything a pass can fail with is
/// one of these; only the driver turns them into a process exit.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// A violation detected while reading the source program: lex or parse
    /// errors, unresolved names, type mismatches.
    #[error("{span}: {msg}")]
    Semantic { span: Span, msg: String },

    /// An invariant violation inside the compiler itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn semantic(span: Span, msg: impl Into<String>) -> Self {
        CompileError::Semantic {
            span,
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Per-run configuration, threaded through the pipeline instead of living in
/// process-wide state.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Dump abstract instructions to stderr before register allocation.
    pub print_ins: bool,
    /// Report output-irrelevant elimination decisions to stderr.
    pub print_remove: bool,
    /// Local-variable count above which a function is allocated with the
    /// naive all-on-stack strategy instead of graph coloring.
    pub naive_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            print_ins: false,
            print_remove: false,
            naive_threshold: 256,
        }
    }
}
