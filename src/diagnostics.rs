//! Accumulated compile-time diagnostics.
//!
//! Structural errors (unknown identifier, duplicate main, bad import, ...)
//! are never Rust-level `Result::Err`s. They are values pushed onto a
//! [`ResultMessages`] aggregator so a single resolver pass can collect as
//! many problems as possible instead of stopping at the first one.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub fileuri: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(fileuri: impl Into<String>, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            fileuri: fileuri.into(),
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}:{}:{}: {}: {}", self.fileuri, self.line, self.column, kind, self.message)
    }
}

/// Per-AST diagnostic aggregator. `success` goes false the moment any
/// error is recorded and never resets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultMessages {
    pub messages: Vec<Diagnostic>,
    pub success: bool,
}

impl ResultMessages {
    pub fn new() -> Self {
        Self { messages: Vec::new(), success: true }
    }

    pub fn push_error(&mut self, fileuri: impl Into<String>, line: u32, column: u32, message: impl Into<String>) {
        self.messages.push(Diagnostic::error(fileuri, line, column, message));
        self.success = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.success
    }
}
