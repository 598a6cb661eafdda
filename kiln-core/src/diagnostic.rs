//! Diagnostics and the append-only diagnostic sink.
//!
//! Stages produce [`Diagnostic`] values that point at byte spans. The
//! `Context` converts them into [`DiagnosticRecord`]s, which carry the
//! origin name and 1-based position, and appends those to the
//! [`DiagnosticSink`]. Records are immutable once appended.

use std::fmt;

use crate::error::KilnError;
use crate::span::{Location, Span};

/// Whether a diagnostic stops the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Fatal: the pipeline ends in `Errored` once the current stage finishes.
    Error,
    /// Informational: compilation proceeds.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// A problem reported by a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// `None` for problems that are not tied to a source unit.
    pub span: Option<Span>,
    pub code: Option<&'static str>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            span: Some(span),
            code: None,
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
            span: Some(span),
            code: None,
        }
    }

    /// An error that has no source position (e.g. an invalid configuration).
    pub fn detached(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            span: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A diagnostic as exposed at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    severity: Severity,
    message: String,
    origin: String,
    location: Location,
    code: Option<&'static str>,
}

impl DiagnosticRecord {
    pub fn new(diagnostic: Diagnostic, origin: impl Into<String>, location: Location) -> Self {
        DiagnosticRecord {
            severity: diagnostic.severity,
            message: diagnostic.message,
            origin: origin.into(),
            location,
            code: diagnostic.code,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Display name of the unit the diagnostic was raised in.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn line(&self) -> u32 {
        self.location.line
    }

    pub fn column(&self) -> u32 {
        self.location.column
    }

    /// Span size in source characters.
    pub fn length(&self) -> u32 {
        self.location.length
    }

    pub fn code(&self) -> Option<&'static str> {
        self.code
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.origin, self.location.line, self.location.column, self.severity
        )?;
        if let Some(code) = self.code {
            write!(f, "[{code}]")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Append-only, indexed collection of diagnostic records.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    records: Vec<DiagnosticRecord>,
    fatal: usize,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: DiagnosticRecord) {
        if record.is_fatal() {
            self.fatal += 1;
        }
        self.records.push(record);
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn fatal_count(&self) -> usize {
        self.fatal
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal > 0
    }

    pub fn get(&self, index: usize) -> Result<&DiagnosticRecord, KilnError> {
        self.records.get(index).ok_or(KilnError::IndexOutOfRange {
            index,
            count: self.records.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiagnosticRecord> {
        self.records.iter()
    }
}
