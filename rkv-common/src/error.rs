//! # Application Errors
//!
//! Purpose: Describe conditions the row store reports back to a caller as a
//! typed result, as opposed to transport failures which never reach this type.
//!
//! ## Design Principles
//! 1. **Stable Codes**: Every kind maps to a fixed numeric code for logging and
//!    cross-version comparisons.
//! 2. **Serializable**: Errors travel inside response frames unchanged.
//! 3. **Matchable**: Callers branch on `AppErrorKind`, never on message text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used by the engine and the server dispatch layer.
pub type AppResult<T> = Result<T, AppError>;

/// Backend-reported error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorKind {
    /// The table does not exist.
    TableNotFound,
    /// A table with the same name already exists.
    TableExists,
    /// The table is disabled (or already disabled when disabling).
    TableNotEnabled,
    /// The table must be disabled before this operation.
    TableNotDisabled,
    /// A mutation or read referenced an undeclared column family.
    NoSuchFamily,
    /// The scanner id is unknown or already closed.
    ScannerNotFound,
    /// Malformed argument (bad column name, unparsable filter, ...).
    IllegalArgument,
    /// Unexpected backend failure.
    Internal,
}

impl AppErrorKind {
    /// Returns the numeric code for this kind.
    pub const fn code(self) -> u16 {
        match self {
            AppErrorKind::TableNotFound => 1,
            AppErrorKind::TableExists => 2,
            AppErrorKind::TableNotEnabled => 3,
            AppErrorKind::TableNotDisabled => 4,
            AppErrorKind::NoSuchFamily => 5,
            AppErrorKind::ScannerNotFound => 6,
            AppErrorKind::IllegalArgument => 7,
            AppErrorKind::Internal => 255,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AppErrorKind::TableNotFound => "table not found",
            AppErrorKind::TableExists => "table exists",
            AppErrorKind::TableNotEnabled => "table not enabled",
            AppErrorKind::TableNotDisabled => "table not disabled",
            AppErrorKind::NoSuchFamily => "no such column family",
            AppErrorKind::ScannerNotFound => "scanner not found",
            AppErrorKind::IllegalArgument => "illegal argument",
            AppErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for AppErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the backend inside a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Error category.
    pub kind: AppErrorKind,
    /// Human-readable detail (table name, offending column, ...).
    pub message: String,
}

impl AppError {
    /// Builds an error of `kind` with a detail message.
    pub fn new(kind: AppErrorKind, message: impl Into<String>) -> Self {
        AppError {
            kind,
            message: message.into(),
        }
    }

    pub fn table_not_found(table: &str) -> Self {
        Self::new(AppErrorKind::TableNotFound, table)
    }

    pub fn table_not_enabled(table: &str) -> Self {
        Self::new(AppErrorKind::TableNotEnabled, table)
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::IllegalArgument, message)
    }

    /// Returns true if this error has the given kind.
    #[inline]
    pub fn is(&self, kind: AppErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for AppError {}
