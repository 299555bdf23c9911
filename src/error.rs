//! Error types for the edgequake-pdf2tasks library.
//!
//! Errors are split by blast radius:
//!
//! * [`ExtractError`]: **Session-fatal**: the run cannot proceed at all
//!   (bad input, corrupt checkpoint, configuration changed since the last
//!   run). Returned as `Err(ExtractError)` from the top-level entry points.
//!
//! * [`UnitError`]: **Unit-fatal**: one unit (page) failed to render or the
//!   service gave up on it. Stored in the session and in
//!   [`crate::output::UnitOutcome`]; the run continues with the next unit.
//!
//! * [`NormalizationError`]: **Item-local**: one raw item inside an otherwise
//!   good response was malformed. The item is dropped, the unit still succeeds.
//!
//! [`ServiceError`] is the classification every transport failure is mapped
//! to before the retry executor decides whether to back off or give up.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All session-fatal errors returned by the edgequake-pdf2tasks library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// The input has no units to process, or the selection matches none.
    #[error("No units to process: selection is empty (document has {total} units)")]
    EmptySelection { total: usize },

    // ── Service errors ────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// The session state file exists but cannot be read or fails validation.
    #[error(
        "Session state '{path}' is corrupt: {detail}\n\
         Inspect or repair the file by hand, or pass --force to discard it and start over."
    )]
    CorruptState { path: PathBuf, detail: String },

    /// A session already exists and the caller asked for neither resume nor force.
    #[error(
        "A session for this input already exists at '{path}' (last updated {updated_at}).\n\
         Pass --resume to continue it or --force to discard it."
    )]
    SessionExists { path: PathBuf, updated_at: String },

    /// No session state file exists at the expected path.
    #[error("No session state found at '{path}'")]
    NoSession { path: PathBuf },

    /// The saved session was produced under an incompatible configuration.
    #[error(
        "Configuration changed since the session was started (saved {saved}, current {current}).\n\
         Restore the previous settings or pass --force to start a new session."
    )]
    ConfigMismatch { saved: String, current: String },

    /// Writing the session state failed.
    #[error("Failed to write session state '{path}': {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium for your platform, or set PDFIUM_LIB_PATH=/path/to/libpdfium\n\
to point at an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classified failure of one external service call.
///
/// Only `RateLimited` and `Transient` are retried; see
/// [`crate::pipeline::retry::RetryExecutor`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    /// HTTP 429 or provider quota message. `retry_after` is the
    /// server-suggested delay when one was given.
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Connection reset, timeout, 5xx, overloaded backend.
    #[error("transient service error: {cause}")]
    Transient { cause: String },

    /// Authentication, validation, any other 4xx. Never retried.
    #[error("service error: {cause}")]
    Fatal { cause: String },
}

impl ServiceError {
    /// Whether the retry executor may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient { .. })
    }
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

/// Terminal result of [`crate::pipeline::retry::RetryExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    /// Every allowed attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ServiceError },

    /// The service returned a non-retryable error.
    #[error("{error}")]
    Fatal { attempts: u32, error: ServiceError },

    /// Shutdown arrived while waiting to retry.
    #[error("cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: ServiceError },
}

impl RetryError {
    /// Number of calls made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// A unit could not be rendered. Always unit-fatal, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unit {unit}: rendering failed: {detail}")]
pub struct RenderError {
    pub unit: usize,
    pub detail: String,
}

/// One raw item inside a service response was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NormalizationError {
    /// A required field is absent from the item.
    #[error("item {item}: missing required field '{field}'")]
    MissingField { item: usize, field: String },

    /// The text field is empty once cleaned.
    #[error("item {item}: text is empty after cleaning")]
    EmptyText { item: usize },

    /// The text field exceeds the configured maximum length.
    #[error("item {item}: text is {len} characters, limit is {max}")]
    TextTooLong { item: usize, len: usize, max: usize },

    /// A field has a type that cannot be interpreted.
    #[error("item {item}: field '{field}' has an unusable value: {detail}")]
    InvalidField {
        item: usize,
        field: String,
        detail: String,
    },

    /// The item is not a JSON object.
    #[error("item {item}: expected an object")]
    NotAnObject { item: usize },
}

/// A non-fatal error for a single unit.
///
/// Stored in [`crate::output::UnitOutcome`]; the error message is also
/// written to the session's `errors` map.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum UnitError {
    /// Unit rendering failed.
    #[error("Unit {unit}: rendering failed: {detail}")]
    RenderFailed { unit: usize, detail: String },

    /// Service call failed after every allowed attempt.
    #[error("Unit {unit}: service call failed after {attempts} attempts: {detail}")]
    RetriesExhausted {
        unit: usize,
        attempts: u32,
        detail: String,
    },

    /// Service rejected the call with a non-retryable error.
    #[error("Unit {unit}: service call rejected: {detail}")]
    ServiceRejected { unit: usize, detail: String },

    /// The response could not be parsed into the expected shape.
    #[error("Unit {unit}: malformed service response: {detail}")]
    MalformedResponse { unit: usize, detail: String },
}

impl UnitError {
    /// Build the unit error for a terminal retry outcome.
    pub fn from_retry(unit: usize, err: &RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                unit,
                attempts: *attempts,
                detail: last.to_string(),
            },
            RetryError::Fatal { error, .. } => Self::ServiceRejected {
                unit,
                detail: error.to_string(),
            },
            RetryError::Cancelled { attempts, last } => Self::RetriesExhausted {
                unit,
                attempts: *attempts,
                detail: format!("cancelled: {last}"),
            },
        }
    }

    /// Unit index the error belongs to.
    pub fn unit(&self) -> usize {
        match self {
            Self::RenderFailed { unit, .. }
            | Self::RetriesExhausted { unit, .. }
            | Self::ServiceRejected { unit, .. }
            | Self::MalformedResponse { unit, .. } => *unit,
        }
    }
}

impl From<RenderError> for UnitError {
    fn from(e: RenderError) -> Self {
        Self::RenderFailed {
            unit: e.unit,
            detail: e.detail,
        }
    }
}
