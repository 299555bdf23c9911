//! Progress-callback trait for per-unit extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to follow a
//! run unit by unit: drive a progress bar, forward events to a channel, or
//! write an audit log.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2tasks::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RecordCounter {
//!     records: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for RecordCounter {
//!     fn on_unit_complete(&self, unit_num: usize, total_units: usize, records: usize) {
//!         self.records.fetch_add(records, Ordering::SeqCst);
//!         eprintln!("unit {}/{}: {} records", unit_num, total_units, records);
//!     }
//! }
//!
//! let counter = Arc::new(RecordCounter { records: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it works through the units.
///
/// Units run concurrently, so the per-unit methods may be called from
/// several tasks at once; protect shared state with atomics or a mutex.
/// Every method defaults to a no-op.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before the first unit is scheduled.
    ///
    /// # Arguments
    /// * `pending_units`: units this run will attempt
    /// * `already_done`: selected units completed by an earlier run
    fn on_run_start(&self, pending_units: usize, already_done: usize) {
        let _ = (pending_units, already_done);
    }

    /// Called when a worker picks up a unit (1-indexed).
    fn on_unit_start(&self, unit_num: usize, total_units: usize) {
        let _ = (unit_num, total_units);
    }

    /// Called when a unit is checkpointed as completed.
    fn on_unit_complete(&self, unit_num: usize, total_units: usize, records: usize) {
        let _ = (unit_num, total_units, records);
    }

    /// Called when a unit is checkpointed as failed.
    fn on_unit_error(&self, unit_num: usize, total_units: usize, error: &str) {
        let _ = (unit_num, total_units, error);
    }

    /// Called once after the session has been persisted.
    ///
    /// `interrupted` is true when a shutdown signal stopped the run early.
    fn on_run_complete(&self, completed: usize, failed: usize, interrupted: bool) {
        let _ = (completed, failed, interrupted);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
