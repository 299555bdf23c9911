//! # edgequake-pdf2tasks
//!
//! Extract structured records (exercises, tasks, problems) from PDF pages
//! using Vision Language Models, with runs that survive interruption.
//!
//! ## Why this crate?
//!
//! Pulling every exercise out of a 300-page workbook means hundreds of slow,
//! rate-limited, occasionally failing model calls. A crash at page 240 should
//! not cost the first 239. This crate treats each page as an independent
//! unit of work, checkpoints progress to disk as it goes, and picks up
//! exactly where it stopped on the next run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file or download from URL, hash content
//!  ├─ 2. Session    create, or resume and verify, the checkpoint file
//!  ├─ 3. Render     rasterise each pending page via pdfium (spawn_blocking)
//!  ├─ 4. Schedule   concurrency cap + rolling rate window + min spacing
//!  ├─ 5. Call       VLM request under retry with exponential backoff
//!  ├─ 6. Normalize  validate and clean raw items into ExtractedRecords
//!  ├─ 7. Checkpoint every K units: partial journal, then session file
//!  └─ 8. Output     unit-ordered JSON Lines or CSV + session summary
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2tasks::{extract, ExtractionConfig, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let options = RunOptions { resume: true, ..Default::default() };
//!     let outcome = extract("workbook.pdf", "tasks.jsonl", &config, &options).await?;
//!     eprintln!("{}", outcome.summary.render_report());
//!     Ok(())
//! }
//! ```
//!
//! ## Resuming
//!
//! Session state lives in `<state_dir>/<sha256 of the PDF>.state.json`.
//! Running again with `resume: true` skips every completed page; failed
//! pages are retried. A session saved under different extraction settings
//! is refused with [`ExtractError::ConfigMismatch`]; `force: true` discards
//! it. Once every page is completed the file is renamed to
//! `.state.json.completed`.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2tasks` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2tasks = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{CheckpointStore, ProcessingSession, SessionStats};
pub use config::{ExtractionConfig, ExtractionConfigBuilder, FieldMap, UnitSelection};
pub use error::{
    ExtractError, NormalizationError, RenderError, RetryError, ServiceError, UnitError,
};
pub use extract::{extract, PipelineOrchestrator, RunOptions, RunState, ShutdownSignal};
pub use output::{ExtractedRecord, RunOutcome, RunStats, SessionSummary, UnitOutcome};
pub use pipeline::normalize::RecordNormalizer;
pub use pipeline::render::{PdfiumRenderer, UnitRenderer};
pub use pipeline::retry::{RetryExecutor, RetryPolicy};
pub use pipeline::schedule::{RateLimitConfig, Scheduler, Ticket};
pub use pipeline::service::{AnalysisService, ServiceResponse, VisionService};
pub use pipeline::sink::{FileSink, MemorySink, RecordSink, SinkFormat};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
