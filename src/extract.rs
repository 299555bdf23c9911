//! Resumable extraction: the pipeline orchestrator and its entry point.
//!
//! ## Run lifecycle
//!
//! ```text
//! Initialized ──▶ Running ──▶ Completed
//!      │             │
//!      │             └──▶ Interrupted ──(--resume)──▶ Resuming ──▶ Running
//!      └──▶ Aborted   (saved session built under different settings)
//! ```
//!
//! ## Per-unit flow
//!
//! Each worker carries one unit end to end:
//!
//! ```text
//! render ─▶ scheduler.acquire ─▶ retry(service.call) ─▶ parse ─▶ normalize
//!        ─▶ store records ─▶ checkpoint.record_success ─▶ scheduler.release
//! ```
//!
//! A failed unit is checkpointed as failed and the run moves on. Every
//! `checkpoint_every` finished units the partial journal and the session are
//! persisted, so an interruption loses at most that many units of work.
//!
//! ## Interruption
//!
//! Once the [`ShutdownSignal`] fires, no new unit is admitted, calls already
//! in flight run to completion and their results are checkpointed, units
//! waiting for admission or sitting in a retry backoff are left pending, and
//! the session is saved before [`PipelineOrchestrator::run`] returns with
//! [`RunState::Interrupted`].

use crate::checkpoint::CheckpointStore;
use crate::config::{ExtractionConfig, FieldMap};
use crate::error::{ExtractError, RetryError, UnitError};
use crate::output::{ExtractedRecord, RunOutcome, RunStats, UnitOutcome};
use crate::pipeline::input;
use crate::pipeline::normalize::{parse_response, RecordNormalizer};
use crate::pipeline::render::{PdfiumRenderer, UnitRenderer};
use crate::pipeline::retry::RetryExecutor;
use crate::pipeline::schedule::{Scheduler, Ticket};
use crate::pipeline::service::{resolve_provider, AnalysisService, ServiceResponse, VisionService};
use crate::pipeline::sink::{self, FileSink, RecordSink};
use crate::progress::ProgressCallback;
use crate::prompts::{DEFAULT_EXTRACTION_PROMPT, FALLBACK_PROMPT};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Running,
    Resuming,
    Interrupted,
    Completed,
    Aborted,
}

/// Cooperative stop request shared between the caller and the workers.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested, finishing in-flight units");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Trigger on the first Ctrl-C.
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received");
                signal.trigger();
            }
        })
    }
}

/// Caller choices that are not part of the extraction settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue an existing session.
    pub resume: bool,
    /// Discard any existing session and start over.
    pub force: bool,
    pub shutdown: ShutdownSignal,
}

/// Drives every selected unit through render, call, normalize and checkpoint.
pub struct PipelineOrchestrator {
    config: ExtractionConfig,
    renderer: Arc<dyn UnitRenderer>,
    service: Arc<dyn AnalysisService>,
    input_id: String,
    state: RunState,
}

impl PipelineOrchestrator {
    /// `input_id` names the session files; use [`input::content_hash`].
    pub fn new(
        config: ExtractionConfig,
        renderer: Arc<dyn UnitRenderer>,
        service: Arc<dyn AnalysisService>,
        input_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            renderer,
            service,
            input_id: input_id.into(),
            state: RunState::Initialized,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn state_path(&self) -> PathBuf {
        CheckpointStore::state_path(&self.config.state_dir, &self.input_id)
    }

    pub fn journal_path(&self) -> PathBuf {
        sink::partial_journal_path(&self.config.state_dir, &self.input_id)
    }

    fn transition(&mut self, to: RunState) {
        debug!(from = ?self.state, to = ?to, "run state");
        self.state = to;
    }

    /// Run (or resume) the session and hand the ordered dataset to `sink`.
    ///
    /// Unit failures do not make this return `Err`; check
    /// `outcome.summary.failed`. `Err` means the session itself could not
    /// proceed: unreadable or incompatible state, no units, I/O failure.
    pub async fn run(
        &mut self,
        options: &RunOptions,
        sink: &mut dyn RecordSink,
    ) -> Result<RunOutcome, ExtractError> {
        let started = Instant::now();
        self.transition(RunState::Initialized);

        let total_units = self.renderer.unit_count().await?;
        if total_units == 0 {
            return Err(ExtractError::EmptySelection { total: 0 });
        }
        let selection = self.config.units.to_indices(total_units);
        if selection.is_empty() {
            return Err(ExtractError::EmptySelection { total: total_units });
        }

        let state_path = self.state_path();
        let journal_path = self.journal_path();
        let fingerprint = self.config.fingerprint();

        let (store, resumed) = match self.open_session(options, &state_path, total_units, &fingerprint) {
            Ok(opened) => opened,
            Err(e) => {
                if matches!(e, ExtractError::ConfigMismatch { .. }) {
                    self.transition(RunState::Aborted);
                }
                return Err(e);
            }
        };
        store.save()?;

        let session = store.snapshot();
        let stats_before = session.stats;
        let mut restored = BTreeMap::new();
        if resumed {
            self.transition(RunState::Resuming);
            restored = sink::read_partial(&journal_path)?;
            restored.retain(|unit, _| session.completed_units.contains(unit));
        }

        let pending: Vec<usize> = selection
            .iter()
            .copied()
            .filter(|unit| !session.completed_units.contains(unit))
            .collect();
        let skipped_units = selection.len() - pending.len();
        info!(
            session = %session.session_id,
            total_units,
            selected = selection.len(),
            pending = pending.len(),
            already_done = skipped_units,
            next = ?store.next_pending_unit(),
            "starting extraction"
        );

        let prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_EXTRACTION_PROMPT.to_string());
        let normalizer = RecordNormalizer::new(self.config.fields.clone(), self.config.max_text_len)
            .with_unknown_counter(session.stats.unknown_keys_generated);
        let shutdown = options.shutdown.clone();
        let progress = self.config.progress_callback.clone();

        self.transition(RunState::Running);
        if let Some(cb) = &progress {
            cb.on_run_start(pending.len(), skipped_units);
        }

        let ctx = UnitContext {
            store: &store,
            scheduler: Scheduler::new(self.config.rate_limits()),
            retry: RetryExecutor::new(self.config.retry_policy()),
            normalizer: Mutex::new(normalizer),
            records: Mutex::new(restored),
            renderer: self.renderer.as_ref(),
            service: self.service.as_ref(),
            prompt: &prompt,
            fields: &self.config.fields,
            fallback_prompt: self.config.fallback_prompt,
            shutdown: &shutdown,
            total_units,
            progress: progress.as_ref(),
        };

        let checkpoint_every = self.config.checkpoint_every.max(1);
        let mut outcomes: Vec<UnitOutcome> = Vec::with_capacity(pending.len());
        let mut interrupted = false;
        let mut since_checkpoint = 0usize;

        {
            let mut results = stream::iter(pending)
                .map(|unit| ctx.process_unit(unit))
                .buffer_unordered(self.config.concurrency.max(1));

            while let Some(result) = results.next().await {
                match result {
                    UnitResult::Finished(outcome) => {
                        outcomes.push(outcome);
                        since_checkpoint += 1;
                        if since_checkpoint >= checkpoint_every {
                            ctx.checkpoint(&journal_path)?;
                            since_checkpoint = 0;
                        }
                    }
                    UnitResult::Skipped(unit) => {
                        debug!(unit, "unit left pending");
                        interrupted = true;
                    }
                }
            }
        }

        ctx.checkpoint(&journal_path)?;
        let normalizer_stats = lock(&ctx.normalizer).stats();
        let records: Vec<ExtractedRecord> = lock(&ctx.records)
            .values()
            .flatten()
            .cloned()
            .collect();
        drop(ctx);

        sink.write(&records)?;

        let session = store.snapshot();
        let summary = session.summary();
        let final_path = if session.is_complete() {
            let completed_path = store.finalize()?;
            sink::remove_partial(&journal_path);
            completed_path
        } else {
            state_path
        };

        self.transition(if interrupted {
            RunState::Interrupted
        } else {
            RunState::Completed
        });

        outcomes.sort_by_key(|o| o.unit_index);
        let stats = RunStats {
            total_units,
            selected_units: selection.len(),
            skipped_units,
            processed_units: outcomes.len(),
            completed_units: outcomes.iter().filter(|o| o.is_success()).count(),
            failed_units: outcomes.iter().filter(|o| !o.is_success()).count(),
            records_extracted: records.len(),
            api_calls: session.stats.api_calls - stats_before.api_calls,
            api_errors: session.stats.api_errors - stats_before.api_errors,
            input_tokens: session.stats.input_tokens - stats_before.input_tokens,
            output_tokens: session.stats.output_tokens - stats_before.output_tokens,
            total_duration_ms: started.elapsed().as_millis() as u64,
            normalizer: normalizer_stats,
        };

        if let Some(cb) = &progress {
            cb.on_run_complete(stats.completed_units, stats.failed_units, interrupted);
        }
        info!(
            state = ?self.state,
            completed = summary.completed,
            failed = summary.failed,
            remaining = summary.remaining,
            records = records.len(),
            duration_ms = stats.total_duration_ms,
            "extraction finished"
        );

        Ok(RunOutcome {
            state: self.state,
            summary,
            records,
            units: outcomes,
            stats,
            state_path: final_path,
        })
    }

    /// Decide between a fresh session and resuming the saved one.
    fn open_session(
        &self,
        options: &RunOptions,
        state_path: &Path,
        total_units: usize,
        fingerprint: &str,
    ) -> Result<(CheckpointStore, bool), ExtractError> {
        if options.force {
            CheckpointStore::discard(state_path)?;
            sink::remove_partial(&self.journal_path());
        } else if options.resume && state_path.exists() {
            let store = CheckpointStore::load(state_path)?;
            store.validate_fingerprint(fingerprint)?;
            let saved_total = store.snapshot().total_units;
            if saved_total != total_units {
                return Err(ExtractError::CorruptState {
                    path: state_path.to_path_buf(),
                    detail: format!(
                        "session covers {saved_total} units but the input has {total_units}"
                    ),
                });
            }
            return Ok((store, true));
        } else if options.resume {
            info!(path = %state_path.display(), "no saved session, starting fresh");
        }

        let store =
            CheckpointStore::initialize(state_path, total_units, Some(fingerprint.to_string()))?;
        Ok((store, false))
    }
}

/// Extract records from a PDF path or URL into `output`.
///
/// Resolves the input, derives the session identity from the file's
/// content hash, picks the LLM provider, and runs the orchestrator with a
/// [`FileSink`].
///
/// ```rust,no_run
/// use edgequake_pdf2tasks::{extract, ExtractionConfig, RunOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ExtractionConfig::builder().concurrency(2).build()?;
///     let options = RunOptions { resume: true, ..Default::default() };
///     let outcome = extract("workbook.pdf", "tasks.jsonl", &config, &options).await?;
///     println!("{}", outcome.summary.render_report());
///     Ok(())
/// }
/// ```
pub async fn extract(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
    options: &RunOptions,
) -> Result<RunOutcome, ExtractError> {
    let input_str = input_str.as_ref();
    info!(input = input_str, "starting extraction");

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let input_id = input::content_hash(resolved.path()).await?;
    debug!(input_id = %input_id, "input identity");

    let provider = resolve_provider(config)?;
    let renderer = Arc::new(PdfiumRenderer::new(
        resolved.path(),
        config.dpi,
        config.max_rendered_pixels,
        config.password.clone(),
    ));
    let service = Arc::new(VisionService::new(provider, config));
    let mut sink = FileSink::new(output_path.as_ref());

    let mut orchestrator = PipelineOrchestrator::new(config.clone(), renderer, service, input_id);
    orchestrator.run(options, &mut sink).await
}

// ── Worker side ──────────────────────────────────────────────────────────

/// Shared state every worker borrows for the duration of one run.
struct UnitContext<'a> {
    store: &'a CheckpointStore,
    scheduler: Scheduler,
    retry: RetryExecutor,
    normalizer: Mutex<RecordNormalizer>,
    /// Records of completed units, keyed by unit.
    records: Mutex<BTreeMap<usize, Vec<ExtractedRecord>>>,
    renderer: &'a dyn UnitRenderer,
    service: &'a dyn AnalysisService,
    prompt: &'a str,
    fields: &'a FieldMap,
    fallback_prompt: bool,
    shutdown: &'a ShutdownSignal,
    total_units: usize,
    progress: Option<&'a ProgressCallback>,
}

enum UnitResult {
    Finished(UnitOutcome),
    /// Not admitted, or stopped by shutdown before it could be checkpointed.
    Skipped(usize),
}

/// Why a unit stopped before producing records.
enum Halt {
    Interrupted,
    Failed(UnitError),
}

#[derive(Default)]
struct Usage {
    calls: u32,
    errors: u32,
    input_tokens: u64,
    output_tokens: u64,
}

struct Extracted {
    records: Vec<ExtractedRecord>,
    warnings: Vec<String>,
    unknown_counter: u64,
}

impl UnitContext<'_> {
    async fn process_unit(&self, unit: usize) -> UnitResult {
        if self.shutdown.is_triggered() {
            return UnitResult::Skipped(unit);
        }
        let started = Instant::now();
        let unit_num = unit + 1;
        if let Some(cb) = self.progress {
            cb.on_unit_start(unit_num, self.total_units);
        }

        let mut usage = Usage::default();
        let result = self.run_unit(unit, &mut usage).await;

        self.store.update_stats(|s| {
            s.api_calls += usage.calls as u64;
            s.api_errors += usage.errors as u64;
            s.input_tokens += usage.input_tokens;
            s.output_tokens += usage.output_tokens;
        });

        let mut outcome = UnitOutcome {
            unit_index: unit,
            records_extracted: 0,
            attempts: usage.calls,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration_ms: 0,
            warnings: Vec::new(),
            error: None,
        };

        match result {
            Ok(extracted) => {
                let count = extracted.records.len();
                lock(&self.records).insert(unit, extracted.records);
                self.store.record_success(unit);
                for warning in &extracted.warnings {
                    self.store.add_warning(unit, warning.clone());
                }
                self.store.update_stats(|s| {
                    s.records_extracted += count as u64;
                    s.unknown_keys_generated = s.unknown_keys_generated.max(extracted.unknown_counter);
                });
                info!(unit, records = count, warnings = extracted.warnings.len(), "unit completed");
                if let Some(cb) = self.progress {
                    cb.on_unit_complete(unit_num, self.total_units, count);
                }
                outcome.records_extracted = count;
                outcome.warnings = extracted.warnings;
            }
            Err(Halt::Failed(e)) => {
                lock(&self.records).remove(&unit);
                self.store.record_failure(unit, e.to_string());
                error!(unit, error = %e, "unit failed");
                if let Some(cb) = self.progress {
                    cb.on_unit_error(unit_num, self.total_units, &e.to_string());
                }
                outcome.error = Some(e);
            }
            Err(Halt::Interrupted) => return UnitResult::Skipped(unit),
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        UnitResult::Finished(outcome)
    }

    async fn run_unit(&self, unit: usize, usage: &mut Usage) -> Result<Extracted, Halt> {
        let png = self
            .renderer
            .render(unit)
            .await
            .map_err(|e| Halt::Failed(e.into()))?;

        let mut ticket = self.admit(unit).await?;
        let response = self.call(unit, &png, self.prompt, usage).await?;

        let value = match parse_response(&response.content, self.fields) {
            Ok(value) => value,
            Err(detail) if self.fallback_prompt => {
                warn!(unit, detail = %detail, "unparseable response, retrying with fallback prompt");
                self.scheduler.release(&mut ticket);
                ticket = self.admit(unit).await?;
                let retry = self.call(unit, &png, FALLBACK_PROMPT, usage).await?;
                parse_response(&retry.content, self.fields)
                    .map_err(|detail| Halt::Failed(UnitError::MalformedResponse { unit, detail }))?
            }
            Err(detail) => return Err(Halt::Failed(UnitError::MalformedResponse { unit, detail })),
        };

        let (normalized, unknown_counter) = {
            let mut normalizer = lock(&self.normalizer);
            let normalized = normalizer.normalize(&value, unit);
            (normalized, normalizer.unknown_counter())
        };
        self.scheduler.release(&mut ticket);

        let mut warnings = normalized.warnings;
        warnings.extend(normalized.errors.iter().map(|e| format!("rejected {e}")));
        Ok(Extracted {
            records: normalized.records,
            warnings,
            unknown_counter,
        })
    }

    /// Wait for admission unless shutdown fires first.
    async fn admit(&self, unit: usize) -> Result<Ticket, Halt> {
        tokio::select! {
            biased;
            _ = self.shutdown.stopped() => Err(Halt::Interrupted),
            ticket = self.scheduler.acquire() => ticket.map_err(|e| {
                Halt::Failed(UnitError::ServiceRejected { unit, detail: e.to_string() })
            }),
        }
    }

    /// One logical service call under the retry policy.
    async fn call(
        &self,
        unit: usize,
        png: &[u8],
        prompt: &str,
        usage: &mut Usage,
    ) -> Result<ServiceResponse, Halt> {
        let calls = AtomicU32::new(0);
        let errors = AtomicU32::new(0);
        let (calls_ref, errors_ref) = (&calls, &errors);
        let service = self.service;

        let result = self
            .retry
            .execute_until(unit, self.shutdown.stopped(), move |_| async move {
                calls_ref.fetch_add(1, Ordering::Relaxed);
                let reply = service.call(png, unit, prompt).await;
                if reply.is_err() {
                    errors_ref.fetch_add(1, Ordering::Relaxed);
                }
                reply
            })
            .await;

        usage.calls += calls.into_inner();
        usage.errors += errors.into_inner();

        match result {
            Ok(attempted) => {
                usage.input_tokens += attempted.value.input_tokens;
                usage.output_tokens += attempted.value.output_tokens;
                Ok(attempted.value)
            }
            Err(RetryError::Cancelled { .. }) => Err(Halt::Interrupted),
            Err(e) => Err(Halt::Failed(UnitError::from_retry(unit, &e))),
        }
    }

    /// Persist the journal, then the session that vouches for it.
    fn checkpoint(&self, journal_path: &Path) -> Result<(), ExtractError> {
        sink::write_partial(journal_path, &lock(&self.records))?;
        self.store.save()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
