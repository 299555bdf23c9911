//! Orchestrator integration tests.
//!
//! The renderer and the analysis service are in-memory fakes, so these run
//! without pdfium, network access or API keys. Every test gets its own
//! temporary state directory.

use edgequake_pdf2tasks::prompts::{DEFAULT_EXTRACTION_PROMPT, FALLBACK_PROMPT};
use edgequake_pdf2tasks::{
    AnalysisService, CheckpointStore, ExtractError, ExtractionConfig, ExtractionConfigBuilder,
    ExtractionProgressCallback, MemorySink, PipelineOrchestrator, RenderError, RunOptions,
    RunState, ServiceError, ServiceResponse, ShutdownSignal, UnitError, UnitRenderer,
    UnitSelection,
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

// ── Fakes ────────────────────────────────────────────────────────────────────

struct FakeRenderer {
    units: usize,
    broken: Vec<usize>,
}

impl FakeRenderer {
    fn new(units: usize) -> Arc<Self> {
        Arc::new(Self {
            units,
            broken: Vec::new(),
        })
    }
}

impl UnitRenderer for FakeRenderer {
    fn unit_count(&self) -> BoxFuture<'_, Result<usize, ExtractError>> {
        let units = self.units;
        async move { Ok(units) }.boxed()
    }

    fn render(&self, unit: usize) -> BoxFuture<'_, Result<Vec<u8>, RenderError>> {
        let broken = self.broken.contains(&unit);
        async move {
            if broken {
                Err(RenderError {
                    unit,
                    detail: "page stream is damaged".into(),
                })
            } else {
                Ok(vec![0x89, b'P', b'N', b'G'])
            }
        }
        .boxed()
    }
}

/// Replies from a per-unit script, then with one well-formed task per unit.
#[derive(Default)]
struct ScriptedService {
    script: Mutex<HashMap<usize, VecDeque<Result<String, ServiceError>>>>,
    calls: Mutex<Vec<(usize, String)>>,
    /// Trigger the signal when the Nth call starts.
    stop_at: Option<(ShutdownSignal, usize)>,
}

impl ScriptedService {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_script(
        script: impl IntoIterator<Item = (usize, Vec<Result<String, ServiceError>>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|(unit, replies)| (unit, replies.into()))
                    .collect(),
            ),
            ..Default::default()
        })
    }

    fn stopping(signal: ShutdownSignal, at_call: usize) -> Arc<Self> {
        Self::stopping_with_script(signal, at_call, [])
    }

    fn stopping_with_script(
        signal: ShutdownSignal,
        at_call: usize,
        script: impl IntoIterator<Item = (usize, Vec<Result<String, ServiceError>>)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|(unit, replies)| (unit, replies.into()))
                    .collect(),
            ),
            stop_at: Some((signal, at_call)),
            ..Default::default()
        })
    }

    fn called_units(&self) -> Vec<usize> {
        let mut units: Vec<usize> = self.calls.lock().unwrap().iter().map(|(u, _)| *u).collect();
        units.sort_unstable();
        units
    }

    fn prompts_for(&self, unit: usize) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| *u == unit)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl AnalysisService for ScriptedService {
    fn call<'a>(
        &'a self,
        _rendered: &'a [u8],
        unit: usize,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<ServiceResponse, ServiceError>> {
        async move {
            let call_no = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((unit, prompt.to_string()));
                calls.len()
            };
            if let Some((signal, at)) = &self.stop_at {
                if call_no == *at {
                    signal.trigger();
                }
            }
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(&unit)
                .and_then(VecDeque::pop_front);
            let content = match scripted {
                Some(Ok(content)) => content,
                Some(Err(e)) => return Err(e),
                None => one_task(unit),
            };
            Ok(ServiceResponse {
                content,
                input_tokens: 100,
                output_tokens: 20,
            })
        }
        .boxed()
    }
}

#[derive(Default)]
struct CountingProgress {
    started: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    finished: AtomicUsize,
}

impl ExtractionProgressCallback for CountingProgress {
    fn on_unit_start(&self, _unit_num: usize, _total_units: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unit_complete(&self, _unit_num: usize, _total_units: usize, _records: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unit_error(&self, _unit_num: usize, _total_units: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_complete(&self, _completed: usize, _failed: usize, _interrupted: bool) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn one_task(unit: usize) -> String {
    json!({
        "tasks": [{
            "task_number": (unit + 1).to_string(),
            "task_text": format!("Solve problem from page {}", unit + 1),
            "has_image": false,
            "confidence": 0.9
        }],
        "page_info": {"total_tasks": 1}
    })
    .to_string()
}

fn transient() -> ServiceError {
    ServiceError::Transient {
        cause: "503 service unavailable".into(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn base_config(state_dir: &Path) -> ExtractionConfigBuilder {
    init_tracing();
    ExtractionConfig::builder()
        .state_dir(state_dir)
        .concurrency(1)
        .max_requests_per_window(10_000)
        .retry_base_delay(Duration::from_millis(1))
        .retry_max_delay(Duration::from_millis(5))
        .checkpoint_every(1)
}

fn orchestrator(
    config: ExtractionConfig,
    renderer: Arc<FakeRenderer>,
    service: Arc<ScriptedService>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(config, renderer, service, "doc-hash")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_run_extracts_every_unit_in_order() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).concurrency(3).build().unwrap();
    let service = ScriptedService::new();
    let mut orch = orchestrator(config, FakeRenderer::new(6), service.clone());
    let mut sink = MemorySink::default();

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut sink).await);

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(orch.state(), RunState::Completed);
    assert_eq!(outcome.summary.completed, 6);
    assert_eq!(outcome.summary.failed, 0);
    assert_eq!(service.called_units(), vec![0, 1, 2, 3, 4, 5]);

    let units: Vec<usize> = sink.records.iter().map(|r| r.unit_index).collect();
    assert_eq!(units, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(sink.records[2].record_key, "3");
    assert_eq!(outcome.records, sink.records);

    assert_eq!(outcome.stats.api_calls, 6);
    assert_eq!(outcome.stats.input_tokens, 600);
    assert_eq!(outcome.stats.output_tokens, 120);
}

#[tokio::test]
async fn completed_session_is_finalized_and_journal_removed() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).build().unwrap();
    let mut orch = orchestrator(config, FakeRenderer::new(2), ScriptedService::new());
    let state_path = orch.state_path();
    let journal_path = orch.journal_path();

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert!(outcome.state_path.to_string_lossy().ends_with(".state.json.completed"));
    assert!(outcome.state_path.exists());
    assert!(!state_path.exists());
    assert!(!journal_path.exists());
}

#[tokio::test]
async fn resume_after_interruption_processes_only_remaining_units() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();

    // First run: the 7th call requests shutdown; that call still completes.
    let first = ScriptedService::stopping(shutdown.clone(), 7);
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(10),
        first.clone(),
    );
    let options = RunOptions {
        shutdown,
        ..Default::default()
    };
    let mut sink = MemorySink::default();
    let outcome = assert_ok!(orch.run(&options, &mut sink).await);

    assert_eq!(outcome.state, RunState::Interrupted);
    assert_eq!(outcome.summary.completed, 7);
    assert_eq!(outcome.summary.remaining, 3);
    assert_eq!(first.called_units(), (0..7).collect::<Vec<_>>());
    assert_eq!(sink.records.len(), 7);

    let saved = assert_ok!(CheckpointStore::read_session(&orch.state_path()));
    assert_eq!(saved.next_pending_unit(), Some(7));

    // Second run resumes: only units 7..=9 reach the service.
    let second = ScriptedService::new();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(10),
        second.clone(),
    );
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let mut sink = MemorySink::default();
    let outcome = assert_ok!(orch.run(&options, &mut sink).await);

    assert_eq!(second.called_units(), vec![7, 8, 9]);
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.stats.skipped_units, 7);
    assert_eq!(outcome.stats.processed_units, 3);
    assert_eq!(outcome.summary.completed, 10);

    // Records from the first run come back from the journal.
    let units: Vec<usize> = sink.records.iter().map(|r| r.unit_index).collect();
    assert_eq!(units, (0..10).collect::<Vec<_>>());
    assert_eq!(outcome.summary.stats.api_calls, 10);
}

#[tokio::test]
async fn transient_errors_exhaust_the_attempt_budget() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).max_retries(3).build().unwrap();
    let service = ScriptedService::with_script([(
        0,
        vec![Err(transient()), Err(transient()), Err(transient()), Ok(one_task(0))],
    )]);
    let mut orch = orchestrator(config, FakeRenderer::new(1), service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(service.called_units(), vec![0, 0, 0]);
    let unit = &outcome.units[0];
    assert_eq!(unit.attempts, 3);
    assert!(matches!(
        unit.error,
        Some(UnitError::RetriesExhausted { unit: 0, attempts: 3, .. })
    ));
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(outcome.stats.api_errors, 3);
    assert!(outcome.summary.errors[&0].contains("after 3 attempts"));
    // Not finalized: the unit is still pending.
    assert!(outcome.state_path.to_string_lossy().ends_with(".state.json"));
}

#[tokio::test]
async fn transient_error_then_success_completes_the_unit() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).build().unwrap();
    let service = ScriptedService::with_script([(0, vec![Err(transient())])]);
    let mut orch = orchestrator(config, FakeRenderer::new(1), service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(outcome.units[0].attempts, 2);
    assert!(outcome.units[0].is_success());
    assert_eq!(outcome.records.len(), 1);
}

#[tokio::test]
async fn fatal_error_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).max_retries(5).build().unwrap();
    let service = ScriptedService::with_script([(
        1,
        vec![Err(ServiceError::Fatal {
            cause: "401 invalid api key".into(),
        })],
    )]);
    let mut orch = orchestrator(config, FakeRenderer::new(3), service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(service.prompts_for(1).len(), 1);
    assert!(matches!(
        outcome.units[1].error,
        Some(UnitError::ServiceRejected { unit: 1, .. })
    ));
    // The other units are unaffected.
    assert_eq!(outcome.summary.completed, 2);
    assert_eq!(outcome.records.len(), 2);
}

#[tokio::test]
async fn failed_unit_is_retried_on_resume() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::with_script([(
        1,
        vec![Err(ServiceError::Fatal {
            cause: "400 bad request".into(),
        })],
    )]);
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(3),
        service,
    );
    let first = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);
    assert_eq!(first.summary.failed, 1);

    let retry = ScriptedService::new();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(3),
        retry.clone(),
    );
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let mut sink = MemorySink::default();
    let second = assert_ok!(orch.run(&options, &mut sink).await);

    assert_eq!(retry.called_units(), vec![1]);
    assert_eq!(second.summary.failed, 0);
    assert!(second.summary.errors.is_empty());
    assert_eq!(sink.records.len(), 3);
}

#[tokio::test]
async fn changed_settings_abort_the_resume() {
    let dir = TempDir::new().unwrap();
    let partial = base_config(dir.path())
        .units(UnitSelection::Range(1, 2))
        .build()
        .unwrap();
    let mut orch = orchestrator(partial, FakeRenderer::new(4), ScriptedService::new());
    assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    let changed = base_config(dir.path()).model("gpt-4.1").build().unwrap();
    let service = ScriptedService::new();
    let mut orch = orchestrator(changed, FakeRenderer::new(4), service.clone());
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };

    let err = assert_err!(orch.run(&options, &mut MemorySink::default()).await);
    assert!(matches!(err, ExtractError::ConfigMismatch { .. }));
    assert_eq!(orch.state(), RunState::Aborted);
    assert!(service.called_units().is_empty());
}

#[tokio::test]
async fn scheduling_knobs_may_change_between_runs() {
    let dir = TempDir::new().unwrap();
    let partial = base_config(dir.path())
        .units(UnitSelection::Single(1))
        .build()
        .unwrap();
    let mut orch = orchestrator(partial, FakeRenderer::new(3), ScriptedService::new());
    assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    let retuned = base_config(dir.path())
        .concurrency(2)
        .max_retries(6)
        .min_request_interval(Duration::from_millis(1))
        .build()
        .unwrap();
    let service = ScriptedService::new();
    let mut orch = orchestrator(retuned, FakeRenderer::new(3), service.clone());
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);

    assert_eq!(service.called_units(), vec![1, 2]);
    assert_eq!(outcome.state, RunState::Completed);
}

#[tokio::test]
async fn existing_session_needs_resume_or_force() {
    let dir = TempDir::new().unwrap();
    let partial = base_config(dir.path())
        .units(UnitSelection::Range(1, 1))
        .build()
        .unwrap();
    let mut orch = orchestrator(partial.clone(), FakeRenderer::new(3), ScriptedService::new());
    assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    let mut orch = orchestrator(partial, FakeRenderer::new(3), ScriptedService::new());
    let err = assert_err!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);
    assert!(matches!(err, ExtractError::SessionExists { .. }));

    // --force discards the session: every unit is processed again.
    let service = ScriptedService::new();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(3),
        service.clone(),
    );
    let options = RunOptions {
        force: true,
        ..Default::default()
    };
    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);
    assert_eq!(service.called_units(), vec![0, 1, 2]);
    assert_eq!(outcome.stats.skipped_units, 0);
}

#[tokio::test]
async fn resume_without_saved_session_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::new();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(2),
        service.clone(),
    );
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);
    assert_eq!(service.called_units(), vec![0, 1]);
    assert_eq!(outcome.state, RunState::Completed);
}

#[tokio::test]
async fn corrupt_state_is_reported_on_resume() {
    let dir = TempDir::new().unwrap();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(2),
        ScriptedService::new(),
    );
    std::fs::write(orch.state_path(), b"{ not json").unwrap();

    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let err = assert_err!(orch.run(&options, &mut MemorySink::default()).await);
    assert!(matches!(err, ExtractError::CorruptState { .. }));
}

#[tokio::test]
async fn unparseable_reply_falls_back_to_simpler_prompt() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path()).build().unwrap();
    let service = ScriptedService::with_script([(
        0,
        vec![Ok("Sorry, I could not read this page.".to_string())],
    )]);
    let mut orch = orchestrator(config, FakeRenderer::new(1), service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(
        service.prompts_for(0),
        vec![
            DEFAULT_EXTRACTION_PROMPT.to_string(),
            FALLBACK_PROMPT.to_string()
        ]
    );
    assert!(outcome.units[0].is_success());
    assert_eq!(outcome.units[0].attempts, 2);
    assert_eq!(outcome.records.len(), 1);
}

#[tokio::test]
async fn unparseable_reply_without_fallback_fails_the_unit() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path())
        .fallback_prompt(false)
        .build()
        .unwrap();
    let service = ScriptedService::with_script([(0, vec![Ok("no json here".to_string())])]);
    let mut orch = orchestrator(config, FakeRenderer::new(1), service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(service.prompts_for(0).len(), 1);
    assert!(matches!(
        outcome.units[0].error,
        Some(UnitError::MalformedResponse { unit: 0, .. })
    ));
}

#[tokio::test]
async fn render_failure_fails_only_that_unit() {
    let dir = TempDir::new().unwrap();
    let renderer = Arc::new(FakeRenderer {
        units: 3,
        broken: vec![2],
    });
    let service = ScriptedService::new();
    let mut orch = orchestrator(base_config(dir.path()).build().unwrap(), renderer, service.clone());

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(service.called_units(), vec![0, 1]);
    assert!(matches!(
        outcome.units[2].error,
        Some(UnitError::RenderFailed { unit: 2, .. })
    ));
    assert_eq!(outcome.summary.failed, 1);
}

#[tokio::test]
async fn rejected_items_become_unit_warnings() {
    let dir = TempDir::new().unwrap();
    let reply = json!({
        "tasks": [
            {"task_number": "1", "task_text": "  2 + 3 = ?  ", "has_image": false},
            {"task_number": "2", "task_text": "   ", "has_image": false},
            {"task_number": "unknown", "task_text": "Draw a triangle.", "has_image": true}
        ],
        "page_info": {"total_tasks": 3, "section": "Geometry"}
    })
    .to_string();
    let service = ScriptedService::with_script([(0, vec![Ok(reply)])]);
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(1),
        service,
    );
    let mut sink = MemorySink::default();

    let outcome = assert_ok!(orch.run(&RunOptions::default(), &mut sink).await);

    assert_eq!(sink.records.len(), 2);
    assert_eq!(sink.records[0].text, "2 + 3 = ?");
    assert_eq!(sink.records[1].record_key, "unknown-1");
    assert!(sink.records[1].has_visual);
    assert_eq!(
        sink.records[1].provenance.get("page_info.section"),
        Some(&json!("Geometry"))
    );

    let warnings = &outcome.summary.warnings[&0];
    assert!(warnings.iter().any(|w| w.starts_with("rejected item 1:")));
    assert!(warnings.iter().any(|w| w == "expected 3 items but extracted 2"));
    assert_eq!(outcome.summary.stats.unknown_keys_generated, 1);
}

#[tokio::test]
async fn synthesized_keys_continue_across_resume() {
    let dir = TempDir::new().unwrap();
    let anonymous = |text: &str| {
        json!({"tasks": [{"task_number": null, "task_text": text, "has_image": false}]})
            .to_string()
    };

    let first = ScriptedService::with_script([(0, vec![Ok(anonymous("First page task."))])]);
    let partial = base_config(dir.path())
        .units(UnitSelection::Single(1))
        .build()
        .unwrap();
    let mut orch = orchestrator(partial, FakeRenderer::new(2), first);
    assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    let second = ScriptedService::with_script([(1, vec![Ok(anonymous("Second page task."))])]);
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(2),
        second,
    );
    let options = RunOptions {
        resume: true,
        ..Default::default()
    };
    let mut sink = MemorySink::default();
    assert_ok!(orch.run(&options, &mut sink).await);

    let keys: Vec<&str> = sink.records.iter().map(|r| r.record_key.as_str()).collect();
    assert_eq!(keys, vec!["unknown-1", "unknown-2"]);
}

#[tokio::test]
async fn empty_selection_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path())
        .units(UnitSelection::Range(20, 30))
        .build()
        .unwrap();
    let mut orch = orchestrator(config, FakeRenderer::new(5), ScriptedService::new());

    let err = assert_err!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);
    assert!(matches!(err, ExtractError::EmptySelection { total: 5 }));
    assert!(!orch.state_path().exists());
}

#[tokio::test]
async fn shutdown_during_backoff_leaves_the_unit_pending() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    let config = base_config(dir.path())
        .retry_base_delay(Duration::from_secs(3))
        .retry_max_delay(Duration::from_secs(3))
        .build()
        .unwrap();
    let service = ScriptedService::with_script([(0, vec![Err(transient()), Err(transient())])]);
    let mut orch = orchestrator(config, FakeRenderer::new(1), service.clone());
    let options = RunOptions {
        shutdown: shutdown.clone(),
        ..Default::default()
    };

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
    });
    let started = std::time::Instant::now();
    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);
    assert_ok!(trigger.await);

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "run waited out the backoff: {:?}",
        started.elapsed()
    );
    assert_eq!(outcome.state, RunState::Interrupted);
    assert_eq!(service.called_units(), vec![0]);
    assert_eq!(outcome.summary.failed, 0);
    assert!(outcome.summary.errors.is_empty());

    let saved = assert_ok!(CheckpointStore::read_session(&orch.state_path()));
    assert_eq!(saved.next_pending_unit(), Some(0));
}

#[tokio::test]
async fn fatal_reply_arriving_after_shutdown_is_recorded() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    let service = ScriptedService::stopping_with_script(
        shutdown.clone(),
        1,
        [(
            0,
            vec![Err(ServiceError::Fatal {
                cause: "401 invalid key".into(),
            })],
        )],
    );
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(3),
        service.clone(),
    );
    let options = RunOptions {
        shutdown,
        ..Default::default()
    };

    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);

    assert_eq!(outcome.state, RunState::Interrupted);
    assert_eq!(service.called_units(), vec![0]);
    assert_eq!(outcome.summary.failed, 1);
    assert!(outcome.summary.errors[&0].contains("401"));
    assert_eq!(outcome.units.len(), 1);
    assert!(matches!(
        outcome.units[0].error,
        Some(UnitError::ServiceRejected { unit: 0, .. })
    ));

    let saved = assert_ok!(CheckpointStore::read_session(&orch.state_path()));
    assert!(saved.errors[&0].contains("401"));
}

#[tokio::test]
async fn shutdown_before_start_leaves_everything_pending() {
    let dir = TempDir::new().unwrap();
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();
    let service = ScriptedService::new();
    let mut orch = orchestrator(
        base_config(dir.path()).build().unwrap(),
        FakeRenderer::new(3),
        service.clone(),
    );
    let options = RunOptions {
        shutdown,
        ..Default::default()
    };

    let outcome = assert_ok!(orch.run(&options, &mut MemorySink::default()).await);

    assert_eq!(outcome.state, RunState::Interrupted);
    assert!(service.called_units().is_empty());
    assert_eq!(outcome.summary.remaining, 3);
    assert!(orch.state_path().exists());
}

#[tokio::test]
async fn progress_callback_sees_every_unit() {
    let dir = TempDir::new().unwrap();
    let progress = Arc::new(CountingProgress::default());
    let config = base_config(dir.path())
        .concurrency(2)
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let service = ScriptedService::with_script([(
        3,
        vec![Err(ServiceError::Fatal {
            cause: "403 forbidden".into(),
        })],
    )]);
    let mut orch = orchestrator(config, FakeRenderer::new(5), service);

    assert_ok!(orch.run(&RunOptions::default(), &mut MemorySink::default()).await);

    assert_eq!(progress.started.load(Ordering::SeqCst), 5);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 4);
    assert_eq!(progress.errors.load(Ordering::SeqCst), 1);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 1);
}
