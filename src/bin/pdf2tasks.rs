//! CLI binary for edgequake-pdf2tasks.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` / `RunOptions` and prints the session report.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2tasks::pipeline::input;
use edgequake_pdf2tasks::{
    extract, CheckpointStore, ExtractError, ExtractionConfig, ExtractionProgressCallback,
    ProgressCallback, RunOptions, RunState, ShutdownSignal, UnitSelection,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out
/// of order when concurrency > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_run_start` tells us how many pages are pending.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, pending: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(pending as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, unit_num: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&unit_num)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, pending_units: usize, already_done: usize) {
        self.activate_bar(pending_units);
        let resumed = if already_done > 0 {
            format!(" ({already_done} already done)")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "{} {}{}",
            cyan("◆"),
            bold(&format!("Extracting tasks from {pending_units} pages…")),
            dim(&resumed)
        ));
    }

    fn on_unit_start(&self, unit_num: usize, _total_units: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit_num, Instant::now());
        self.bar.set_message(format!("page {unit_num}"));
    }

    fn on_unit_complete(&self, unit_num: usize, total_units: usize, records: usize) {
        let secs = self.elapsed_secs(unit_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            unit_num,
            total_units,
            dim(&format!("{records:>3} tasks")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, unit_num: usize, total_units: usize, error: &str) {
        let secs = self.elapsed_secs(unit_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            unit_num,
            total_units,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, completed: usize, failed: usize, interrupted: bool) {
        self.bar.finish_and_clear();
        let mark = if interrupted {
            yellow("⏸")
        } else if failed == 0 {
            green("✔")
        } else if completed == 0 {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {} pages extracted, {} failed{}",
            mark,
            bold(&completed.to_string()),
            if failed > 0 {
                red(&failed.to_string())
            } else {
                failed.to_string()
            },
            if interrupted {
                "  (interrupted, run again with --resume)"
            } else {
                ""
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every task into JSON Lines
  pdf2tasks workbook.pdf -o tasks.jsonl

  # CSV output, pages 10-40 only
  pdf2tasks workbook.pdf -o tasks.csv --start 10 --end 40

  # Continue an interrupted run
  pdf2tasks workbook.pdf -o tasks.jsonl --resume

  # Throw away the saved session and start over
  pdf2tasks workbook.pdf -o tasks.jsonl --force

  # Free-tier pacing: 15 requests per minute, one at a time
  pdf2tasks workbook.pdf --concurrency 1 --rpm 15 --min-interval-ms 4000

  # Show the saved session without running anything
  pdf2tasks workbook.pdf --status

RESUMING:
  Progress is saved to <state-dir>/<sha256 of the PDF>.state.json every
  --checkpoint-every pages and on Ctrl-C. Re-run with --resume to skip the
  pages already done; failed pages are tried again. Changing the model,
  prompt, DPI or other extraction settings makes the saved session
  incompatible; use --force to discard it. Concurrency, rate and retry
  flags may change freely between runs.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Extract numbered tasks from PDF workbooks using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2tasks",
    version,
    about = "Extract numbered tasks from PDF workbooks using Vision LLMs",
    long_about = "Render each page of a PDF (local file or URL), ask a Vision Language Model \
for every exercise on it, and write the normalized records as JSON Lines or CSV. Runs are \
checkpointed and can be resumed after a crash or Ctrl-C.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Output file; `.csv` selects CSV, anything else JSON Lines.
    /// Default: <input stem>.tasks.jsonl
    #[arg(short, long, env = "PDF2TASKS_OUTPUT")]
    output: Option<PathBuf>,

    /// Continue the saved session for this PDF.
    #[arg(long, conflicts_with = "force")]
    resume: bool,

    /// Discard any saved session for this PDF and start over.
    #[arg(long)]
    force: bool,

    /// Print the saved session report and exit.
    #[arg(long, conflicts_with_all = ["resume", "force"])]
    status: bool,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDF2TASKS_PAGES", conflicts_with_all = ["start", "end"])]
    pages: Option<String>,

    /// First page to process (1-indexed).
    #[arg(long)]
    start: Option<usize>,

    /// Last page to process (1-indexed, inclusive).
    #[arg(long)]
    end: Option<usize>,

    /// Maximum concurrent VLM calls.
    #[arg(short, long, env = "PDF2TASKS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Maximum calls started per rate window.
    #[arg(long, env = "PDF2TASKS_RPM", default_value_t = 60)]
    rpm: usize,

    /// Rate window length in seconds.
    #[arg(long, env = "PDF2TASKS_WINDOW_SECS", default_value_t = 60)]
    window_secs: u64,

    /// Minimum gap between two call starts, in milliseconds.
    #[arg(long, env = "PDF2TASKS_MIN_INTERVAL_MS", default_value_t = 0)]
    min_interval_ms: u64,

    /// Attempts per call, the first one included.
    #[arg(long, env = "PDF2TASKS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// First backoff delay in milliseconds; doubles per attempt.
    #[arg(long, env = "PDF2TASKS_RETRY_DELAY_MS", default_value_t = 5_000)]
    retry_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[arg(long, env = "PDF2TASKS_MAX_RETRY_DELAY_MS", default_value_t = 60_000)]
    max_retry_delay_ms: u64,

    /// Save the session every N finished pages.
    #[arg(long, env = "PDF2TASKS_CHECKPOINT_EVERY", default_value_t = 5)]
    checkpoint_every: usize,

    /// Directory for session state files.
    #[arg(long, env = "PDF2TASKS_STATE_DIR", default_value = ".pdf2tasks")]
    state_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2TASKS_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TASKS_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom extraction prompt.
    #[arg(long, env = "PDF2TASKS_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Do not retry unparseable replies with the simpler fallback prompt.
    #[arg(long)]
    no_fallback: bool,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PDF2TASKS_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2TASKS_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2TASKS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PDF2TASKS_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Print the session summary as JSON instead of the text report.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2TASKS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TASKS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TASKS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; -v brings them back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.status;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if cli.status {
        return print_status(&cli).await;
    }

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&cli.input));

    let shutdown = ShutdownSignal::new();
    let ctrl_c = shutdown.listen_for_ctrl_c();
    let options = RunOptions {
        resume: cli.resume,
        force: cli.force,
        shutdown,
    };

    let result = extract(&cli.input, &output, &config, &options).await;
    ctrl_c.abort();

    let outcome = result.context("Extraction failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&outcome.summary)
            .context("Failed to serialise session summary")?;
        println!("{json}");
    } else if !cli.quiet {
        eprint!("{}", outcome.summary.render_report());
        eprintln!(
            "{}  {} records  →  {}",
            if outcome.stats.failed_units == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            outcome.records.len(),
            bold(&output.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out  —  {}ms  ({})",
            dim(&outcome.stats.input_tokens.to_string()),
            dim(&outcome.stats.output_tokens.to_string()),
            outcome.stats.total_duration_ms,
            dim(&outcome.state_path.display().to_string()),
        );
    }

    if outcome.state == RunState::Interrupted {
        std::process::exit(130);
    }
    Ok(())
}

/// `--status`: read the saved session for this input without touching it.
async fn print_status(cli: &Cli) -> Result<()> {
    let resolved = input::resolve_input(&cli.input, cli.download_timeout)
        .await
        .context("Failed to resolve input")?;
    let hash = input::content_hash(resolved.path()).await?;
    let path = CheckpointStore::state_path(&cli.state_dir, &hash);

    let session = match CheckpointStore::read_session(&path) {
        Ok(session) => session,
        Err(ExtractError::NoSession { .. }) => {
            let completed = PathBuf::from(format!(
                "{}{}",
                path.display(),
                edgequake_pdf2tasks::checkpoint::COMPLETED_SUFFIX
            ));
            if completed.exists() {
                CheckpointStore::read_session(&completed)?
            } else {
                eprintln!("No saved session for {} in {}", cli.input, cli.state_dir.display());
                return Ok(());
            }
        }
        Err(e) => return Err(e).context("Failed to read session"),
    };

    let summary = session.summary();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render_report());
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let units = match (&cli.pages, cli.start, cli.end) {
        (Some(pages), _, _) => parse_pages(pages)?,
        (None, None, None) => UnitSelection::All,
        (None, start, end) => {
            let start = start.unwrap_or(1);
            let end = end.unwrap_or(usize::MAX);
            if start < 1 {
                anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {start})");
            }
            if start > end {
                anyhow::bail!("--start {start} is after --end {end}");
            }
            UnitSelection::Range(start, end)
        }
    };

    let mut builder = ExtractionConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .max_requests_per_window(cli.rpm)
        .rate_window(Duration::from_secs(cli.window_secs))
        .min_request_interval(Duration::from_millis(cli.min_interval_ms))
        .max_retries(cli.max_retries)
        .retry_base_delay(Duration::from_millis(cli.retry_delay_ms))
        .retry_max_delay(Duration::from_millis(cli.max_retry_delay_ms))
        .checkpoint_every(cli.checkpoint_every)
        .state_dir(&cli.state_dir)
        .fallback_prompt(!cli.no_fallback)
        .units(units)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;

    config.model = cli.model.clone();
    config.provider_name = cli.provider.clone();
    config.password = cli.password.clone();
    config.system_prompt = system_prompt;

    Ok(config)
}

/// `workbook.pdf` → `workbook.tasks.jsonl`; URLs use their last path segment.
fn default_output_path(input: &str) -> PathBuf {
    let name = input
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("output");
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("output");
    PathBuf::from(format!("{stem}.tasks.jsonl"))
}

/// Parse `--pages` string into `UnitSelection`.
fn parse_pages(s: &str) -> Result<UnitSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(UnitSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(UnitSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .context(format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(UnitSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(UnitSelection::Single(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pages_forms() {
        assert_eq!(parse_pages("all").unwrap(), UnitSelection::All);
        assert_eq!(parse_pages("5").unwrap(), UnitSelection::Single(5));
        assert_eq!(parse_pages("3-15").unwrap(), UnitSelection::Range(3, 15));
        assert_eq!(
            parse_pages("1, 3,5").unwrap(),
            UnitSelection::Set(vec![1, 3, 5])
        );
        assert!(parse_pages("0").is_err());
        assert!(parse_pages("9-2").is_err());
        assert!(parse_pages("x").is_err());
    }

    #[test]
    fn default_output_follows_input_name() {
        assert_eq!(
            default_output_path("books/algebra.pdf"),
            PathBuf::from("algebra.tasks.jsonl")
        );
        assert_eq!(
            default_output_path("https://example.com/files/geometry.pdf"),
            PathBuf::from("geometry.tasks.jsonl")
        );
    }
}
