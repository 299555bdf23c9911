//! Configuration types for page-by-page record extraction.
//!
//! All run behaviour is controlled through [`ExtractionConfig`], built via
//! its [`ExtractionConfigBuilder`]. One struct keeps every knob shareable
//! across worker tasks and lets [`ExtractionConfig::fingerprint`] hash the
//! settings that decide *what* gets extracted, so a resumed session can
//! refuse to continue under different settings.

use crate::error::ExtractError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::schedule::RateLimitConfig;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an extraction run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2tasks::ExtractionConfig;
/// use std::time::Duration;
///
/// let config = ExtractionConfig::builder()
///     .concurrency(4)
///     .max_requests_per_window(50)
///     .rate_window(Duration::from_secs(60))
///     .checkpoint_every(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension in pixels. Default: 2048.
    pub max_rendered_pixels: u32,

    /// Maximum number of service calls in flight at once. Default: 4.
    ///
    /// Also the number of worker tasks: each worker carries one unit from
    /// render to checkpoint.
    pub concurrency: usize,

    /// Maximum calls that may *start* within any trailing `rate_window`. Default: 60.
    pub max_requests_per_window: usize,

    /// Length of the rolling rate window. Default: 60 s.
    pub rate_window: Duration,

    /// Fixed minimum gap between two consecutive call starts. Default: zero.
    ///
    /// Free-tier APIs sometimes throttle bursts even below their per-minute
    /// quota; set this to pace calls evenly.
    pub min_request_interval: Duration,

    /// Attempt ceiling per service call, the first attempt included. Default: 3.
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt. Default: 5 s.
    pub retry_base_delay: Duration,

    /// Upper bound for any single backoff delay. Default: 60 s.
    pub retry_max_delay: Duration,

    /// Per-call timeout in seconds. A timeout counts as a transient error. Default: 60.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// LLM model identifier, e.g. "gpt-4o". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per unit. Default: 4096.
    pub max_tokens: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom extraction prompt. If None, uses [`crate::prompts::DEFAULT_EXTRACTION_PROMPT`].
    pub system_prompt: Option<String>,

    /// Retry a unit once with [`crate::prompts::FALLBACK_PROMPT`] when its
    /// response is not parseable. Default: true.
    pub fallback_prompt: bool,

    /// Which units to process. Default: all.
    pub units: UnitSelection,

    /// Persist the session every K finished units. Default: 5.
    pub checkpoint_every: usize,

    /// Directory holding session state files. Default: `.pdf2tasks`.
    pub state_dir: PathBuf,

    /// Longest accepted record text, in characters. Default: 10 000.
    pub max_text_len: usize,

    /// Names of the fields in the raw service response.
    pub fields: FieldMap,

    /// Per-unit progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 2048,
            concurrency: 4,
            max_requests_per_window: 60,
            rate_window: Duration::from_secs(60),
            min_request_interval: Duration::ZERO,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(60),
            api_timeout_secs: 60,
            download_timeout_secs: 120,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            password: None,
            system_prompt: None,
            fallback_prompt: true,
            units: UnitSelection::default(),
            checkpoint_every: 5,
            state_dir: PathBuf::from(".pdf2tasks"),
            max_text_len: 10_000,
            fields: FieldMap::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_requests_per_window", &self.max_requests_per_window)
            .field("rate_window", &self.rate_window)
            .field("min_request_interval", &self.min_request_interval)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("fallback_prompt", &self.fallback_prompt)
            .field("units", &self.units)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("state_dir", &self.state_dir)
            .field("fields", &self.fields)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry policy derived from the retry knobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Scheduler limits derived from the concurrency and rate knobs.
    pub fn rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent: self.concurrency,
            max_requests_per_window: self.max_requests_per_window,
            window: self.rate_window,
            min_interval: self.min_request_interval,
        }
    }

    /// SHA-256 hex digest of the settings that shape extracted content.
    ///
    /// Concurrency, rate and retry settings are left out: changing them
    /// between runs does not change what a unit produces.
    pub fn fingerprint(&self) -> String {
        let material = FingerprintMaterial {
            dpi: self.dpi,
            max_rendered_pixels: self.max_rendered_pixels,
            model: self.model.as_deref(),
            provider_name: self.provider_name.as_deref(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.as_deref(),
            fallback_prompt: self.fallback_prompt,
            max_text_len: self.max_text_len,
            fields: &self.fields,
        };
        // Serialising a struct of plain fields cannot fail.
        let json = serde_json::to_vec(&material).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Serialize)]
struct FingerprintMaterial<'a> {
    dpi: u32,
    max_rendered_pixels: u32,
    model: Option<&'a str>,
    provider_name: Option<&'a str>,
    temperature: f32,
    max_tokens: usize,
    system_prompt: Option<&'a str>,
    fallback_prompt: bool,
    max_text_len: usize,
    fields: &'a FieldMap,
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_requests_per_window(mut self, n: usize) -> Self {
        self.config.max_requests_per_window = n.max(1);
        self
    }

    pub fn rate_window(mut self, window: Duration) -> Self {
        self.config.rate_window = window;
        self
    }

    pub fn min_request_interval(mut self, interval: Duration) -> Self {
        self.config.min_request_interval = interval;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.max(1);
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry_max_delay = delay;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn fallback_prompt(mut self, v: bool) -> Self {
        self.config.fallback_prompt = v;
        self
    }

    pub fn units(mut self, selection: UnitSelection) -> Self {
        self.config.units = selection;
        self
    }

    pub fn checkpoint_every(mut self, k: usize) -> Self {
        self.config.checkpoint_every = k.max(1);
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    pub fn max_text_len(mut self, n: usize) -> Self {
        self.config.max_text_len = n;
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        self.config.fields = fields;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(ExtractError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.rate_window.is_zero() {
            return Err(ExtractError::InvalidConfig(
                "Rate window must be longer than zero".into(),
            ));
        }
        if c.retry_max_delay < c.retry_base_delay {
            return Err(ExtractError::InvalidConfig(format!(
                "Max retry delay ({:?}) is shorter than the base delay ({:?})",
                c.retry_max_delay, c.retry_base_delay
            )));
        }
        if c.max_text_len == 0 {
            return Err(ExtractError::InvalidConfig(
                "Max text length must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Specifies which units (pages) of the input to process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitSelection {
    /// Process every unit (default).
    #[default]
    All,
    /// A single unit (1-indexed).
    Single(usize),
    /// A contiguous range (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific units (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl UnitSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed units.
    pub fn to_indices(&self, total_units: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            UnitSelection::All => (0..total_units).collect(),
            UnitSelection::Single(u) => {
                if *u >= 1 && *u <= total_units {
                    vec![u - 1]
                } else {
                    vec![]
                }
            }
            UnitSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_units);
                (s..e).collect()
            }
            UnitSelection::Set(units) => units
                .iter()
                .filter(|&&u| u >= 1 && u <= total_units)
                .map(|u| u - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Field names used in the raw service response.
///
/// The defaults match [`crate::prompts::DEFAULT_EXTRACTION_PROMPT`]:
///
/// ```json
/// {"tasks": [{"task_number": "1", "task_text": "…", "has_image": false, "confidence": 0.9}],
///  "page_info": {"total_tasks": 1}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    /// Array of raw items.
    pub items: String,
    /// Item identifier → `record_key`.
    pub key: String,
    /// Item text → `text`.
    pub text: String,
    /// Item illustration flag → `has_visual`.
    pub visual: String,
    /// Optional item confidence → `confidence`.
    pub confidence: String,
    /// Optional response-level info object.
    pub info: String,
    /// Key inside `info` declaring how many items the service saw.
    pub expected_count: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            items: "tasks".into(),
            key: "task_number".into(),
            text: "task_text".into(),
            visual: "has_image".into(),
            confidence: "confidence".into(),
            info: "page_info".into(),
            expected_count: "total_tasks".into(),
        }
    }
}
