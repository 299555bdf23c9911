//! The external analysis service: one rendered unit in, raw text out.
//!
//! [`AnalysisService`] is the seam the orchestrator calls through.
//! [`VisionService`] implements it over any `edgequake-llm` provider and
//! translates every transport failure into [`ServiceError`] via
//! [`classify`], so the retry executor never sees provider-specific errors.

use crate::config::ExtractionConfig;
use crate::error::{ExtractError, ServiceError};
use crate::pipeline::encode;
use crate::pipeline::retry::classify;
use crate::prompts::unit_prompt;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Raw reply from one service call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Analyses one rendered unit.
pub trait AnalysisService: Send + Sync {
    fn call<'a>(
        &'a self,
        rendered: &'a [u8],
        unit: usize,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<ServiceResponse, ServiceError>>;
}

/// Vision-language model behind an `edgequake-llm` provider.
pub struct VisionService {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    timeout: Duration,
}

impl VisionService {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }
}

impl AnalysisService for VisionService {
    fn call<'a>(
        &'a self,
        rendered: &'a [u8],
        unit: usize,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<ServiceResponse, ServiceError>> {
        async move {
            let user_text = unit_prompt(unit + 1);
            let messages = vec![
                ChatMessage::system(prompt),
                ChatMessage::user_with_images(&user_text, vec![encode::to_image_data(rendered)]),
            ];

            let reply = tokio::time::timeout(
                self.timeout,
                self.provider.chat(&messages, Some(&self.options)),
            )
            .await
            .map_err(|_| ServiceError::Transient {
                cause: format!("request timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| classify(&e.to_string()))?;

            debug!(
                unit,
                input_tokens = reply.prompt_tokens,
                output_tokens = reply.completion_tokens,
                "service call returned"
            );
            Ok(ServiceResponse {
                content: reply.content,
                input_tokens: reply.prompt_tokens as u64,
                output_tokens: reply.completion_tokens as u64,
            })
        }
        .boxed()
    }
}

fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Pick the LLM provider, most specific source first:
///
/// 1. `config.provider`, a pre-built provider
/// 2. `config.provider_name` (+ `config.model`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env` auto-detection
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(provider), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !provider.is_empty() && !env_model.is_empty() {
            return create_provider(&provider, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|key| !key.is_empty()) {
        return create_provider("openai", model);
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from the environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or GEMINI_API_KEY, or pass --provider.\n\
                 Error: {e}"
            ),
        })?;
    Ok(provider)
}
