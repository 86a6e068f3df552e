pub mod gemini;
pub mod openai;

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::config::SynthesisConfig;
use crate::error::{RecitalError, Result};

/// Markup characters dropped from request text.
const MARKUP: [char; 2] = ['*', '#'];

/// The remote speech-synthesis boundary.
///
/// `Ok(None)` means there was nothing to synthesize for this text; it is not an
/// error. `Err(RecitalError::Decode(_))` means a response arrived but its
/// payload was unusable. Any other error is a transport failure.
pub trait Synthesizer: Send + Sync + 'static {
    fn synthesize(&self, text: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
    fn name(&self) -> &str;
}

/// Clean up chunk text before it is sent: trim, optionally strip markup, and
/// cap the length at `max_chars` characters.
#[must_use]
pub fn prepare_text(text: &str, strip_markup: bool, max_chars: usize) -> String {
    let trimmed = text.trim();
    let cleaned: String = if strip_markup {
        trimmed.chars().filter(|c| !MARKUP.contains(c)).collect()
    } else {
        trimmed.to_string()
    };

    match cleaned.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            tracing::warn!(
                "request text truncated to {max_chars} characters ({} total)",
                cleaned.chars().count()
            );
            cleaned[..cut].to_string()
        }
        None => cleaned,
    }
}

fn http_client(config: &SynthesisConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| RecitalError::Synthesis(format!("failed to build HTTP client: {e}")))
}

fn api_key(config: &SynthesisConfig, env_var: &str) -> Result<String> {
    config
        .api_key
        .clone()
        .or_else(|| std::env::var(env_var).ok())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            RecitalError::Config(format!(
                "{} backend requires synthesis.api_key or {env_var} to be set",
                config.backend
            ))
        })
}

/// Turn a non-success HTTP response into a synthesis error.
async fn check_status(resp: Response, service: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let hint = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            " (check synthesis.api_key and synthesis.model)"
        }
        _ => "",
    };

    Err(RecitalError::Synthesis(format!(
        "{service} returned {status}{hint}: {body}"
    )))
}

/// A configured synthesis backend.
pub enum SynthBackend {
    Gemini(gemini::GeminiSynthesizer),
    OpenAi(openai::OpenAiSynthesizer),
}

impl Synthesizer for SynthBackend {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Gemini(s) => s.synthesize(text).await,
            Self::OpenAi(s) => s.synthesize(text).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Gemini(s) => s.name(),
            Self::OpenAi(s) => s.name(),
        }
    }
}

/// Create a synthesis backend based on the config backend name.
pub fn create_backend(config: &SynthesisConfig) -> Result<SynthBackend> {
    match config.backend.as_str() {
        "gemini" => Ok(SynthBackend::Gemini(gemini::GeminiSynthesizer::new(config)?)),
        "openai" => Ok(SynthBackend::OpenAi(openai::OpenAiSynthesizer::new(config)?)),
        other => Err(RecitalError::Config(format!(
            "unknown synthesis backend: {other} (available: gemini, openai)"
        ))),
    }
}
