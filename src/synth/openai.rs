use reqwest::Client;
use serde::Serialize;

use crate::config::SynthesisConfig;
use crate::error::{RecitalError, Result};

use super::{Synthesizer, api_key, check_status, http_client, prepare_text};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini-tts";
const DEFAULT_VOICE: &str = "alloy";

/// OpenAI `/v1/audio/speech`, requesting raw 24 kHz PCM16 output.
pub struct OpenAiSynthesizer {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    voice: String,
    instruction: Option<String>,
    strip_markup: bool,
    max_chars: usize,
}

impl OpenAiSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let api_key = api_key(config, "OPENAI_API_KEY")?;
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/');

        Ok(Self {
            client: http_client(config)?,
            url: format!("{endpoint}/v1/audio/speech"),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: config
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            instruction: config.instruction.clone(),
            strip_markup: config.strip_markup,
            max_chars: config.max_request_chars,
        })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> SpeechRequest<'a> {
        SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "pcm",
            instructions: self.instruction.as_deref(),
        }
    }
}

impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        let text = prepare_text(text, self.strip_markup, self.max_chars);
        if text.is_empty() {
            return Ok(None);
        }

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&text))
            .send()
            .await
            .map_err(|e| RecitalError::Synthesis(format!("OpenAI API request failed: {e}")))?;

        let resp = check_status(resp, "OpenAI API").await?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RecitalError::Synthesis(format!("failed to read OpenAI response: {e}")))?;

        Ok((!bytes.is_empty()).then(|| bytes.to_vec()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}
