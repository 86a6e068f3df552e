use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::SynthesisConfig;
use crate::error::{RecitalError, Result};

use super::{Synthesizer, api_key, check_status, http_client, prepare_text};

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-tts";
const DEFAULT_VOICE: &str = "Kore";

/// Gemini text-to-speech over the `generateContent` REST API.
///
/// Audio comes back as base64 inline data holding raw 24kHz mono 16-bit PCM.
pub struct GeminiSynthesizer {
    client: Client,
    url: String,
    api_key: String,
    voice: String,
    instruction: Option<String>,
    strip_markup: bool,
    max_chars: usize,
}

impl GeminiSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let api_key = api_key(config, "GEMINI_API_KEY")?;
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/');
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

        Ok(Self {
            client: http_client(config)?,
            url: format!("{endpoint}/v1beta/models/{model}:generateContent"),
            api_key,
            voice: config
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            instruction: config.instruction.clone(),
            strip_markup: config.strip_markup,
            max_chars: config.max_request_chars,
        })
    }

    fn request_body(&self, text: &str) -> GenerateRequest {
        let prompt = match self.instruction.as_deref() {
            Some(instruction) => format!("{instruction} {text}"),
            None => text.to_string(),
        };

        GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![TextPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
        }
    }
}

impl Synthesizer for GeminiSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        let text = prepare_text(text, self.strip_markup, self.max_chars);
        if text.is_empty() {
            return Ok(None);
        }

        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(&text))
            .send()
            .await
            .map_err(|e| RecitalError::Synthesis(format!("Gemini API request failed: {e}")))?;

        let resp = check_status(resp, "Gemini API").await?;

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| RecitalError::Synthesis(format!("failed to parse Gemini response: {e}")))?;

        extract_audio(body)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

fn extract_audio(body: GenerateResponse) -> Result<Option<Vec<u8>>> {
    let inline = body
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| p.inline_data);

    let Some(inline) = inline else {
        return Ok(None);
    };

    if let Some(mime) = inline.mime_type.as_deref() {
        tracing::debug!("Gemini audio payload: {mime}");
    }

    let bytes = STANDARD
        .decode(inline.data.as_bytes())
        .map_err(|e| RecitalError::Decode(format!("invalid base64 audio payload: {e}")))?;

    Ok((!bytes.is_empty()).then_some(bytes))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent {
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: String,
    mime_type: Option<String>,
}
