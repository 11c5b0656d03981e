//! The remote speech-service boundary: transcription, reply generation, and
//! synthesis.
//!
//! [`SpeechService`] is the seam the turn pipeline depends on; tests inject
//! doubles, production uses [`HttpSpeechService`] over `reqwest`. A response
//! carrying an `error` field is a failure regardless of transport status;
//! empty expected fields (`transcript`, `choices`, `audios`) are soft
//! "no result" outcomes, never hard errors.

use crate::audio::RecordingClip;
use crate::error::{VoiceError, VoiceResult};
use crate::history::ChatMessage;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default deadline applied to each upstream call. A hung service must not
/// leave the conversation wedged in thinking or speaking forever.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-conversation speech parameters and fixed prompt material.
#[derive(Debug, Clone)]
pub struct SpeechOptions {
    /// Language for transcription and synthesis (e.g. "en-IN", "hi-IN").
    pub language_code: String,
    /// Synthesis voice.
    pub speaker: String,
    /// Speech-to-text model.
    pub stt_model: String,
    /// Reply-generation model.
    pub chat_model: String,
    /// Text-to-speech model.
    pub tts_model: String,
    /// Synthesis pace multiplier.
    pub pace: f32,
    /// Reply-generation sampling temperature.
    pub temperature: f32,
    /// Fixed identity preamble sent as the first system line.
    pub identity_prompt: String,
    /// Fixed brevity instruction appended to the preamble: replies are
    /// spoken aloud, so they must stay short.
    pub brevity_prompt: String,
    /// Spoken when the generator returns no usable reply.
    pub fallback_reply: String,
    /// How many recent turns to send as generator context (None = all).
    pub context_turns: Option<usize>,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            language_code: "en-IN".to_string(),
            speaker: "anushka".to_string(),
            stt_model: "saaras:v3".to_string(),
            chat_model: "sarvam-m".to_string(),
            tts_model: "bulbul:v3".to_string(),
            pace: 1.1,
            temperature: 0.7,
            identity_prompt: "You are Samvad, a helpful voice assistant.".to_string(),
            brevity_prompt: "Keep responses concise (2-3 sentences) since they will be \
                             spoken aloud. Respond in the same language the user speaks."
                .to_string(),
            fallback_reply: "Sorry, I could not generate a response.".to_string(),
            context_turns: None,
        }
    }
}

impl SpeechOptions {
    /// The full system prompt: identity plus brevity instruction.
    pub fn system_prompt(&self) -> String {
        format!("{}\n\n{}", self.identity_prompt, self.brevity_prompt)
    }
}

/// A transcription result.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub transcript: String,
    pub language_code: Option<String>,
    pub language_probability: Option<f32>,
}

/// The three remote operations one conversational turn depends on.
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Submit a completed clip for transcription.
    async fn transcribe(
        &self,
        clip: &RecordingClip,
        model: &str,
        language_code: &str,
    ) -> VoiceResult<Transcription>;

    /// Generate the assistant reply from the ordered message context.
    /// `Ok(None)` means the service produced no usable reply (soft failure).
    async fn generate_reply(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> VoiceResult<Option<String>>;

    /// Synthesize the reply. Returns decoded audio bytes; empty means the
    /// service produced no audio (soft failure, playback is skipped).
    async fn synthesize(
        &self,
        text: &str,
        target_language_code: &str,
        speaker: &str,
        pace: f32,
        model: &str,
    ) -> VoiceResult<Vec<u8>>;
}

// ── Wire format ──────────────────────────────────────────────────────────

/// Error payloads arrive either as `{"message": "..."}` objects or as bare
/// strings; anything else is reported verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ErrorBody {
    Message { message: String },
    Text(String),
    Other(serde_json::Value),
}

impl ErrorBody {
    pub(crate) fn message(&self) -> String {
        match self {
            Self::Message { message } => message.clone(),
            Self::Text(text) => text.clone(),
            Self::Other(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SttResponse {
    #[serde(default)]
    pub(crate) error: Option<ErrorBody>,
    #[serde(default)]
    pub(crate) transcript: Option<String>,
    #[serde(default)]
    pub(crate) language_code: Option<String>,
    #[serde(default)]
    pub(crate) language_probability: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub(crate) error: Option<ErrorBody>,
    #[serde(default)]
    pub(crate) choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub(crate) message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoiceMessage {
    #[serde(default)]
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TtsResponse {
    #[serde(default)]
    pub(crate) error: Option<ErrorBody>,
    #[serde(default)]
    pub(crate) audios: Vec<String>,
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// Production speech service over HTTP.
///
/// Talks either to the upstream API directly (set `api_key`) or through the
/// credential-injecting proxy (leave it unset). Every call carries an
/// explicit deadline.
#[derive(Debug, Clone)]
pub struct HttpSpeechService {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSpeechService {
    /// Create with the default per-call timeout.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> VoiceResult<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_CALL_TIMEOUT)
    }

    /// Create with an explicit per-call deadline.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    /// Build from environment: `SPEECH_API_URL` (default upstream),
    /// `SPEECH_API_KEY` (optional when behind the proxy).
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("SPEECH_API_URL")
            .unwrap_or_else(|_| "https://api.sarvam.ai".to_string());
        let api_key = std::env::var("SPEECH_API_KEY").ok();
        Self::new(base_url, api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.post(url);
        if let Some(ref key) = self.api_key {
            builder = builder.header("api-subscription-key", key);
        }
        builder
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        stage: &str,
        response: reqwest::Response,
    ) -> VoiceResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::upstream(stage, e.to_string()))?;
        serde_json::from_str(&body).map_err(|_| {
            VoiceError::upstream(stage, format!("unexpected response ({}): {}", status, body))
        })
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn transcribe(
        &self,
        clip: &RecordingClip,
        model: &str,
        language_code: &str,
    ) -> VoiceResult<Transcription> {
        debug!("transcribe: {} bytes ({})", clip.len(), clip.mime);
        let part = reqwest::multipart::Part::bytes(clip.bytes.clone())
            .file_name("voice.wav")
            .mime_str(&clip.mime)
            .map_err(|e| VoiceError::upstream("transcribe", e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string())
            .text("language_code", language_code.to_string());

        let response = self
            .post("/speech-to-text")
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::upstream("transcribe", e.to_string()))?;
        let body: SttResponse = Self::read_json("transcribe", response).await?;
        if let Some(error) = body.error {
            return Err(VoiceError::upstream("transcribe", error.message()));
        }
        Ok(Transcription {
            transcript: body.transcript.unwrap_or_default(),
            language_code: body.language_code,
            language_probability: body.language_probability,
        })
    }

    async fn generate_reply(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> VoiceResult<Option<String>> {
        debug!("generate: {} messages", messages.len());
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });
        let response = self
            .post("/v1/chat/completions")
            .json(&payload)
            .send()
            .await
            .map_err(|e| VoiceError::upstream("generate", e.to_string()))?;
        let body: ChatResponse = Self::read_json("generate", response).await?;
        if let Some(error) = body.error {
            return Err(VoiceError::upstream("generate", error.message()));
        }
        let reply = body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty());
        Ok(reply)
    }

    async fn synthesize(
        &self,
        text: &str,
        target_language_code: &str,
        speaker: &str,
        pace: f32,
        model: &str,
    ) -> VoiceResult<Vec<u8>> {
        debug!("synthesize: {} chars as {}", text.len(), speaker);
        let payload = serde_json::json!({
            "text": text,
            "target_language_code": target_language_code,
            "speaker": speaker,
            "pace": pace,
            "model": model,
        });
        let response = self
            .post("/text-to-speech")
            .json(&payload)
            .send()
            .await
            .map_err(|e| VoiceError::upstream("synthesize", e.to_string()))?;
        let body: TtsResponse = Self::read_json("synthesize", response).await?;
        if let Some(error) = body.error {
            return Err(VoiceError::upstream("synthesize", error.message()));
        }
        match body.audios.into_iter().next() {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| VoiceError::upstream("synthesize", format!("bad audio payload: {}", e))),
            None => Ok(Vec::new()),
        }
    }
}
