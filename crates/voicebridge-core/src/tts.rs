//! TTS collaborator: turns a text segment into frame-ready mu-law bytes.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;

/// Backend that synthesizes text to raw audio bytes. Returning an empty
/// buffer skips playback for that segment.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str) -> BridgeResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays. Useful for driving
/// the engine without an API key.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, _text: &str) -> BridgeResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Production TTS backend: Deepgram `/v1/speak`.
///
/// Requests `mulaw` at 8 kHz with no container, so the response body is
/// frame-ready for the pacer with no transcoding step.
#[derive(Debug, Clone)]
pub struct DeepgramTts {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: String,
    /// Voice model, e.g. aura-2-callista-en.
    pub model: String,
    client: reqwest::Client,
}

impl DeepgramTts {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.deepgram.com".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API host (tests, self-hosted deployments).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl TtsBackend for DeepgramTts {
    async fn synthesize(&self, text: &str) -> BridgeResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/speak", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[
                ("model", self.model.as_str()),
                ("encoding", "mulaw"),
                ("sample_rate", "8000"),
                ("container", "none"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| BridgeError::Tts(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Tts(format!("speak API {status}: {body}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
