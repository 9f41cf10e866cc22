//! Environment-driven configuration for the gateway and collaborators.
//!
//! Everything is plain env vars with sane defaults, resolved once at startup.
//! The binary loads `.env` via dotenvy before calling `BridgeConfig::from_env`.

use crate::error::{BridgeError, BridgeResult};
use crate::turn::TurnConfig;

const DEFAULT_GREETING: &str =
    "Hi! Thanks for taking the call. How are you today?";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an upbeat yet professional AI assistant on a phone call. \
Keep responses concise and courteous, one or two sentences at a time, and ask \
only one question at a time. If anything is ambiguous, ask for clarification. \
Add a \u{2022} symbol every 5 to 10 words at natural pauses where your \
response can be split for text to speech.";

/// Settings for the OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Chat model id.
    pub model: String,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP port the gateway listens on (`PORT`, default 3000).
    pub port: u16,
    /// Public hostname used in the TwiML stream URL (`SERVER`).
    pub public_host: String,
    /// Spoken as soon as the media stream starts (`GREETING_TEXT`).
    pub greeting: String,
    /// System prompt for the conversation driver (`SYSTEM_PROMPT`).
    pub system_prompt: String,
    pub llm: LlmSettings,
    /// Deepgram key shared by the STT and TTS collaborators (`DEEPGRAM_API_KEY`).
    pub deepgram_api_key: String,
    /// Deepgram TTS voice model (`DEEPGRAM_TTS_MODEL`).
    pub tts_model: String,
    /// Deepgram live transcription model (`DEEPGRAM_STT_MODEL`).
    pub stt_model: String,
    pub turn: TurnConfig,
}

impl BridgeConfig {
    /// Build from environment. Fails only on missing API keys; everything
    /// else falls back to a default.
    pub fn from_env() -> BridgeResult<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let public_host = std::env::var("SERVER")
            .map_err(|_| BridgeError::Config("SERVER (public hostname) is not set".to_string()))?;
        let greeting = std::env::var("GREETING_TEXT")
            .unwrap_or_else(|_| DEFAULT_GREETING.to_string());
        let system_prompt = std::env::var("SYSTEM_PROMPT")
            .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        let llm = LlmSettings {
            base_url: std::env::var("LLM_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .map_err(|_| {
                    BridgeError::Config("LLM requires LLM_API_KEY or OPENAI_API_KEY".to_string())
                })?,
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
        };

        let deepgram_api_key = std::env::var("DEEPGRAM_API_KEY")
            .map_err(|_| BridgeError::Config("DEEPGRAM_API_KEY is not set".to_string()))?;
        let tts_model = std::env::var("DEEPGRAM_TTS_MODEL")
            .unwrap_or_else(|_| "aura-2-callista-en".to_string());
        let stt_model = std::env::var("DEEPGRAM_STT_MODEL")
            .unwrap_or_else(|_| "nova-2".to_string());

        let turn = match std::env::var("INTERRUPT_MIN_CHARS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            Some(min_utterance_chars) => TurnConfig {
                min_utterance_chars,
            },
            None => TurnConfig::default(),
        };

        Ok(Self {
            port,
            public_host,
            greeting,
            system_prompt,
            llm,
            deepgram_api_key,
            tts_model,
            stt_model,
            turn,
        })
    }
}
