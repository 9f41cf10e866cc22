//! STT collaborator: a live transcription stream over the inbound call audio.
//!
//! The engine only consumes two signals: `Utterance` (interim text, used for
//! interruption length-filtering and nothing else) and `Transcript` (final
//! text, triggers a new completion). `DeepgramLive` is the production
//! backend; `PlaceholderStt` swallows audio for tests and keyless runs.

use crate::error::{BridgeError, BridgeResult};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Events emitted by the transcription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Interim recognition of in-progress speech.
    Utterance(String),
    /// Final transcription of a completed utterance.
    Transcript(String),
}

/// Handle for pushing raw call audio into a transcription stream.
pub trait SttStream: Send + Sync {
    /// Enqueue one decoded mu-law frame. Non-blocking.
    fn send_audio(&self, mulaw: Vec<u8>) -> BridgeResult<()>;

    /// Signal end of audio. Idempotent.
    fn close(&self);
}

/// Placeholder STT: accepts audio and never transcribes. The frame counter
/// lets tests assert that media reached the collaborator.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderStt {
    pub frames_received: Arc<AtomicUsize>,
}

impl SttStream for PlaceholderStt {
    fn send_audio(&self, _mulaw: Vec<u8>) -> BridgeResult<()> {
        self.frames_received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {}
}

enum LiveCommand {
    Audio(Vec<u8>),
    Close,
}

/// Configuration for the Deepgram live endpoint.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    /// Transcription model, e.g. nova-2.
    pub model: String,
}

/// Production STT backend: Deepgram live transcription over WebSocket.
///
/// Mu-law 8 kHz audio in (matching the transport's media frames verbatim),
/// JSON results out. Interim non-empty transcripts surface as `Utterance`;
/// finals accumulate until `speech_final`, or an `UtteranceEnd` for noisy
/// audio where the endpointing signal arrives late, then flush as one
/// `Transcript`.
pub struct DeepgramLive {
    tx: mpsc::UnboundedSender<LiveCommand>,
}

impl DeepgramLive {
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

    /// Open the live connection and spawn its writer/reader tasks. Events
    /// arrive on the returned channel until the far side closes.
    pub async fn connect(
        config: SttConfig,
    ) -> BridgeResult<(Self, mpsc::UnboundedReceiver<SttEvent>)> {
        let url = format!(
            "wss://api.deepgram.com/v1/listen?encoding=mulaw&sample_rate=8000&channels=1\
             &model={}&punctuate=true&interim_results=true&endpointing=200&utterance_end_ms=1000",
            config.model
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::Stt(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", config.api_key))
            .map_err(|e| BridgeError::Stt(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| BridgeError::Stt(format!("live connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let (tx, mut command_rx) = mpsc::unbounded_channel::<LiveCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SttEvent>();

        // Writer: forward audio, keep the connection alive while idle.
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(Self::KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(LiveCommand::Audio(bytes)) => {
                            if write.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Some(LiveCommand::Close) | None => {
                            let _ = write
                                .send(Message::Text(r#"{"type":"CloseStream"}"#.to_string()))
                                .await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        if write
                            .send(Message::Text(r#"{"type":"KeepAlive"}"#.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: parse live responses into engine events.
        tokio::spawn(async move {
            let mut finals: Vec<String> = Vec::new();
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if handle_live_message(&text, &mut finals, &event_tx).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("live transcription read failed: {e}");
                        break;
                    }
                }
            }
            debug!("live transcription stream ended");
        });

        Ok((Self { tx }, event_rx))
    }
}

impl SttStream for DeepgramLive {
    fn send_audio(&self, mulaw: Vec<u8>) -> BridgeResult<()> {
        self.tx
            .send(LiveCommand::Audio(mulaw))
            .map_err(|_| BridgeError::Stt("live connection is gone".to_string()))
    }

    fn close(&self) {
        let _ = self.tx.send(LiveCommand::Close);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum LiveResponse {
    Results {
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd,
    SpeechStarted,
    Metadata,
}

#[derive(Debug, Default, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<ResultsAlternative>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultsAlternative {
    #[serde(default)]
    transcript: String,
}

/// Returns Err only when the event receiver is gone (session torn down).
fn handle_live_message(
    text: &str,
    finals: &mut Vec<String>,
    events: &mpsc::UnboundedSender<SttEvent>,
) -> Result<(), ()> {
    let response: LiveResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            debug!("ignoring unrecognized live message: {e}");
            return Ok(());
        }
    };

    match response {
        LiveResponse::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let transcript = channel
                .alternatives
                .first()
                .map(|a| a.transcript.trim().to_string())
                .unwrap_or_default();
            if is_final {
                if !transcript.is_empty() {
                    finals.push(transcript);
                }
                if speech_final {
                    flush_finals(finals, events)?;
                }
            } else if !transcript.is_empty() {
                events
                    .send(SttEvent::Utterance(transcript))
                    .map_err(|_| ())?;
            }
        }
        LiveResponse::UtteranceEnd => flush_finals(finals, events)?,
        LiveResponse::SpeechStarted | LiveResponse::Metadata => {}
    }
    Ok(())
}

fn flush_finals(
    finals: &mut Vec<String>,
    events: &mpsc::UnboundedSender<SttEvent>,
) -> Result<(), ()> {
    if finals.is_empty() {
        return Ok(());
    }
    let transcript = finals.join(" ");
    finals.clear();
    events
        .send(SttEvent::Transcript(transcript))
        .map_err(|_| ())
}
