//! Twilio Media Streams wire protocol: typed inbound/outbound messages and
//! the outbound sink.
//!
//! Inbound control messages arrive as JSON text frames tagged by `event`
//! (`connected`, `start`, `media`, `mark`, `stop`). Outbound messages carry
//! the `streamSid` learned from the `start` event; sends before the sid is
//! known are no-ops, never errors.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// One frame is 20 ms of 8 kHz mu-law: the transport's required slice size.
pub const FRAME_BYTES: usize = 160;

/// Real-time playback duration of a single frame. Fixed by the protocol,
/// not tunable.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Metadata delivered with the `start` event.
#[derive(Debug, Clone, Deserialize)]
pub struct StartFrame {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
}

/// Base64 media payload, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaPayload {
    pub payload: String,
}

/// Named playback-completion mark, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkFrame {
    pub name: String,
}

/// Control messages received from the media stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Handshake banner sent before `start`; carries no session state.
    Connected,
    Start { start: StartFrame },
    Media { media: MediaPayload },
    /// The far end finished playing the named mark's audio.
    Mark { mark: MarkFrame },
    Stop,
}

/// Messages sent to the media stream.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMessage {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkFrame,
    },
    /// Instructs the far end to discard all buffered, unplayed audio.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Handle for sending outbound messages to one connection's writer task.
///
/// Cheap to clone. Every send is silently dropped until `set_stream_sid` is
/// called with the sid from the `start` event, and again once the writer has
/// gone away during teardown.
#[derive(Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    stream_sid: Arc<Mutex<Option<String>>>,
}

impl TransportSink {
    /// Create a sink and the receiver its writer task consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                stream_sid: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }

    /// Record the stream sid from the `start` event; enables sending.
    pub fn set_stream_sid(&self, sid: impl Into<String>) {
        if let Ok(mut guard) = self.stream_sid.lock() {
            *guard = Some(sid.into());
        }
    }

    /// Whether a stream sid has been recorded yet.
    pub fn is_ready(&self) -> bool {
        self.stream_sid
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    fn sid(&self) -> Option<String> {
        self.stream_sid.lock().ok().and_then(|g| g.clone())
    }

    fn send(&self, message: OutboundMessage) {
        // A closed channel means the connection is tearing down; scheduled
        // frames are abandoned silently.
        if self.tx.send(message).is_err() {
            trace!("outbound channel closed, dropping message");
        }
    }

    /// Send one base64-encoded audio frame.
    pub fn send_media(&self, payload: String) {
        let Some(stream_sid) = self.sid() else { return };
        self.send(OutboundMessage::Media {
            stream_sid,
            media: MediaPayload { payload },
        });
    }

    /// Send an end-of-utterance mark.
    pub fn send_mark(&self, name: &str) {
        let Some(stream_sid) = self.sid() else { return };
        self.send(OutboundMessage::Mark {
            stream_sid,
            mark: MarkFrame {
                name: name.to_string(),
            },
        });
    }

    /// Send a clear signal, flushing the far end's buffered audio.
    pub fn send_clear(&self) {
        let Some(stream_sid) = self.sid() else { return };
        self.send(OutboundMessage::Clear { stream_sid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event() {
        let raw = r#"{"event":"start","sequenceNumber":"1","start":{"accountSid":"AC1","streamSid":"MZ123","callSid":"CA456","tracks":["inbound"]},"streamSid":"MZ123"}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Start { start } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_mark_and_stop() {
        let media: InboundMessage =
            serde_json::from_str(r#"{"event":"media","media":{"payload":"AAAA"}}"#).unwrap();
        assert!(matches!(media, InboundMessage::Media { .. }));

        let mark: InboundMessage = serde_json::from_str(
            r#"{"event":"mark","sequenceNumber":"4","mark":{"name":"abc"},"streamSid":"MZ1"}"#,
        )
        .unwrap();
        match mark {
            InboundMessage::Mark { mark } => assert_eq!(mark.name, "abc"),
            other => panic!("expected mark, got {other:?}"),
        }

        let stop: InboundMessage =
            serde_json::from_str(r#"{"event":"stop","streamSid":"MZ1"}"#).unwrap();
        assert!(matches!(stop, InboundMessage::Stop));
    }

    #[test]
    fn malformed_inbound_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<InboundMessage>(r#"{"event":"dance"}"#).is_err());
        assert!(serde_json::from_str::<InboundMessage>("not json").is_err());
    }

    #[test]
    fn outbound_media_shape_matches_the_wire_format() {
        let msg = OutboundMessage::Media {
            stream_sid: "MZ123".to_string(),
            media: MediaPayload {
                payload: "QUJD".to_string(),
            },
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        assert_eq!(value["media"]["payload"], "QUJD");
    }

    #[test]
    fn sends_before_stream_sid_are_no_ops() {
        let (sink, mut rx) = TransportSink::new();
        sink.send_media("QUJD".to_string());
        sink.send_mark("m1");
        sink.send_clear();
        assert!(rx.try_recv().is_err());

        sink.set_stream_sid("MZ123");
        sink.send_clear();
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::Clear {
                stream_sid: "MZ123".to_string()
            }
        );
    }
}
