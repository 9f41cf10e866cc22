//! # Voicebridge Core
//!
//! Ordered real-time audio delivery and turn-taking for a half-duplex voice
//! conversation over a media-stream WebSocket. Synthesized speech segments
//! arrive out of order and at unpredictable latency; this crate reassembles
//! them, paces them onto the wire as fixed 20 ms mu-law frames, tracks
//! playback completion marks, and flushes undelivered audio the moment the
//! caller talks over the agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Session loop                         │
//! │  ┌───────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ STT live  │ → │ Conversation │ → │ TTS fan-out (async,  │  │
//! │  │  stream   │   │    driver    │   │ completes unordered) │  │
//! │  └───────────┘   └──────────────┘   └──────────┬───────────┘  │
//! │        │                                       ↓              │
//! │        │          ┌──────────────┐   ┌──────────────────┐     │
//! │        └────────→ │ Turn monitor │   │ Reassembly buffer│     │
//! │    (interruption) └──────┬───────┘   └────────┬─────────┘     │
//! │                          ↓ clear              ↓ in order      │
//! │                   ┌──────────────────────────────────┐        │
//! │                   │ Frame pacer (160 B / 20 ms, mark)│        │
//! │                   └──────────────────────────────────┘        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The gateway crate owns the HTTP/WebSocket surface; everything here is
//! transport-channel in, transport-channel out.

pub mod config;
pub mod driver;
pub mod error;
pub mod llm;
pub mod pacer;
pub mod segment;
pub mod session;
pub mod stt;
pub mod transport;
pub mod tts;
pub mod turn;

pub use config::{BridgeConfig, LlmSettings};
pub use driver::{
    repair_function_args, spawn_driver, ConversationDriver, TextSegment, Tool, ToolRegistry,
    SEGMENT_BOUNDARY,
};
pub use error::{BridgeError, BridgeResult};
pub use llm::{ChatTurn, CompletionEvent, FunctionCall, LlmBackend, OpenAiChat, ToolSpec};
pub use pacer::{spawn_playout, FlushHandle, FramePacer};
pub use segment::{ReassemblyBuffer, Segment};
pub use session::{
    spawn_session, spawn_synthesis, Session, SessionConfig, SessionEvent, SessionRuntime,
};
pub use stt::{DeepgramLive, PlaceholderStt, SttConfig, SttEvent, SttStream};
pub use transport::{
    InboundMessage, MarkFrame, MediaPayload, OutboundMessage, StartFrame, TransportSink,
    FRAME_BYTES, FRAME_DURATION,
};
pub use tts::{DeepgramTts, PlaceholderTts, TtsBackend};
pub use turn::{TurnConfig, TurnMonitor};
