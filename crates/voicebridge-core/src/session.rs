//! Per-connection session: the single event loop that owns the engine state.
//!
//! Every mutation of the reassembly buffer, the outstanding-mark set, and the
//! flush generation happens here, at the one point where the session's typed
//! messages are consumed. Collaborators run in their own tasks and only talk
//! to the session through its mailbox.
//!
//! ```text
//! ws reader ──┐                             ┌── playout task ── transport
//! stt reader ─┼──> SessionEvent mailbox ────┤
//! synthesis ──┘         (this loop)         └── driver mailbox ── llm/tools
//! ```

use crate::config::BridgeConfig;
use crate::driver::{spawn_driver, ConversationDriver, TextSegment, ToolRegistry};
use crate::llm::{LlmBackend, ToolSpec};
use crate::pacer::{spawn_playout, FlushHandle, FramePacer};
use crate::segment::{ReassemblyBuffer, Segment};
use crate::stt::{SttEvent, SttStream};
use crate::transport::{InboundMessage, OutboundMessage, TransportSink};
use crate::tts::TtsBackend;
use crate::turn::{TurnConfig, TurnMonitor};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything a session reacts to, in one mailbox.
#[derive(Debug)]
pub enum SessionEvent {
    /// A parsed control message from the media stream.
    Transport(InboundMessage),
    /// Interim or final speech recognition from the STT collaborator.
    Stt(SttEvent),
    /// A synthesized segment arrived from the TTS collaborator.
    Synthesized(Segment),
    /// The playout task finished emitting a segment's frames.
    AudioSent { mark: String, label: String },
}

/// Per-session settings, carved out of the gateway config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Spoken as soon as the media stream starts.
    pub greeting: String,
    pub turn: TurnConfig,
}

impl From<&BridgeConfig> for SessionConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            greeting: config.greeting.clone(),
            turn: config.turn.clone(),
        }
    }
}

/// One live conversation over one media-stream connection.
pub struct Session {
    config: SessionConfig,
    sink: TransportSink,
    flush: FlushHandle,
    stt: Arc<dyn SttStream>,
    reassembly: ReassemblyBuffer,
    monitor: TurnMonitor,
    playout_tx: mpsc::UnboundedSender<Segment>,
    synth_tx: mpsc::UnboundedSender<TextSegment>,
    driver_tx: mpsc::UnboundedSender<(String, u32)>,
    interactions: u32,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        sink: TransportSink,
        flush: FlushHandle,
        stt: Arc<dyn SttStream>,
        playout_tx: mpsc::UnboundedSender<Segment>,
        synth_tx: mpsc::UnboundedSender<TextSegment>,
        driver_tx: mpsc::UnboundedSender<(String, u32)>,
    ) -> Self {
        let monitor = TurnMonitor::new(config.turn.clone());
        Self {
            config,
            sink,
            flush,
            stt,
            reassembly: ReassemblyBuffer::new(),
            monitor,
            playout_tx,
            synth_tx,
            driver_tx,
            interactions: 0,
        }
    }

    /// Consume the mailbox until the stream stops or every producer is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Transport(message) => {
                    if self.on_transport(message) {
                        break;
                    }
                }
                SessionEvent::Stt(SttEvent::Utterance(text)) => self.on_utterance(&text),
                SessionEvent::Stt(SttEvent::Transcript(text)) => self.on_transcript(text),
                SessionEvent::Synthesized(segment) => self.on_synthesized(segment),
                SessionEvent::AudioSent { mark, label } => {
                    debug!(%mark, %label, "utterance handed to transport");
                    self.monitor.audio_sent(mark);
                }
            }
        }

        // Teardown: scheduled frames are abandoned silently when the playout
        // sender drops; the STT stream is told to finish.
        self.stt.close();
        info!("session closed");
    }

    /// Returns true when the session should end.
    fn on_transport(&mut self, message: InboundMessage) -> bool {
        match message {
            InboundMessage::Connected => debug!("media stream handshake"),
            InboundMessage::Start { start } => {
                info!(stream_sid = %start.stream_sid, call_sid = %start.call_sid, "media stream started");
                self.sink.set_stream_sid(start.stream_sid);
                self.reassembly.reset();
                // The greeting bypasses ordering so a slow first completion
                // can never delay it.
                let _ = self.synth_tx.send(TextSegment {
                    index: None,
                    text: self.config.greeting.clone(),
                    utterance: 0,
                });
            }
            InboundMessage::Media { media } => match BASE64.decode(media.payload.as_bytes()) {
                Ok(audio) => {
                    if let Err(e) = self.stt.send_audio(audio) {
                        debug!("audio not forwarded to STT: {e}");
                    }
                }
                Err(e) => debug!("undecodable media payload: {e}"),
            },
            InboundMessage::Mark { mark } => self.monitor.mark_played(&mark.name),
            InboundMessage::Stop => {
                info!("media stream stopped");
                return true;
            }
        }
        false
    }

    fn on_utterance(&mut self, text: &str) {
        if self.monitor.on_utterance(text) {
            info!("interruption, clearing buffered audio");
            self.sink.send_clear();
            self.flush.flush();
        }
    }

    fn on_transcript(&mut self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let utterance = self.interactions;
        self.interactions += 1;
        info!(utterance, "caller: {text}");
        let _ = self.driver_tx.send((text, utterance));
    }

    fn on_synthesized(&mut self, segment: Segment) {
        for ready in self.reassembly.release(segment) {
            let _ = self.playout_tx.send(ready);
        }
    }
}

/// Spawn the synthesis fan-out: each text segment becomes its own TTS task,
/// so slow requests never delay later ones; completions arrive unordered and
/// the reassembly buffer puts them back in generation order.
pub fn spawn_synthesis(
    tts: Arc<dyn TtsBackend>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> mpsc::UnboundedSender<TextSegment> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TextSegment>();
    tokio::spawn(async move {
        while let Some(segment) = rx.recv().await {
            let tts = tts.clone();
            let events = events.clone();
            tokio::spawn(async move {
                match tts.synthesize(&segment.text).await {
                    Ok(audio) if audio.is_empty() => {}
                    Ok(audio) => {
                        let _ = events.send(SessionEvent::Synthesized(Segment {
                            index: segment.index,
                            payload: audio,
                            label: segment.text,
                            utterance: segment.utterance,
                        }));
                    }
                    // The listener hears a gap rather than a crash.
                    Err(e) => warn!(index = ?segment.index, "synthesis failed: {e}"),
                }
            });
        }
    });
    tx
}

/// A running session's handles: its mailbox, the outbound transport channel,
/// and the loop's join handle.
pub struct SessionRuntime {
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    pub task: JoinHandle<()>,
}

/// Wire up one complete session: transport sink, pacer and playout, TTS
/// fan-out, conversation driver, and the session loop itself.
#[allow(clippy::too_many_arguments)]
pub fn spawn_session(
    config: SessionConfig,
    system_prompt: impl Into<String>,
    stt: Arc<dyn SttStream>,
    tts: Arc<dyn TtsBackend>,
    llm: Arc<dyn LlmBackend>,
    tools: Vec<ToolSpec>,
    registry: ToolRegistry,
) -> SessionRuntime {
    let (sink, outbound) = TransportSink::new();
    let (events, mailbox) = mpsc::unbounded_channel();
    let flush = FlushHandle::default();

    let pacer = FramePacer::new(sink.clone(), flush.clone());
    let playout_tx = spawn_playout(pacer, events.clone());
    let synth_tx = spawn_synthesis(tts, events.clone());
    let driver = ConversationDriver::new(llm, tools, registry, system_prompt, synth_tx.clone());
    let driver_tx = spawn_driver(driver);

    let session = Session::new(config, sink, flush, stt, playout_tx, synth_tx, driver_tx);
    let task = tokio::spawn(session.run(mailbox));

    SessionRuntime {
        events,
        outbound,
        task,
    }
}
