//! Voicebridge gateway: call setup and the media-stream WebSocket endpoint.
//!
//! One session per `/connection` upgrade. The gateway only moves bytes and
//! JSON between the socket and the engine; every decision lives in
//! voicebridge-core.

mod tools;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voicebridge_core::{
    spawn_session, BridgeConfig, DeepgramLive, DeepgramTts, InboundMessage, OpenAiChat,
    SessionConfig, SessionEvent, SessionRuntime, SttConfig,
};

struct AppState {
    config: BridgeConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::from_env()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState { config });

    let app = Router::new()
        .route("/health", get(health))
        .route("/incoming", post(incoming_call))
        .route("/connection", get(connection))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🎙️ voicebridge gateway listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "voicebridge is live"
}

/// Call-setup webhook: answer with TwiML that connects the call's audio to
/// our WebSocket endpoint.
async fn incoming_call(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let twiml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Connect><Stream url=\"wss://{}/connection\" /></Connect></Response>",
        state.config.public_host
    );
    ([(header::CONTENT_TYPE, "text/xml")], twiml)
}

async fn connection(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

/// Drive one media-stream connection for its whole lifetime.
async fn handle_stream(socket: WebSocket, state: Arc<AppState>) {
    info!("✅ media stream connection opened");
    let config = &state.config;

    let stt_config = SttConfig {
        api_key: config.deepgram_api_key.clone(),
        model: config.stt_model.clone(),
    };
    let (stt, mut stt_events) = match DeepgramLive::connect(stt_config).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("live transcription unavailable, dropping connection: {e}");
            return;
        }
    };

    let llm = Arc::new(OpenAiChat::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        config.llm.model.clone(),
    ));
    let tts = Arc::new(DeepgramTts::new(
        config.deepgram_api_key.clone(),
        config.tts_model.clone(),
    ));

    let SessionRuntime {
        events,
        mut outbound,
        task,
    } = spawn_session(
        SessionConfig::from(config),
        config.system_prompt.clone(),
        Arc::new(stt),
        tts,
        llm,
        tools::manifest(),
        tools::registry(),
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Engine messages onto the wire.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("unserializable outbound message: {e}"),
            }
        }
    });

    // Transcription events into the session mailbox.
    let stt_forward = events.clone();
    tokio::spawn(async move {
        while let Some(event) = stt_events.recv().await {
            if stt_forward.send(SessionEvent::Stt(event)).is_err() {
                break;
            }
        }
    });

    // Inbound control messages, until the far end hangs up.
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(inbound) => {
                    if events.send(SessionEvent::Transport(inbound)).is_err() {
                        break;
                    }
                }
                // Protocol violations are ignored, never fatal.
                Err(e) => debug!("ignoring malformed inbound message: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("media stream read failed: {e}");
                break;
            }
        }
    }

    // Remote closure ends the session even when no stop event arrived.
    let _ = events.send(SessionEvent::Transport(InboundMessage::Stop));
    drop(events);
    let _ = task.await;
    writer.abort();
    info!("media stream connection closed");
}
