//! WebSocket handler for voice conversations
//!
//! Each connection is one conversation with its own [`TurnController`].

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ApiState;
use crate::pipeline::{PipelineEvent, TurnController, TurnId};
use crate::{Error, Stage, audio};

/// Incoming WebSocket message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// A finished utterance: base64 WAV or little-endian `f32` PCM
    Audio { audio: String },
    /// Client-side VAD detected new speech
    SpeechStart,
    /// Typed input, bypassing transcription
    Text { text: String },
    /// Stop the current response
    Interrupt,
    /// Forget the conversation so far
    ClearHistory {
        #[serde(default = "default_keep_system")]
        keep_system: bool,
    },
    /// Ping to keep connection alive
    Ping,
}

const fn default_keep_system() -> bool {
    true
}

/// Outgoing WebSocket message to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Connection established
    Connected {
        version: &'static str,
        /// Container format of `tts_chunk` audio
        format: String,
    },
    /// Finalized transcript of the last utterance
    Transcription { text: String },
    /// A response turn began
    TurnStarted { turn_id: TurnId, transcript: String },
    /// One in-order sentence of audio
    TtsChunk {
        turn_id: TurnId,
        sequence: u32,
        /// Base64 audio; empty for a silent placeholder
        audio_chunk: String,
        format: String,
        silent: bool,
        timestamp: DateTime<Utc>,
    },
    /// One sentence could not be synthesized
    SynthesisFailed { turn_id: TurnId, sequence: u32 },
    /// Generation stopped early; the partial reply is still spoken
    GenerationFailed { turn_id: TurnId, reason: String },
    /// Full assistant reply text
    LlmResponse {
        turn_id: TurnId,
        text: String,
        no_reply: bool,
    },
    /// All audio for the turn has been sent
    TurnComplete { turn_id: TurnId },
    /// The turn was interrupted; drop any queued audio for it
    TurnCancelled { turn_id: TurnId },
    /// The turn produced nothing to play
    TurnFailed { turn_id: TurnId, reason: String },
    /// Error occurred
    Error { code: String, message: String },
    /// Pong response
    Pong,
}

impl WsOutgoing {
    /// Map a pipeline event onto the wire
    #[must_use]
    pub fn from_event(event: PipelineEvent, format: &str) -> Self {
        match event {
            PipelineEvent::TranscriptReady { text } => Self::Transcription { text },
            PipelineEvent::TranscriptionFailed { reason } => Self::Error {
                code: "transcription_failed".to_string(),
                message: reason,
            },
            PipelineEvent::TurnStarted {
                turn_id,
                transcript,
            } => Self::TurnStarted {
                turn_id,
                transcript,
            },
            PipelineEvent::AudioChunkReady(chunk) => Self::TtsChunk {
                turn_id: chunk.turn_id,
                sequence: chunk.sequence,
                silent: chunk.is_silence(),
                audio_chunk: BASE64.encode(&chunk.payload),
                format: format.to_string(),
                timestamp: Utc::now(),
            },
            PipelineEvent::SynthesisFailed { turn_id, sequence } => {
                Self::SynthesisFailed { turn_id, sequence }
            }
            PipelineEvent::GenerationFailed { turn_id, reason } => {
                Self::GenerationFailed { turn_id, reason }
            }
            PipelineEvent::ResponseText {
                turn_id,
                text,
                no_reply,
            } => Self::LlmResponse {
                turn_id,
                text,
                no_reply,
            },
            PipelineEvent::TurnCompleted { turn_id } => Self::TurnComplete { turn_id },
            PipelineEvent::TurnCancelled { turn_id } => Self::TurnCancelled { turn_id },
            PipelineEvent::TurnFailed { turn_id, reason } => Self::TurnFailed { turn_id, reason },
        }
    }

    fn error(e: &Error) -> Self {
        let code = match e {
            Error::TurnActive(_) => "turn_active",
            Error::Transcription(_) => "transcription_failed",
            Error::Audio(_) => "invalid_audio",
            Error::Serialization(_) => "invalid_message",
            Error::Timeout { .. } => "timeout",
            _ => "internal_error",
        };
        Self::Error {
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let controller = Arc::new(state.conversation());
    let Some(mut events) = controller.take_events() else {
        return;
    };
    let format = state.providers.synthesizer.format().to_string();

    let connected = WsOutgoing::Connected {
        version: env!("CARGO_PKG_VERSION"),
        format: format.clone(),
    };
    if let Ok(msg) = serde_json::to_string(&connected)
        && sender.send(Message::Text(msg.into())).await.is_err()
    {
        return;
    }

    let open = state.connection_opened();
    tracing::info!(active_connections = open, "WebSocket connected");

    // Channel for sending messages back to client
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(64);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg)
                && sender.send(Message::Text(text.into())).await.is_err()
            {
                break;
            }
        }
    });

    // Forward pipeline events in publication order
    let events_tx = tx.clone();
    let mut event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if events_tx.send(WsOutgoing::from_event(event, &format)).await.is_err() {
                break;
            }
        }
    });

    let recv_controller = Arc::clone(&controller);
    let recv_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Err(e) = handle_message(&text, &recv_state, &recv_controller, &tx).await {
                        tracing::debug!(error = %e, "rejected client message");
                        let _ = tx.send(WsOutgoing::error(&e)).await;
                    }
                }
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            event_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
            event_task.abort();
        }
        _ = &mut event_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    controller.cancel_active_turn().await;
    let open = state.connection_closed();
    tracing::info!(active_connections = open, "WebSocket disconnected");
}

/// Handle a single incoming message
async fn handle_message(
    text: &str,
    state: &Arc<ApiState>,
    controller: &Arc<TurnController>,
    tx: &mpsc::Sender<WsOutgoing>,
) -> crate::Result<()> {
    let incoming: WsIncoming = serde_json::from_str(text)?;

    match incoming {
        WsIncoming::Ping => {
            let _ = tx.send(WsOutgoing::Pong).await;
        }
        WsIncoming::SpeechStart => {
            controller.speech_started().await;
        }
        WsIncoming::Interrupt => {
            if controller.cancel_active_turn().await.is_none() {
                tracing::debug!("interrupt with no active turn");
            }
        }
        WsIncoming::ClearHistory { keep_system } => {
            controller.clear_history(keep_system);
        }
        WsIncoming::Text { text } => {
            // Typed input barges in just like speech
            controller.speech_started().await;
            controller.start_turn(&text).await?;
        }
        WsIncoming::Audio { audio } => {
            let raw = BASE64
                .decode(audio.trim())
                .map_err(|e| Error::Audio(format!("invalid base64 audio: {e}")))?;
            let wav = audio::normalize_utterance(&raw, state.sample_rate)?;

            // Transcription can take a while; keep reading interrupts meanwhile
            let controller = Arc::clone(controller);
            let tx = tx.clone();
            tokio::spawn(async move {
                match controller.handle_utterance(&wav).await {
                    Ok(turn_id) => tracing::debug!(turn_id = %turn_id, "utterance opened turn"),
                    // Transcription failures already reached the client as events
                    Err(e) if e.stage() == Some(Stage::Transcription) => {}
                    Err(e) => {
                        let _ = tx.send(WsOutgoing::error(&e)).await;
                    }
                }
            });
        }
    }

    Ok(())
}
