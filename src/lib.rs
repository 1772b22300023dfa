//! Voiceclaw - Streaming voice conversation pipeline for AI assistants
//!
//! A user's utterance is transcribed, answered by a streaming language
//! model, split into sentences and synthesized sentence by sentence, so
//! audio starts playing long before the reply is finished. New speech
//! interrupts the reply at any point.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │             WebSocket / CLI (one conversation)       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ transcript, barge-in
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Turn Controller                      │
//! │  Generator → Segmenter → Synthesis Scheduler →      │
//! │                          Playback Sequencer          │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Providers                            │
//! │        STT  │  LLM (SSE)  │  TTS                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;

pub use config::Config;
pub use error::{Error, Result, Stage};
pub use pipeline::{
    AudioChunk, PipelineEvent, SentenceSegmenter, SentenceUnit, TurnController, TurnId, TurnState,
};
pub use providers::{Generator, Message, Providers, Role, Synthesizer, TokenStream, Transcriber};
