//! Streaming turn pipeline
//!
//! Transcript in, ordered audio out. A [`TurnController`] owns one
//! conversation: it drives the generator's tokens through the
//! [`SentenceSegmenter`] into the [`SynthesisScheduler`], whose in-order
//! chunks the [`PlaybackSequencer`] publishes as [`PipelineEvent`]s.

mod controller;
mod events;
mod history;
mod ledger;
mod no_reply;
mod playback;
mod scheduler;
mod segmenter;
mod turn;

pub use controller::TurnController;
pub use events::{AudioChunk, PipelineEvent};
pub use history::{ConversationHistory, DEFAULT_HISTORY_LIMIT};
pub use ledger::{Ledger, TurnContext};
pub use no_reply::{NoReplyGate, is_no_reply};
pub use playback::{PlaybackOutcome, PlaybackSequencer};
pub use scheduler::{ReorderBuffer, SynthesisScheduler};
pub use segmenter::{SentenceSegmenter, SentenceUnit};
pub use turn::{Turn, TurnId, TurnState};
