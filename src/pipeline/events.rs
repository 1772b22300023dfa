//! Events published by a conversation's turn controller

use bytes::Bytes;

use super::TurnId;

/// Synthesized audio for one sentence of a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub turn_id: TurnId,
    /// Inherited from the sentence it was synthesized from
    pub sequence: u32,
    /// Encoded audio; empty for the silent placeholder
    pub payload: Bytes,
}

impl AudioChunk {
    /// Placeholder substituted for a failed synthesis
    #[must_use]
    pub const fn silence(turn_id: TurnId, sequence: u32) -> Self {
        Self {
            turn_id,
            sequence,
            payload: Bytes::new(),
        }
    }

    /// Whether this is the silent placeholder
    #[must_use]
    pub fn is_silence(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Observable pipeline output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A finalized transcript is about to open a turn
    TranscriptReady { text: String },
    /// Transcription failed; no turn was started
    TranscriptionFailed { reason: String },
    /// A new turn began generating
    TurnStarted { turn_id: TurnId, transcript: String },
    /// Next in-order chunk of audio
    AudioChunkReady(AudioChunk),
    /// Synthesis of one sentence failed; a silent chunk takes its place
    SynthesisFailed { turn_id: TurnId, sequence: u32 },
    /// Generation stopped early; already produced text is still spoken
    GenerationFailed { turn_id: TurnId, reason: String },
    /// Full assistant text, for display
    ResponseText {
        turn_id: TurnId,
        text: String,
        no_reply: bool,
    },
    /// All audio for the turn has been delivered
    TurnCompleted { turn_id: TurnId },
    /// The turn was cancelled; no further audio will follow
    TurnCancelled { turn_id: TurnId },
    /// The turn produced no usable content
    TurnFailed { turn_id: TurnId, reason: String },
}

impl PipelineEvent {
    /// Turn this event belongs to, if any
    #[must_use]
    pub const fn turn_id(&self) -> Option<TurnId> {
        match self {
            Self::TranscriptReady { .. } | Self::TranscriptionFailed { .. } => None,
            Self::AudioChunkReady(chunk) => Some(chunk.turn_id),
            Self::TurnStarted { turn_id, .. }
            | Self::SynthesisFailed { turn_id, .. }
            | Self::GenerationFailed { turn_id, .. }
            | Self::ResponseText { turn_id, .. }
            | Self::TurnCompleted { turn_id }
            | Self::TurnCancelled { turn_id }
            | Self::TurnFailed { turn_id, .. } => Some(*turn_id),
        }
    }

    /// Whether this event ends its turn
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnCompleted { .. } | Self::TurnCancelled { .. } | Self::TurnFailed { .. }
        )
    }
}

impl From<AudioChunk> for PipelineEvent {
    fn from(chunk: AudioChunk) -> Self {
        Self::AudioChunkReady(chunk)
    }
}
