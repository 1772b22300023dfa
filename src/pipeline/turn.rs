//! Turn identity and lifecycle

use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Monotonically increasing turn identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TurnId(u64);

impl TurnId {
    /// Wrap a raw identifier
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The identifier following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Waiting for a finalized transcription
    Listening,
    /// Consuming the generator's token stream
    Generating,
    /// Generation done, audio still draining to playback
    Speaking,
    /// Response fully delivered
    Completed,
    /// Cancelled by barge-in or an explicit request
    Cancelled,
    /// Generation failed before producing any text
    Failed,
}

impl TurnState {
    /// Whether the turn has reached a final state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Listening, Self::Generating | Self::Cancelled)
                | (
                    Self::Generating,
                    Self::Speaking | Self::Completed | Self::Cancelled | Self::Failed
                )
                | (Self::Speaking, Self::Completed | Self::Cancelled)
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listening => "listening",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One user utterance and the assistant's response to it
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    state: TurnState,
    transcript: String,
    generated_text: String,
    cancel: CancellationToken,
}

impl Turn {
    /// Open a turn for a finalized transcript
    ///
    /// Identity and cancellation token are created together.
    #[must_use]
    pub fn new(id: TurnId, transcript: impl Into<String>) -> Self {
        Self {
            id,
            state: TurnState::Listening,
            transcript: transcript.into(),
            generated_text: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TurnId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    #[must_use]
    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }

    /// Token observed by every stage of this turn
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `next` if the transition is legal
    ///
    /// Returns `false` and leaves the state untouched otherwise.
    pub fn transition(&mut self, next: TurnState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next == TurnState::Cancelled {
            self.cancel.cancel();
        }
        true
    }

    /// Append generated text; ignored once the turn is terminal
    pub fn append_generated(&mut self, fragment: &str) {
        if !self.state.is_terminal() {
            self.generated_text.push_str(fragment);
        }
    }
}
