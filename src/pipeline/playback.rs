//! Hands ordered audio to listeners and closes the turn

use tokio::sync::mpsc;

use super::{AudioChunk, TurnContext};

/// How a playback drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every chunk was delivered and `TurnCompleted` published
    Completed { delivered: u32 },
    /// The turn was cancelled; remaining chunks were discarded
    Cancelled { delivered: u32 },
}

/// Receives a turn's chunks in sequence order and publishes them
#[derive(Debug)]
pub struct PlaybackSequencer {
    ctx: TurnContext,
    expected: u32,
}

impl PlaybackSequencer {
    #[must_use]
    pub const fn new(ctx: TurnContext) -> Self {
        Self { ctx, expected: 0 }
    }

    /// Drain `chunks` until the scheduler closes it or the turn is cancelled
    ///
    /// A closed queue is the "final chunk" signal: the turn is marked
    /// completed and `TurnCompleted` is published after the last chunk.
    /// Delivery waits for room in the conversation's event queue, so a slow
    /// consumer backs up into `chunks` and from there into synthesis.
    pub async fn run(mut self, mut chunks: mpsc::Receiver<AudioChunk>) -> PlaybackOutcome {
        let turn_id = self.ctx.id();
        let cancel = self.ctx.cancellation().clone();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                chunk = chunks.recv() => Some(chunk),
            };

            match next {
                None => {
                    chunks.close();
                    let discarded = std::iter::from_fn(|| chunks.try_recv().ok()).count();
                    tracing::debug!(turn_id = %turn_id, discarded, "playback cancelled");
                    return PlaybackOutcome::Cancelled {
                        delivered: self.expected,
                    };
                }
                Some(None) => {
                    if !self.ctx.complete().await {
                        return PlaybackOutcome::Cancelled {
                            delivered: self.expected,
                        };
                    }
                    tracing::debug!(turn_id = %turn_id, delivered = self.expected, "playback drained");
                    return PlaybackOutcome::Completed {
                        delivered: self.expected,
                    };
                }
                Some(Some(chunk)) => {
                    debug_assert_eq!(chunk.sequence, self.expected, "chunks must arrive in order");
                    let sequence = chunk.sequence;
                    // Waits here while the consumer is behind
                    if !self.ctx.deliver(chunk).await {
                        tracing::debug!(turn_id = %turn_id, sequence, "turn no longer live, dropping chunk");
                        return PlaybackOutcome::Cancelled {
                            delivered: self.expected,
                        };
                    }
                    self.expected += 1;
                }
            }
        }
    }
}
