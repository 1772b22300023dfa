//! Concurrent synthesis with in-order release
//!
//! Each sentence launches its own synthesis call as soon as it arrives (up to
//! a per-turn bound), so provider latency overlaps across sentences. Results
//! may finish in any order; a reorder buffer only releases chunk `k` after
//! chunks `0..k` have gone out.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;

use super::{AudioChunk, PipelineEvent, SentenceUnit, TurnContext, TurnId};
use crate::error::Stage;
use crate::providers::Synthesizer;
use crate::{Error, Result};

/// Holds finished chunks until every lower sequence number has been released
#[derive(Debug)]
pub struct ReorderBuffer {
    next: u32,
    pending: BTreeMap<u32, AudioChunk>,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Park a finished chunk; already released or duplicate sequence numbers are ignored
    pub fn insert(&mut self, chunk: AudioChunk) {
        if chunk.sequence < self.next {
            tracing::warn!(sequence = chunk.sequence, "chunk already released, dropping");
            return;
        }
        self.pending.entry(chunk.sequence).or_insert(chunk);
    }

    /// Next chunk in sequence, if it has arrived
    pub fn pop_ready(&mut self) -> Option<AudioChunk> {
        let chunk = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(chunk)
    }

    /// Sequence number awaited next
    #[must_use]
    pub const fn next_sequence(&self) -> u32 {
        self.next
    }

    /// Number of chunks parked out of order
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Synthesizes one turn's sentences and releases audio in order
pub struct SynthesisScheduler {
    synthesizer: Arc<dyn Synthesizer>,
    max_concurrent: usize,
    timeout: Duration,
}

impl SynthesisScheduler {
    /// Create a scheduler allowing `max_concurrent` simultaneous calls
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            synthesizer,
            max_concurrent: max_concurrent.max(1),
            timeout,
        }
    }

    /// Spawn one synthesis call
    ///
    /// The call runs on its own task so it finishes even if the turn is
    /// cancelled; its result is then simply never looked at.
    fn launch(&self, turn_id: TurnId, unit: SentenceUnit) -> impl Future<Output = (u32, Result<Bytes>)> + use<> {
        let synthesizer = Arc::clone(&self.synthesizer);
        let timeout = self.timeout;
        let sequence = unit.sequence;
        tracing::debug!(turn_id = %turn_id, sequence, text = %unit.text, "synthesis started");

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, synthesizer.synthesize(&unit.text)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    stage: Stage::Synthesis,
                    after: timeout,
                }),
            }
        });

        async move {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(Error::Synthesis(format!("synthesis task failed: {e}"))));
            (sequence, result)
        }
    }

    /// Drive the turn's sentences through synthesis
    ///
    /// Returns when the sentence queue is closed and every chunk has been
    /// released, when `chunks` is closed, or as soon as the turn is cancelled.
    pub async fn run(
        self,
        ctx: TurnContext,
        mut sentences: mpsc::Receiver<SentenceUnit>,
        chunks: mpsc::Sender<AudioChunk>,
    ) {
        let turn_id = ctx.id();
        let cancel = ctx.cancellation().clone();
        let mut queued: VecDeque<SentenceUnit> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();
        let mut reorder = ReorderBuffer::new();
        let mut accepting = true;

        loop {
            while in_flight.len() < self.max_concurrent {
                let Some(unit) = queued.pop_front() else { break };
                in_flight.push(self.launch(turn_id, unit));
            }

            if !accepting && queued.is_empty() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(
                        turn_id = %turn_id,
                        in_flight = in_flight.len(),
                        "scheduler cancelled, discarding outstanding synthesis"
                    );
                    return;
                }
                Some((sequence, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    let chunk = match result {
                        Ok(payload) => AudioChunk { turn_id, sequence, payload },
                        Err(e) => {
                            tracing::warn!(turn_id = %turn_id, sequence, error = %e, "synthesis failed, substituting silence");
                            ctx.emit(PipelineEvent::SynthesisFailed { turn_id, sequence }).await;
                            AudioChunk::silence(turn_id, sequence)
                        }
                    };
                    reorder.insert(chunk);

                    while let Some(ready) = reorder.pop_ready() {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            sent = chunks.send(ready) => {
                                if sent.is_err() {
                                    tracing::debug!(turn_id = %turn_id, "playback closed, stopping scheduler");
                                    return;
                                }
                            }
                        }
                    }
                }
                unit = sentences.recv(), if accepting => match unit {
                    Some(unit) => queued.push_back(unit),
                    None => accepting = false,
                },
            }
        }

        tracing::debug!(turn_id = %turn_id, released = reorder.next_sequence(), "synthesis finished");
    }
}
