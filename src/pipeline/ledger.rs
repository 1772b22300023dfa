//! Single authority over the active turn and event publication
//!
//! Events go to one bounded queue per conversation. Publishing first waits
//! for room in the queue, then checks the turn, updates it and sends under
//! one lock. A slow consumer therefore slows the turn down instead of losing
//! events, and once `TurnCancelled` is queued nothing else for that turn
//! follows it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AudioChunk, PipelineEvent, Turn, TurnId, TurnState};
use crate::{Error, Result};

/// Room for one event; `Closed` once the consumer has gone away
enum Slot<'a> {
    Open(mpsc::Permit<'a, PipelineEvent>),
    Closed,
}

impl Slot<'_> {
    fn send(self, event: PipelineEvent) {
        if let Self::Open(permit) = self {
            permit.send(event);
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    next_id: TurnId,
    active: Option<Turn>,
}

impl LedgerState {
    /// Turn `id` if it is neither terminal nor signalled for cancellation
    fn live(&mut self, id: TurnId) -> Option<&mut Turn> {
        self.active.as_mut().filter(|t| {
            t.id() == id && !t.state().is_terminal() && !t.cancellation().is_cancelled()
        })
    }

    /// Move an already signalled turn to `Cancelled` and queue the event
    fn settle_cancelled(&mut self, id: TurnId, slot: Slot<'_>) -> bool {
        let Some(turn) = self.active.as_mut().filter(|t| t.id() == id) else {
            return false;
        };
        if !turn.transition(TurnState::Cancelled) {
            return false;
        }
        tracing::info!(turn_id = %id, "turn cancelled");
        slot.send(PipelineEvent::TurnCancelled { turn_id: id });
        true
    }
}

/// Owns the conversation's current turn
#[derive(Debug)]
pub struct Ledger {
    state: Mutex<LedgerState>,
    events: mpsc::Sender<PipelineEvent>,
}

impl Ledger {
    /// Create a ledger and the receiving end of its event queue
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (events, receiver) = mpsc::channel(capacity.max(1));
        let ledger = Self {
            state: Mutex::new(LedgerState {
                next_id: TurnId::new(1),
                active: None,
            }),
            events,
        };
        (ledger, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn slot(&self) -> Slot<'_> {
        match self.events.reserve().await {
            Ok(permit) => Slot::Open(permit),
            Err(_) => Slot::Closed,
        }
    }

    /// Wait for room in the queue unless `cancel` fires first
    async fn slot_unless(&self, cancel: &CancellationToken) -> Option<Slot<'_>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            slot = self.slot() => Some(slot),
        }
    }

    /// Publish an event that belongs to no turn
    pub async fn announce(&self, event: PipelineEvent) {
        let slot = self.slot().await;
        let _state = self.lock();
        slot.send(event);
    }

    /// Open a new turn and move it to `Generating`
    ///
    /// # Errors
    ///
    /// Returns [`Error::TurnActive`] if the previous turn is not terminal
    pub async fn open(self: &Arc<Self>, transcript: &str) -> Result<TurnContext> {
        loop {
            let slot = self.slot().await;
            if let Some(ctx) = self.try_open(slot, transcript)? {
                return Ok(ctx);
            }
        }
    }

    /// One attempt at opening; `None` means the slot went to a pending cancellation
    fn try_open(self: &Arc<Self>, slot: Slot<'_>, transcript: &str) -> Result<Option<TurnContext>> {
        let mut state = self.lock();
        let pending = state
            .active
            .as_ref()
            .filter(|t| !t.state().is_terminal())
            .map(|t| (t.id(), t.cancellation().is_cancelled()));
        if let Some((id, cancelled)) = pending {
            if !cancelled {
                return Err(Error::TurnActive(id));
            }
            // Its canceller went away before queuing the event
            state.settle_cancelled(id, slot);
            return Ok(None);
        }

        let id = state.next_id;
        state.next_id = id.next();

        let mut turn = Turn::new(id, transcript);
        turn.transition(TurnState::Generating);
        let cancel = turn.cancellation().clone();
        let event = PipelineEvent::TurnStarted {
            turn_id: id,
            transcript: turn.transcript().to_string(),
        };
        state.active = Some(turn);

        tracing::info!(turn_id = %id, "turn started");
        slot.send(event);

        Ok(Some(TurnContext {
            id,
            cancel,
            ledger: Arc::clone(self),
        }))
    }

    /// Cancel the active turn if it is not yet terminal
    ///
    /// Every stage sees the cancellation immediately; `TurnCancelled` is
    /// queued once there is room. Returns the cancelled turn's id, exactly
    /// once per turn.
    pub async fn cancel_active(&self) -> Option<TurnId> {
        let id = self.signal_cancel()?;
        let slot = self.slot().await;
        self.lock().settle_cancelled(id, slot).then_some(id)
    }

    fn signal_cancel(&self) -> Option<TurnId> {
        let state = self.lock();
        let turn = state.active.as_ref().filter(|t| !t.state().is_terminal())?;
        turn.cancellation().cancel();
        Some(turn.id())
    }

    /// Id and state of the most recent turn
    #[must_use]
    pub fn current(&self) -> Option<(TurnId, TurnState)> {
        self.lock().active.as_ref().map(|t| (t.id(), t.state()))
    }
}

/// A stage's view of one turn
///
/// Cheap to clone; every stage of the turn holds one.
#[derive(Debug, Clone)]
pub struct TurnContext {
    id: TurnId,
    cancel: CancellationToken,
    ledger: Arc<Ledger>,
}

impl TurnContext {
    #[must_use]
    pub const fn id(&self) -> TurnId {
        self.id
    }

    /// Token signalled when the turn is cancelled
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish an event for this turn
    ///
    /// Waits while the queue is full. Returns `false` and drops the event if
    /// the turn is cancelled or over by then.
    pub async fn emit(&self, event: PipelineEvent) -> bool {
        let Some(slot) = self.ledger.slot_unless(&self.cancel).await else {
            return false;
        };
        let mut state = self.ledger.lock();
        if state.live(self.id).is_none() {
            return false;
        }
        slot.send(event);
        true
    }

    /// Hand an in-order chunk to the consumer
    ///
    /// Returns `false` if the turn is no longer live and the chunk was dropped.
    pub async fn deliver(&self, chunk: AudioChunk) -> bool {
        if chunk.turn_id != self.id {
            return false;
        }
        self.emit(chunk.into()).await
    }

    /// Record generated text on the turn
    pub fn append_generated(&self, fragment: &str) {
        if let Some(turn) = self.ledger.lock().live(self.id) {
            turn.append_generated(fragment);
        }
    }

    /// Everything generated so far, while the turn is live
    #[must_use]
    pub fn generated_text(&self) -> Option<String> {
        self.ledger
            .lock()
            .live(self.id)
            .map(|t| t.generated_text().to_string())
    }

    /// Generation finished; audio is still draining
    pub fn start_speaking(&self) -> bool {
        let mut state = self.ledger.lock();
        state
            .live(self.id)
            .is_some_and(|turn| turn.transition(TurnState::Speaking))
    }

    /// Mark the turn completed and publish `TurnCompleted`
    pub async fn complete(&self) -> bool {
        let event = PipelineEvent::TurnCompleted { turn_id: self.id };
        let done = self.finish(TurnState::Completed, event).await;
        if done {
            tracing::info!(turn_id = %self.id, "turn completed");
        }
        done
    }

    /// Mark the turn failed and publish `TurnFailed`
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        let event = PipelineEvent::TurnFailed {
            turn_id: self.id,
            reason: reason.into(),
        };
        self.finish(TurnState::Failed, event).await
    }

    async fn finish(&self, next: TurnState, event: PipelineEvent) -> bool {
        let Some(slot) = self.ledger.slot_unless(&self.cancel).await else {
            return false;
        };
        let mut state = self.ledger.lock();
        let Some(turn) = state.live(self.id) else {
            return false;
        };
        let from = turn.state();
        if !turn.transition(next) {
            tracing::warn!(turn_id = %self.id, %from, to = %next, "illegal turn transition ignored");
            return false;
        }
        tracing::debug!(turn_id = %self.id, %from, to = %next, "turn transition");
        slot.send(event);
        true
    }
}
