//! Per-conversation turn orchestration
//!
//! One [`TurnController`] exists per conversation. It enforces at most one
//! non-terminal turn, spawns the tasks that move a turn from tokens to audio,
//! and performs barge-in when new speech arrives. Its events go to a single
//! bounded queue taken with [`TurnController::take_events`].

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::sync::mpsc;

use super::{
    ConversationHistory, Ledger, NoReplyGate, PipelineEvent, PlaybackSequencer, SentenceSegmenter,
    SentenceUnit, SynthesisScheduler, TurnContext, TurnId, TurnState,
};
use crate::config::PipelineConfig;
use crate::error::Stage;
use crate::providers::{Generator, Message, Providers, Synthesizer, TokenStream};
use crate::{Error, Result};

/// Sentences buffered between the generation loop and the scheduler
const SENTENCE_QUEUE: usize = 32;

/// Orchestrates the turns of one conversation
pub struct TurnController {
    providers: Providers,
    config: PipelineConfig,
    ledger: Arc<Ledger>,
    events: Mutex<Option<mpsc::Receiver<PipelineEvent>>>,
    history: Arc<Mutex<ConversationHistory>>,
}

impl std::fmt::Debug for TurnController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnController")
            .field("active", &self.ledger.current())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TurnController {
    /// Create a controller for a new conversation
    #[must_use]
    pub fn new(providers: Providers, config: PipelineConfig) -> Self {
        let history = match config.system_prompt.as_deref() {
            Some(prompt) => ConversationHistory::with_system_prompt(prompt, config.history_limit),
            None => ConversationHistory::new(config.history_limit),
        };
        let (ledger, events) = Ledger::new(config.event_capacity);
        Self {
            providers,
            ledger: Arc::new(ledger),
            events: Mutex::new(Some(events)),
            history: Arc::new(Mutex::new(history)),
            config,
        }
    }

    /// Take the conversation's event queue
    ///
    /// The queue has a single consumer and holds `event_capacity` events.
    /// While it is full, publishing waits: playback stalls, then synthesis,
    /// until the consumer catches up. Returns `None` once taken.
    pub fn take_events(&self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Id and state of the most recent turn
    #[must_use]
    pub fn active_turn(&self) -> Option<(TurnId, TurnState)> {
        self.ledger.current()
    }

    /// Snapshot of the conversation history
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.lock_history().messages().to_vec()
    }

    /// Forget the conversation so far, optionally keeping the system prompt
    pub fn clear_history(&self, keep_system: bool) {
        self.lock_history().clear(keep_system);
        tracing::info!(keep_system, "conversation history cleared");
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a turn for a finalized transcript and start generating
    ///
    /// # Errors
    ///
    /// Returns [`Error::TurnActive`] while a previous turn is not terminal,
    /// or [`Error::Transcription`] for a blank transcript
    pub async fn start_turn(&self, transcript: &str) -> Result<TurnId> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(Error::Transcription("empty transcript".to_string()));
        }

        let ctx = self.ledger.open(transcript).await?;
        let messages = {
            let mut history = self.lock_history();
            history.push(Message::user(transcript));
            history.messages().to_vec()
        };

        let driver = TurnDriver {
            ctx: ctx.clone(),
            generator: Arc::clone(&self.providers.generator),
            synthesizer: Arc::clone(&self.providers.synthesizer),
            config: self.config.clone(),
            history: Arc::clone(&self.history),
        };
        tokio::spawn(driver.run(messages));

        Ok(ctx.id())
    }

    /// Cancel the active turn; a no-op when nothing is in progress
    pub async fn cancel_active_turn(&self) -> Option<TurnId> {
        self.ledger.cancel_active().await
    }

    /// New speech detected: barge in on whatever is playing
    pub async fn speech_started(&self) -> Option<TurnId> {
        let cancelled = self.cancel_active_turn().await;
        if let Some(turn_id) = cancelled {
            tracing::info!(turn_id = %turn_id, "barge-in");
        }
        cancelled
    }

    /// Barge in, transcribe a finished utterance and start a turn for it
    ///
    /// `audio` is a WAV buffer. A failed or empty transcription publishes
    /// `TranscriptionFailed` and leaves the conversation listening.
    ///
    /// # Errors
    ///
    /// Returns the transcription error, or [`Error::TurnActive`] if another
    /// turn was opened meanwhile
    pub async fn handle_utterance(&self, audio: &[u8]) -> Result<TurnId> {
        self.speech_started().await;

        let timeout = self.config.transcription_timeout;
        let transcribed =
            match tokio::time::timeout(timeout, self.providers.transcriber.transcribe(audio)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    stage: Stage::Transcription,
                    after: timeout,
                }),
            };

        let text = match transcribed.map(|t| t.trim().to_string()) {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                let e = Error::Transcription("no speech recognized".to_string());
                self.report_transcription_failure(&e).await;
                return Err(e);
            }
            Err(e) => {
                self.report_transcription_failure(&e).await;
                return Err(e);
            }
        };

        tracing::info!(chars = text.len(), "transcription ready");
        self.ledger
            .announce(PipelineEvent::TranscriptReady { text: text.clone() })
            .await;
        self.start_turn(&text).await
    }

    async fn report_transcription_failure(&self, e: &Error) {
        tracing::warn!(error = %e, "transcription failed");
        self.ledger
            .announce(PipelineEvent::TranscriptionFailed {
                reason: e.to_string(),
            })
            .await;
    }
}

/// Everything one turn's generation task needs
struct TurnDriver {
    ctx: TurnContext,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    config: PipelineConfig,
    history: Arc<Mutex<ConversationHistory>>,
}

impl TurnDriver {
    /// Consume the generator and feed sentences to synthesis
    #[allow(clippy::too_many_lines)]
    async fn run(self, messages: Vec<Message>) {
        let turn_id = self.ctx.id();
        let cancel = self.ctx.cancellation().clone();
        let limit = self.config.generation_timeout;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        let timed_out = || Error::Timeout {
            stage: Stage::Generation,
            after: limit,
        };

        let opened: Result<TokenStream> = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = &mut deadline => Err(timed_out()),
            result = self.generator.generate(&messages) => result,
        };
        let mut tokens = match opened {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(turn_id = %turn_id, error = %e, "generation failed to start");
                self.ctx.fail(e.to_string()).await;
                return;
            }
        };

        let mut segmenter = SentenceSegmenter::with_cancellation(cancel.clone());
        let mut gate = NoReplyGate::new(&self.config.no_reply_sentinel);
        let mut speech: Option<mpsc::Sender<SentenceUnit>> = None;
        let mut failure: Option<Error> = None;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(turn_id = %turn_id, "generation abandoned");
                    return;
                }
                () = &mut deadline => Some(Err(timed_out())),
                item = tokens.next() => item,
            };

            match next {
                None => break,
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    self.ctx.append_generated(&fragment);
                    gate.observe(&fragment);
                    let released = gate.offer(segmenter.push(&fragment));
                    if !self.forward(&mut speech, released).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(tokens);

        let Some(text) = self.ctx.generated_text() else {
            return;
        };
        if let Some(e) = &failure {
            if text.trim().is_empty() {
                tracing::warn!(turn_id = %turn_id, error = %e, "generation failed before any text");
                self.ctx.fail(e.to_string()).await;
                return;
            }
            tracing::warn!(turn_id = %turn_id, error = %e, "generation failed, keeping partial reply");
            let event = PipelineEvent::GenerationFailed {
                turn_id,
                reason: e.to_string(),
            };
            if !self.ctx.emit(event).await {
                return;
            }
        } else if text.trim().is_empty() {
            tracing::warn!(turn_id = %turn_id, "generator produced no text");
            self.ctx.fail("empty response").await;
            return;
        }

        let mut remaining = gate.offer(segmenter.finish().into_iter().collect());
        let no_reply = match gate.finish() {
            Some(held) => {
                remaining.extend(held);
                false
            }
            None => true,
        };

        let reply = text.trim().to_string();
        let event = PipelineEvent::ResponseText {
            turn_id,
            text: reply.clone(),
            no_reply,
        };
        if !self.ctx.emit(event).await {
            return;
        }
        if no_reply {
            tracing::info!(turn_id = %turn_id, "no-reply sentinel, staying silent");
        } else {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Message::assistant(reply));
        }

        if !self.forward(&mut speech, remaining).await {
            return;
        }

        match speech {
            // Speaking must be entered before the queue closes, since a
            // closed queue lets playback complete the turn
            Some(sentences) => {
                self.ctx.start_speaking();
                drop(sentences);
            }
            None => {
                self.ctx.complete().await;
            }
        }
    }

    /// Hand sentences to the scheduler, spawning it on first use
    ///
    /// Returns `false` once the turn can no longer accept sentences.
    async fn forward(
        &self,
        speech: &mut Option<mpsc::Sender<SentenceUnit>>,
        units: Vec<SentenceUnit>,
    ) -> bool {
        if units.is_empty() {
            return true;
        }
        let sentences = speech.get_or_insert_with(|| self.spawn_speech());
        let cancel = self.ctx.cancellation();

        for unit in units {
            tracing::debug!(turn_id = %self.ctx.id(), sequence = unit.sequence, "sentence ready");
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                sent = sentences.send(unit) => sent,
            };
            if sent.is_err() {
                return false;
            }
        }
        true
    }

    fn spawn_speech(&self) -> mpsc::Sender<SentenceUnit> {
        let (sentence_tx, sentence_rx) = mpsc::channel(SENTENCE_QUEUE);
        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.max_concurrent_synthesis.max(1));

        let scheduler = SynthesisScheduler::new(
            Arc::clone(&self.synthesizer),
            self.config.max_concurrent_synthesis,
            self.config.synthesis_timeout,
        );
        tokio::spawn(scheduler.run(self.ctx.clone(), sentence_rx, chunk_tx));

        let playback = PlaybackSequencer::new(self.ctx.clone());
        let turn_id = self.ctx.id();
        tokio::spawn(async move {
            let outcome = playback.run(chunk_rx).await;
            tracing::debug!(turn_id = %turn_id, ?outcome, "playback finished");
        });

        sentence_tx
    }
}
