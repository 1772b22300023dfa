//! Shared test utilities: scripted provider doubles

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use voiceclaw::config::PipelineConfig;
use voiceclaw::{
    Error, Generator, Message, PipelineEvent, Providers, Result, Synthesizer, TokenStream,
    Transcriber, TurnController, TurnId,
};

/// One step of a scripted generation
#[derive(Debug, Clone)]
pub enum Step {
    Token(&'static str),
    Pause(Duration),
    Fail(&'static str),
}

/// Generator replaying a fixed script for every turn
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Vec<Step>,
    open_error: Option<&'static str>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Tokens emitted back to back
    pub fn tokens(tokens: &[&'static str]) -> Self {
        Self::new(tokens.iter().map(|t| Step::Token(*t)).collect())
    }

    /// A generator whose stream cannot be opened
    pub fn unavailable(reason: &'static str) -> Self {
        Self {
            open_error: Some(reason),
            ..Self::default()
        }
    }

    /// Message lists received so far, one per turn
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, messages: &[Message]) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(reason) = self.open_error {
            return Err(Error::Generation(reason.to_string()));
        }

        let steps: VecDeque<Step> = self.steps.iter().cloned().collect();
        let stream = futures::stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Pause(delay) => tokio::time::sleep(delay).await,
                    Step::Token(token) => return Some((Ok(token.to_string()), steps)),
                    Step::Fail(reason) => {
                        steps.clear();
                        return Some((Err(Error::Generation(reason.to_string())), steps));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Synthesizer echoing the sentence text as audio after a per-sentence delay
#[derive(Default)]
pub struct ScriptedSynthesizer {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failures: HashSet<String>,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every sentence without an explicit delay
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Delay synthesis of one sentence
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    /// Fail synthesis of one sentence
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failures.insert(text.to_string());
        self
    }

    /// Most calls ever running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(text).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.failures.contains(text) {
            return Err(Error::Synthesis(format!("cannot speak {text:?}")));
        }
        Ok(Bytes::from(text.to_string()))
    }
}

/// Transcriber returning a fixed result
pub struct StubTranscriber {
    result: std::result::Result<String, String>,
    calls: AtomicUsize,
}

impl StubTranscriber {
    pub fn says(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(Error::Transcription)
    }
}

/// Build providers from test doubles
pub fn providers(
    transcriber: Arc<StubTranscriber>,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<ScriptedSynthesizer>,
) -> Providers {
    Providers {
        transcriber,
        generator,
        synthesizer,
    }
}

/// Controller with a silent transcriber and default tuning
pub fn controller(generator: Arc<ScriptedGenerator>, synthesizer: Arc<ScriptedSynthesizer>) -> TurnController {
    controller_with(generator, synthesizer, PipelineConfig::default())
}

pub fn controller_with(
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<ScriptedSynthesizer>,
    config: PipelineConfig,
) -> TurnController {
    let transcriber = Arc::new(StubTranscriber::says("hello"));
    TurnController::new(providers(transcriber, generator, synthesizer), config)
}

/// Receive the next event, failing the test if none arrives
pub async fn next_event(rx: &mut mpsc::Receiver<PipelineEvent>) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event queue closed")
}

/// Collect events until `turn_id` reaches a terminal event
pub async fn until_terminal(
    rx: &mut mpsc::Receiver<PipelineEvent>,
    turn_id: TurnId,
) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.is_terminal() && event.turn_id() == Some(turn_id);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Everything already published, without waiting
pub fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Sequence numbers and payload text of delivered chunks, in delivery order
pub fn delivered(events: &[PipelineEvent]) -> Vec<(u32, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::AudioChunkReady(chunk) => Some((
                chunk.sequence,
                String::from_utf8_lossy(&chunk.payload).into_owned(),
            )),
            _ => None,
        })
        .collect()
}

/// Count events matching `predicate`
pub fn count(events: &[PipelineEvent], predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}
