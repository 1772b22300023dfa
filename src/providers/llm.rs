//! Streaming chat completions client
//!
//! Talks to any OpenAI-compatible `/v1/chat/completions` endpoint with
//! `stream: true` and turns the server-sent events into a [`TokenStream`].

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{Generator, Message, TokenStream};
use crate::config::LlmConfig;
use crate::{Error, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    /// Servers that ignore `stream` answer with a whole message
    #[serde(default)]
    message: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl StreamChunk {
    fn into_content(self) -> Option<String> {
        let choice = self.choices.into_iter().next()?;
        choice
            .delta
            .or(choice.message)
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty())
    }
}

/// One decoded server-sent event payload
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Content(String),
    Done,
}

/// Splits a byte stream into `data:` payloads
///
/// Bytes are buffered until a full line is present, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Decode every complete line received so far
    ///
    /// An error payload ends decoding; events before it are still returned.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<SseEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            match Self::decode_line(line.trim()) {
                Ok(None) => {}
                Ok(Some(event)) => {
                    let done = event == SseEvent::Done;
                    events.push(Ok(event));
                    if done {
                        self.buffer.clear();
                        break;
                    }
                }
                Err(e) => {
                    events.push(Err(e));
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Flush a final line that had no trailing newline
    fn finish(&mut self) -> Result<Option<SseEvent>> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        Self::decode_line(line.trim())
    }

    fn decode_line(line: &str) -> Result<Option<SseEvent>> {
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            // event:, id: and retry: fields carry nothing we use
            return Ok(None);
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            return Ok(Some(SseEvent::Done));
        }

        match serde_json::from_str::<StreamChunk>(data) {
            Ok(StreamChunk {
                error: Some(error), ..
            }) => Err(Error::Generation(error.message)),
            Ok(chunk) => Ok(chunk.into_content().map(SseEvent::Content)),
            Err(e) => {
                tracing::debug!(error = %e, data, "skipping unparseable stream chunk");
                Ok(None)
            }
        }
    }
}

/// Chat completions client implementing [`Generator`]
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the temperature is outside 0.0 to 2.0
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(Error::Config(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                config.temperature
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_owned())),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

/// Adapt a response body into content fragments
fn token_stream<S, B, E>(body: S) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    struct State {
        body: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
        decoder: SseDecoder,
        ready: VecDeque<Result<String>>,
        done: bool,
    }

    let body = body
        .map(|chunk| chunk.map(|b| b.as_ref().to_vec()).map_err(|e| e.to_string()))
        .boxed();
    let state = State {
        body,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.done = true;
                    state.ready.clear();
                }
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for event in state.decoder.push(&bytes) {
                        match event {
                            Ok(SseEvent::Content(text)) => state.ready.push_back(Ok(text)),
                            Ok(SseEvent::Done) => state.done = true,
                            Err(e) => state.ready.push_back(Err(e)),
                        }
                    }
                }
                Some(Err(e)) => {
                    state
                        .ready
                        .push_back(Err(Error::Generation(format!("stream interrupted: {e}"))));
                }
                None => {
                    state.done = true;
                    match state.decoder.finish() {
                        Ok(Some(SseEvent::Content(text))) => state.ready.push_back(Ok(text)),
                        Ok(_) => {}
                        Err(e) => state.ready.push_back(Err(e)),
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Generator for ChatClient {
    async fn generate(&self, messages: &[Message]) -> Result<TokenStream> {
        let request = ChatRequest {
            model: self.model.as_deref(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: true,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            messages = messages.len(),
            "opening chat completion stream"
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "chat completion request failed");
            Error::Generation(format!("request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "LLM API error");
            return Err(Error::Generation(format!("LLM API error {status}: {body}")));
        }

        Ok(token_stream(response.bytes_stream()))
    }
}
