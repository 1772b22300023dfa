//! Sentence segmentation for streamed LLM output
//!
//! Tokens are appended to a buffer and only the newly appended suffix is
//! scanned for a terminal marker (`.`, `!`, `?` or a newline), optionally
//! followed by closing quotes or brackets. Abbreviations, decimals and
//! ellipses are not special-cased: every marker splits. Leading whitespace
//! is stripped from each sentence; the rest of its text is kept as generated.

use tokio_util::sync::CancellationToken;

/// One complete sentence (or the trailing fragment at end-of-stream)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    /// Zero-based position within the turn
    pub sequence: u32,
    /// Sentence text without leading whitespace
    pub text: String,
}

/// Characters that end a sentence
const TERMINALS: [char; 4] = ['.', '!', '?', '\n'];

/// Characters absorbed into a sentence when they directly follow a terminal
const CLOSERS: [char; 8] = ['"', '\'', ')', ']', '}', '\u{201D}', '\u{2019}', '\u{00BB}'];

/// Splits a token stream into sentences
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    next_sequence: u32,
    cancel: Option<CancellationToken>,
}

impl SentenceSegmenter {
    /// Create a segmenter with no cancellation attached
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a segmenter that drops all input once `cancel` fires
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Feed one fragment, returning every sentence it completes
    pub fn push(&mut self, fragment: &str) -> Vec<SentenceUnit> {
        if fragment.is_empty() || self.is_cancelled() {
            return Vec::new();
        }

        let mut scan_from = self.buffer.len();
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer, scan_from) {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            if let Some(unit) = self.emit(&sentence) {
                sentences.push(unit);
            }
            scan_from = 0;
        }
        sentences
    }

    /// Flush the trailing fragment at end-of-stream
    pub fn finish(&mut self) -> Option<SentenceUnit> {
        let rest = std::mem::take(&mut self.buffer);
        if self.is_cancelled() {
            return None;
        }
        self.emit(&rest)
    }

    /// Number of sentences emitted so far
    #[must_use]
    pub const fn emitted(&self) -> u32 {
        self.next_sequence
    }

    fn emit(&mut self, raw: &str) -> Option<SentenceUnit> {
        let text = raw.trim_start();
        if text.is_empty() {
            return None;
        }
        let unit = SentenceUnit {
            sequence: self.next_sequence,
            text: text.to_string(),
        };
        self.next_sequence += 1;
        Some(unit)
    }
}

/// Byte offset just past the first sentence boundary at or after `from`
fn find_boundary(buffer: &str, from: usize) -> Option<usize> {
    let tail = &buffer[from..];
    let (pos, marker) = tail.char_indices().find(|(_, c)| TERMINALS.contains(c))?;
    let mut end = from + pos + marker.len_utf8();
    for c in buffer[end..].chars() {
        if !CLOSERS.contains(&c) {
            break;
        }
        end += c.len_utf8();
    }
    Some(end)
}
