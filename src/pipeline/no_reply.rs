//! "No reply" sentinel detection
//!
//! The assistant may answer with a designated sentinel (e.g. `NO_REPLY`) to
//! stay silent. Matching is an exact comparison against the whole response
//! with whitespace removed and case folded, never a substring check.

use super::SentenceUnit;

/// Fold text for sentinel comparison
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Whether `text` is exactly the sentinel, ignoring case and whitespace
#[must_use]
pub fn is_no_reply(text: &str, sentinel: &str) -> bool {
    let text = normalize(text);
    !text.is_empty() && text == normalize(sentinel)
}

/// Holds sentences back while the response could still be the sentinel
///
/// As long as the accumulated response is a prefix of the sentinel, sentences
/// are parked. The first fragment that diverges releases them and every later
/// sentence passes straight through.
#[derive(Debug)]
pub struct NoReplyGate {
    sentinel: String,
    seen: String,
    held: Vec<SentenceUnit>,
    open: bool,
}

impl NoReplyGate {
    /// Create a gate for the given sentinel
    #[must_use]
    pub fn new(sentinel: &str) -> Self {
        Self {
            sentinel: normalize(sentinel),
            seen: String::new(),
            held: Vec::new(),
            open: false,
        }
    }

    /// Record a generated fragment
    pub fn observe(&mut self, fragment: &str) {
        if self.open {
            return;
        }
        self.seen.push_str(&normalize(fragment));
        if !self.sentinel.starts_with(&self.seen) {
            self.open = true;
        }
    }

    /// Offer freshly segmented sentences, returning those safe to synthesize
    pub fn offer(&mut self, units: Vec<SentenceUnit>) -> Vec<SentenceUnit> {
        if self.open {
            if self.held.is_empty() {
                return units;
            }
            let mut released = std::mem::take(&mut self.held);
            released.extend(units);
            return released;
        }
        self.held.extend(units);
        Vec::new()
    }

    /// Resolve at end of generation
    ///
    /// Returns `None` when the full response was the sentinel (held sentences
    /// are discarded), otherwise the sentences still parked.
    pub fn finish(&mut self) -> Option<Vec<SentenceUnit>> {
        let held = std::mem::take(&mut self.held);
        if !self.open && is_no_reply(&self.seen, &self.sentinel) {
            return None;
        }
        Some(held)
    }

    /// Whether sentences are currently flowing through
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }
}
