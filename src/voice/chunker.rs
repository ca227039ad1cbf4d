//! # Response Chunking
//!
//! Splits a reply into at most `max_chunks` sentence-aligned pieces so audio can
//! start playing after the first sentence is synthesized, while keeping the
//! number of synthesis calls (and end-of-turn jitter) bounded.
//!
//! ## Rules:
//! - Sentences end at `.`, `!`, `?`, `।` or a newline. Runs of terminators
//!   (`...`, `?!`) and closing quotes stay with their sentence. A terminator
//!   directly followed by a non-space character (`3.5`, `e.g.x`) does not split,
//!   nor does the period of a title such as `Dr.`.
//! - A trailing sentence without terminal punctuation is still emitted.
//! - Up to `max_chunks` sentences become one chunk each; more are spread over
//!   exactly `max_chunks` chunks as evenly as possible, extra sentences going to
//!   the earliest chunks.

/// One sentence-aligned unit of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub index: usize,
    pub total: usize,
    pub text: String,
}

impl ResponseChunk {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '।')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | '”' | '’' | '»')
}

const TITLES: &[&str] = &["dr.", "mr.", "mrs.", "ms.", "prof.", "st."];

fn ends_with_title(current: &str) -> bool {
    current
        .rsplit(char::is_whitespace)
        .next()
        .map_or(false, |word| TITLES.contains(&word.to_lowercase().as_str()))
}

fn flush(current: &mut String, sentences: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Split text into trimmed, non-empty sentences in original order.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            flush(&mut current, &mut sentences);
            continue;
        }

        current.push(c);
        if !is_terminator(c) {
            continue;
        }

        while let Some(&next) = chars.peek() {
            if is_terminator(next) || is_closer(next) {
                current.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if chars.peek().map_or(true, |next| next.is_whitespace()) && !ends_with_title(&current) {
            flush(&mut current, &mut sentences);
        }
    }

    flush(&mut current, &mut sentences);
    sentences
}

/// Groups sentences into a bounded number of chunks.
#[derive(Debug, Clone, Copy)]
pub struct ResponseChunker {
    max_chunks: usize,
}

impl ResponseChunker {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            max_chunks: max_chunks.max(1),
        }
    }

    /// Split `text` into chunks. Blank text yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<ResponseChunk> {
        let sentences = split_sentences(text);
        let groups = self.group(sentences);
        let total = groups.len();

        groups
            .into_iter()
            .enumerate()
            .map(|(index, text)| ResponseChunk { index, total, text })
            .collect()
    }

    fn group(&self, sentences: Vec<String>) -> Vec<String> {
        if sentences.len() <= self.max_chunks {
            return sentences;
        }

        let base = sentences.len() / self.max_chunks;
        let extra = sentences.len() % self.max_chunks;
        let mut remaining = sentences.into_iter();

        (0..self.max_chunks)
            .map(|i| {
                let size = base + usize::from(i < extra);
                remaining.by_ref().take(size).collect::<Vec<_>>().join(" ")
            })
            .collect()
    }
}

impl Default for ResponseChunker {
    fn default() -> Self {
        Self::new(3)
    }
}
