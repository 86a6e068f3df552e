//! Sentence-aligned text chunking.
//!
//! Narration text is split into chunks that each become one synthesis
//! request. Chunks never break a sentence, so a sentence longer than the
//! budget becomes a chunk of its own.

/// One contiguous piece of the narration text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

impl TextChunk {
    /// True when there is nothing worth sending to the synthesizer.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

const fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

/// Split `text` into sentences, keeping each terminator run with its sentence.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_terminators = false;

    for (i, c) in text.char_indices() {
        if is_terminator(c) {
            in_terminators = true;
        } else if in_terminators {
            out.push(&text[start..i]);
            start = i;
            in_terminators = false;
        }
    }

    if start < text.len() {
        out.push(&text[start..]);
    }

    out
}

/// Split `text` into chunks of at most `budget` characters.
///
/// Empty or whitespace-only input yields a single empty chunk.
#[must_use]
pub fn split(text: &str, budget: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return vec![TextChunk {
            index: 0,
            text: String::new(),
        }];
    }

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in sentences(text) {
        let sentence_chars = sentence.chars().count();

        if current_chars > 0 && current_chars + sentence_chars > budget {
            chunks.push(TextChunk {
                index: chunks.len(),
                text: std::mem::take(&mut current),
            });
            current_chars = 0;
        }

        current.push_str(sentence);
        current_chars += sentence_chars;
    }

    if !current.is_empty() {
        chunks.push(TextChunk {
            index: chunks.len(),
            text: current,
        });
    }

    chunks
}
