use std::time::Duration;

/// How single-value answers are split into fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Upper bound on characters per fragment.
    pub max_chars: usize,
    /// Pause between fragments of a chunked answer. Zero sends them back to back.
    pub pace: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 48,
            pace: Duration::ZERO,
        }
    }
}

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Each piece ends just after the last whitespace inside its window when
/// there is one, so words are not split unless a single word is longer than
/// the window. Splits always fall on char boundaries and the pieces
/// concatenate back to `text`. The same input always yields the same pieces.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(i, _)| i);
        if hard_end == rest.len() {
            chunks.push(rest.to_owned());
            break;
        }

        let end = rest[..hard_end]
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map_or(hard_end, |(i, c)| i + c.len_utf8());
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_owned());
        rest = tail;
    }

    chunks
}
