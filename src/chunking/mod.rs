//! Deterministic text chunking for the ingestion pipeline.
//!
//! Splits normalized document text into overlapping fragments of bounded
//! size. Chunk boundaries prefer paragraph and sentence breaks over hard
//! truncation, but identical input and parameters always produce identical
//! output so re-ingestion of an unchanged document is idempotent.

use crate::config::ChunkingSettings;
use crate::error::{KildeError, Result};

/// A chunker configured with size and overlap parameters.
#[derive(Debug, Clone)]
pub struct TextChunker {
    max_chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    /// Create a chunker. `overlap` must be smaller than `max_chunk_size`.
    pub fn new(max_chunk_size: usize, overlap: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(KildeError::Chunking(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        if overlap >= max_chunk_size {
            return Err(KildeError::Chunking(format!(
                "overlap ({}) must be smaller than max_chunk_size ({})",
                overlap, max_chunk_size
            )));
        }
        Ok(Self {
            max_chunk_size,
            overlap,
        })
    }

    /// Create a chunker from configuration.
    pub fn from_settings(settings: &ChunkingSettings) -> Result<Self> {
        Self::new(settings.max_chunk_size, settings.overlap)
    }

    /// Split text into ordered, overlapping chunks.
    ///
    /// Empty or whitespace-only input yields an empty sequence, not an error.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        chunk_text(text, self.max_chunk_size, self.overlap)
    }
}

/// Split `text` into ordered chunks of at most `max_chunk_size` characters,
/// with `overlap` characters carried between consecutive chunks.
///
/// Sizes are counted in characters, not bytes, so multi-byte input never
/// splits inside a code point. Callers validate `overlap < max_chunk_size`
/// via [`TextChunker::new`]; this function assumes it.
pub fn chunk_text(text: &str, max_chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let hard_end = (start + max_chunk_size).min(total);

        let end = if hard_end < total {
            // Prefer a natural break in the back half of the window.
            let search_from = start + max_chunk_size / 2;
            find_soft_break(&chars, search_from, hard_end).unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            chunks.push(piece);
        }

        if end >= total {
            break;
        }
        // Overlap with the previous chunk, always making forward progress.
        start = (end.saturating_sub(overlap)).max(start + 1);
    }

    chunks
}

/// Find the best break position in `chars[from..to]`, scanning backwards.
/// Paragraph breaks win over sentence ends, sentence ends over whitespace.
/// Returns the exclusive end position of the chunk, or None for a hard cut.
fn find_soft_break(chars: &[char], from: usize, to: usize) -> Option<usize> {
    if from >= to {
        return None;
    }

    // Paragraph break: "\n\n" — end the chunk after the blank line.
    for i in (from..to).rev() {
        if chars[i] == '\n' && i > 0 && chars[i - 1] == '\n' {
            return Some(i + 1);
        }
    }

    // Sentence end: terminator followed by whitespace.
    for i in (from..to.saturating_sub(1)).rev() {
        if matches!(chars[i], '.' | '!' | '?') && chars[i + 1].is_whitespace() {
            return Some(i + 1);
        }
    }

    // Any whitespace beats cutting a word in half.
    for i in (from..to).rev() {
        if chars[i].is_whitespace() {
            return Some(i + 1);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("", 500, 50).is_empty());
        assert!(chunk_text("   \n\t ", 500, 50).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = chunk_text("hello world", 500, 50);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_max() {
        assert!(TextChunker::new(100, 100).is_err());
        assert!(TextChunker::new(0, 0).is_err());
        assert!(TextChunker::new(100, 99).is_ok());
    }

    #[test]
    fn test_1200_chars_at_500_50_gives_three_overlapping_chunks() {
        // Unbroken text forces hard cuts at 0..500, 450..950, 900..1200.
        let text: String = "abcdefghij".repeat(120);
        assert_eq!(text.chars().count(), 1200);

        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 500);
        assert_eq!(chunks[1].chars().count(), 500);
        assert_eq!(chunks[2].chars().count(), 300);

        // The tail of each chunk reappears at the head of the next.
        let tail: String = chunks[0].chars().skip(450).collect();
        assert!(chunks[1].starts_with(&tail));
        let tail: String = chunks[1].chars().skip(450).collect();
        assert!(chunks[2].starts_with(&tail));
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = format!("{}\n\n{}", "a".repeat(400), "b".repeat(400));
        let chunks = chunk_text(&text, 500, 50);
        // First chunk ends at the paragraph break, not at a hard 500 cut.
        assert!(chunks[0].trim_end().chars().all(|c| c == 'a'));
        assert!(chunks.last().unwrap().contains('b'));
    }

    #[test]
    fn test_prefers_sentence_break() {
        let text = format!("{}. {}", "word ".repeat(80).trim_end(), "tail ".repeat(80));
        let chunks = chunk_text(&text, 450, 20);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn test_no_empty_chunks() {
        let text = format!("{}\n\n\n\n{}", "x".repeat(10), " ".repeat(600));
        for chunk in chunk_text(&text, 500, 50) {
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "The quick brown fox. ".repeat(100);
        let a = chunk_text(&text, 300, 30);
        let b = chunk_text(&text, 300, 30);
        assert_eq!(a, b);
    }

    #[test]
    fn test_multibyte_input_does_not_panic() {
        let text = "æøå ".repeat(400);
        let chunks = chunk_text(&text, 100, 10);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }
}
