//! Query-time retrieval and context assembly.

mod context;

pub use context::{AssembledContext, ContextAssembler, UsedSource};

/// Estimate the token cost of a piece of text.
///
/// Uses the common ~4 characters per token heuristic for English prose.
/// Budget enforcement only needs a consistent upper-bound estimate, not a
/// tokenizer-exact count.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        // Four multi-byte characters estimate like four ASCII ones.
        assert_eq!(estimate_tokens("åååå"), 1);
    }
}
