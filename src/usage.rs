//! Best-effort token accounting for agents that do not report usage.
//!
//! The estimate is deliberately simple: whitespace-delimited words, with a
//! small correction for long words (roughly one extra token per 4 characters
//! beyond the first 4). It exists so that audit records and `usage` blocks
//! are populated even for agents that never emit counts; it makes no claim
//! of matching any provider's tokenizer.

use serde::{Deserialize, Serialize};

/// Token counts attached to a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Estimate the token count of a single text.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut tokens: u32 = 0;
    for word in text.split_whitespace() {
        let chars = word.chars().count() as u32;
        tokens += 1 + chars.saturating_sub(4) / 4;
    }
    tokens
}

/// Estimate the prompt-side token count of a message list, given the
/// concatenated content of each message.
pub fn estimate_prompt_tokens<'a>(contents: impl IntoIterator<Item = &'a str>) -> u32 {
    contents.into_iter().map(estimate_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t"), 0);
    }

    #[test]
    fn short_words_count_once() {
        assert_eq!(estimate_tokens("hi there you"), 3);
    }

    #[test]
    fn long_words_count_extra() {
        // 12 chars -> 1 + (12-4)/4 = 3
        assert_eq!(estimate_tokens("antidisestab"), 3);
    }

    #[test]
    fn estimate_is_deterministic() {
        let text = "the quick brown fox jumps over the lazy dog";
        assert_eq!(estimate_tokens(text), estimate_tokens(text));
    }

    #[test]
    fn prompt_estimate_sums_messages() {
        let total = estimate_prompt_tokens(["hello world", "how are you"]);
        assert_eq!(total, 5);
    }

    #[test]
    fn usage_totals_add_up() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
