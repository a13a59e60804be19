//! Token estimation for prompt budgeting.

use relay_kernel::ConversationTurn;

/// Fixed per-message framing cost (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 3;

/// Approximate tokens per whitespace-separated word.
const TOKENS_PER_WORD: f64 = 1.3;

/// Pluggable token counting.
///
/// Estimates only need to be consistent, not exact: the assembler compares
/// them against a model's declared context window.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> u32;

    fn estimate_turn(&self, turn: &ConversationTurn) -> u32 {
        self.estimate_text(&turn.text) + MESSAGE_OVERHEAD_TOKENS
    }

    fn estimate_turns(&self, turns: &[ConversationTurn]) -> u32 {
        turns.iter().map(|t| self.estimate_turn(t)).sum()
    }
}

/// Word count times 1.3, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordBasedEstimator;

impl TokenEstimator for WordBasedEstimator {
    fn estimate_text(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count();
        (words as f64 * TOKENS_PER_WORD).ceil() as u32
    }
}
