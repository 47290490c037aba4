//! Fallback heuristics used when no model function is available.

use crate::core::types::HistoryEntry;

/// Phrases that suggest an observation reports the goal as done.
pub const DEFAULT_GOAL_KEYWORDS: [&str; 6] = [
    "goal achieved",
    "goal has been achieved",
    "task complete",
    "task completed",
    "successfully completed",
    "final answer",
];

/// Plan-execute fallback: enough successful actions means done.
pub fn enough_successes(history: &[HistoryEntry], threshold: usize) -> bool {
    history.iter().filter(|entry| entry.is_success).count() >= threshold
}

/// ReAct fallback: the last observation mentions a completion phrase.
pub fn mentions_goal_achieved<S: AsRef<str>>(observation: &str, keywords: &[S]) -> bool {
    let lowered = observation.to_lowercase();
    keywords
        .iter()
        .any(|keyword| lowered.contains(&keyword.as_ref().to_lowercase()))
}

/// Local token estimate used when no backend can count: about 4 tokens per
/// 3 words, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words * 4).div_ceil(3)
}
