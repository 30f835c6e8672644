//! Relevance scoring for weighted-random selection.

use conclave_core::participant::Participant;
use std::collections::HashSet;

/// Scores how relevant a participant is to a message.
///
/// Scores are selection weights: larger means more likely. A score that
/// is not finite or not positive excludes the participant from the draw.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, participant: &Participant, message: &str) -> f64;
}

/// Weight = 1 + the number of the participant's tags that occur as words in
/// the message. Everyone keeps a baseline chance.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagOverlapScorer;

impl RelevanceScorer for TagOverlapScorer {
    fn score(&self, participant: &Participant, message: &str) -> f64 {
        let words = message_words(message);
        let overlap = participant
            .tags
            .iter()
            .filter(|tag| words.contains(&tag.to_lowercase()))
            .count();
        1.0 + overlap as f64
    }
}

/// Lowercased alphanumeric words of `text`.
pub fn message_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
