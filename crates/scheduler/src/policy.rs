//! Speaking-mode policies.

use conclave_core::error::SessionError;
use conclave_core::participant::{Participant, ParticipantRole};
use conclave_core::session::SpeakingMode;
use rand::SeedableRng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::debug;

use crate::flow_lock::FlowLockTimer;
use crate::scorer::{RelevanceScorer, TagOverlapScorer};

/// Decides which participants answer a message.
///
/// Automatic modes (`sequential`, `random`, `weighted-random`, `consensus`)
/// never pick observers. `mention` and `keyword` may legitimately select
/// nobody, and `invitation` always does.
pub struct TurnScheduler {
    mode: SpeakingMode,
    /// Next round-robin position among auto-selectable participants
    cursor: usize,
    rng: StdRng,
    scorer: Arc<dyn RelevanceScorer>,
    flow_lock: Option<FlowLockTimer>,
}

impl TurnScheduler {
    pub fn new(mode: SpeakingMode) -> Self {
        Self {
            mode,
            cursor: 0,
            rng: StdRng::from_os_rng(),
            scorer: Arc::new(TagOverlapScorer),
            flow_lock: None,
        }
    }

    /// Use a deterministic random source.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_flow_lock(mut self, timer: FlowLockTimer) -> Self {
        self.flow_lock = Some(timer);
        self
    }

    pub fn mode(&self) -> SpeakingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SpeakingMode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, "Speaking mode changed");
            self.mode = mode;
            self.cursor = 0;
        }
    }

    pub fn flow_lock(&self) -> Option<&FlowLockTimer> {
        self.flow_lock.as_ref()
    }

    /// Record that a turn completed: the idle clock starts over.
    pub fn note_activity(&self) {
        if let Some(timer) = &self.flow_lock {
            timer.reset();
        }
    }

    /// Participant ids that should answer `message`, in speaking order.
    pub fn select_next(&mut self, message: &str, participants: &[Participant]) -> Vec<String> {
        let selected = match self.mode {
            SpeakingMode::Sequential => self.next_in_rotation(participants).into_iter().collect(),
            SpeakingMode::Random => self.pick_uniform(participants).into_iter().collect(),
            SpeakingMode::WeightedRandom => {
                self.pick_weighted(message, participants).into_iter().collect()
            }
            SpeakingMode::Mention => mentioned(message, participants),
            SpeakingMode::Keyword => keyword_matches(message, participants),
            SpeakingMode::Invitation => Vec::new(),
            SpeakingMode::Consensus => participants
                .iter()
                .filter(|p| p.auto_selectable())
                .map(|p| p.id.clone())
                .collect(),
        };
        debug!(mode = %self.mode, selected = ?selected, "Selected speakers");
        selected
    }

    /// Check that `participant_id` may be invited to speak.
    pub fn validate_invitation(
        &self,
        session_id: &str,
        participant_id: &str,
        participants: &[Participant],
    ) -> Result<(), SessionError> {
        if participants.iter().any(|p| p.id == participant_id) {
            Ok(())
        } else {
            Err(SessionError::UnknownParticipant {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            })
        }
    }

    /// Who breaks a silence: the first host if there is one, else anyone
    /// auto-selectable at random.
    pub fn select_flow_lock_speaker(&mut self, participants: &[Participant]) -> Option<String> {
        participants
            .iter()
            .find(|p| p.role == ParticipantRole::Host)
            .map(|p| p.id.clone())
            .or_else(|| self.pick_uniform(participants))
    }

    fn next_in_rotation(&mut self, participants: &[Participant]) -> Option<String> {
        let eligible: Vec<&Participant> =
            participants.iter().filter(|p| p.auto_selectable()).collect();
        if eligible.is_empty() {
            return None;
        }
        let chosen = eligible[self.cursor % eligible.len()];
        self.cursor = (self.cursor + 1) % eligible.len();
        Some(chosen.id.clone())
    }

    fn pick_uniform(&mut self, participants: &[Participant]) -> Option<String> {
        let eligible: Vec<&Participant> =
            participants.iter().filter(|p| p.auto_selectable()).collect();
        eligible.choose(&mut self.rng).map(|p| p.id.clone())
    }

    fn pick_weighted(&mut self, message: &str, participants: &[Participant]) -> Option<String> {
        let eligible: Vec<&Participant> =
            participants.iter().filter(|p| p.auto_selectable()).collect();
        let weights: Vec<f64> = eligible
            .iter()
            .map(|p| {
                let score = self.scorer.score(p, message);
                if score.is_finite() && score > 0.0 { score } else { 0.0 }
            })
            .collect();

        match WeightedIndex::new(&weights) {
            Ok(dist) => Some(eligible[dist.sample(&mut self.rng)].id.clone()),
            // All weights zero (or nobody eligible)
            Err(_) => eligible.choose(&mut self.rng).map(|p| p.id.clone()),
        }
    }
}

/// Participants addressed as `@display name` or `@id`, ordered by first mention.
fn mentioned(message: &str, participants: &[Participant]) -> Vec<String> {
    let lower = message.to_lowercase();
    let mut hits: Vec<(usize, &Participant)> = participants
        .iter()
        .filter_map(|p| {
            [p.display_name.as_str(), p.id.as_str()]
                .into_iter()
                .filter_map(|name| first_mention(&lower, name))
                .min()
                .map(|pos| (pos, p))
        })
        .collect();
    hits.sort_by_key(|(pos, _)| *pos);
    hits.into_iter().map(|(_, p)| p.id.clone()).collect()
}

fn first_mention(lower_message: &str, name: &str) -> Option<usize> {
    if name.is_empty() {
        return None;
    }
    let needle = format!("@{}", name.to_lowercase());
    lower_message.match_indices(&needle).find_map(|(pos, _)| {
        let boundary = lower_message[pos + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric() && c != '_');
        boundary.then_some(pos)
    })
}

/// Participants with at least one keyword present in the message, in roster order.
fn keyword_matches(message: &str, participants: &[Participant]) -> Vec<String> {
    let lower = message.to_lowercase();
    participants
        .iter()
        .filter(|p| {
            p.keywords
                .iter()
                .any(|k| !k.trim().is_empty() && lower.contains(&k.trim().to_lowercase()))
        })
        .map(|p| p.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel() -> Vec<Participant> {
        vec![
            Participant::new("alice", "Alice").with_tags(["rust"]).with_keywords(["borrow"]),
            Participant::new("bob", "Bob").with_tags(["python"]).with_keywords(["pip", "venv"]),
            Participant::new("carol", "Carol")
                .with_role(ParticipantRole::Observer)
                .with_keywords(["notes"]),
        ]
    }

    #[test]
    fn sequential_rotates_and_skips_observers() {
        let mut s = TurnScheduler::new(SpeakingMode::Sequential);
        let p = panel();
        let picks: Vec<Vec<String>> = (0..4).map(|_| s.select_next("hi", &p)).collect();
        assert_eq!(picks, vec![vec!["alice"], vec!["bob"], vec!["alice"], vec!["bob"]]);
    }

    #[test]
    fn mode_change_restarts_rotation() {
        let mut s = TurnScheduler::new(SpeakingMode::Sequential);
        let p = panel();
        s.select_next("hi", &p);
        s.set_mode(SpeakingMode::Consensus);
        s.set_mode(SpeakingMode::Sequential);
        assert_eq!(s.select_next("hi", &p), vec!["alice"]);
    }

    #[test]
    fn mention_selects_only_addressed() {
        let mut s = TurnScheduler::new(SpeakingMode::Mention);
        assert_eq!(s.select_next("@Alice what do you think?", &panel()), vec!["alice"]);
    }

    #[test]
    fn mention_orders_by_position_and_reaches_observers() {
        let mut s = TurnScheduler::new(SpeakingMode::Mention);
        let picked = s.select_next("@carol take notes, then @bob and @ALICE", &panel());
        assert_eq!(picked, vec!["carol", "bob", "alice"]);
    }

    #[test]
    fn mention_requires_word_boundary() {
        let mut s = TurnScheduler::new(SpeakingMode::Mention);
        assert!(s.select_next("@bobby are you there", &panel()).is_empty());
        assert!(s.select_next("no mentions at all", &panel()).is_empty());
    }

    #[test]
    fn mention_matches_multi_word_display_names() {
        let mut s = TurnScheduler::new(SpeakingMode::Mention);
        let p = vec![Participant::new("drx", "Dr. Xu"), Participant::new("bob", "Bob")];
        assert_eq!(s.select_next("@Dr. Xu, thoughts?", &p), vec!["drx"]);
    }

    #[test]
    fn keyword_matches_in_roster_order() {
        let mut s = TurnScheduler::new(SpeakingMode::Keyword);
        let p = panel();
        assert_eq!(s.select_next("PIP fights the BORROW checker", &p), vec!["alice", "bob"]);
        assert_eq!(s.select_next("keep notes", &p), vec!["carol"]);
        assert!(s.select_next("unrelated", &p).is_empty());
    }

    #[test]
    fn invitation_selects_nobody() {
        let mut s = TurnScheduler::new(SpeakingMode::Invitation);
        assert!(s.select_next("@Alice hello", &panel()).is_empty());
    }

    #[test]
    fn consensus_selects_every_non_observer() {
        let mut s = TurnScheduler::new(SpeakingMode::Consensus);
        assert_eq!(s.select_next("all of you", &panel()), vec!["alice", "bob"]);
    }

    #[test]
    fn random_never_picks_observers() {
        let mut s = TurnScheduler::new(SpeakingMode::Random).with_seed(7);
        let p = panel();
        for _ in 0..50 {
            let picked = s.select_next("hi", &p);
            assert_eq!(picked.len(), 1);
            assert_ne!(picked[0], "carol");
        }
    }

    #[test]
    fn random_with_only_observers_selects_nobody() {
        let mut s = TurnScheduler::new(SpeakingMode::Random);
        let p = vec![Participant::new("o", "O").with_role(ParticipantRole::Observer)];
        assert!(s.select_next("hi", &p).is_empty());
        assert!(s.select_flow_lock_speaker(&p).is_none());
    }

    struct OnlyBob;

    impl RelevanceScorer for OnlyBob {
        fn score(&self, participant: &Participant, _message: &str) -> f64 {
            if participant.id == "bob" { 1.0 } else { 0.0 }
        }
    }

    #[test]
    fn weighted_random_follows_scorer() {
        let mut s = TurnScheduler::new(SpeakingMode::WeightedRandom)
            .with_seed(1)
            .with_scorer(Arc::new(OnlyBob));
        let p = panel();
        for _ in 0..20 {
            assert_eq!(s.select_next("anything", &p), vec!["bob"]);
        }
    }

    struct Nobody;

    impl RelevanceScorer for Nobody {
        fn score(&self, _participant: &Participant, _message: &str) -> f64 {
            f64::NAN
        }
    }

    #[test]
    fn weighted_random_falls_back_to_uniform() {
        let mut s = TurnScheduler::new(SpeakingMode::WeightedRandom)
            .with_seed(3)
            .with_scorer(Arc::new(Nobody));
        let picked = s.select_next("x", &panel());
        assert_eq!(picked.len(), 1);
        assert_ne!(picked[0], "carol");
    }

    #[test]
    fn flow_lock_prefers_host() {
        let mut s = TurnScheduler::new(SpeakingMode::Sequential);
        let mut p = panel();
        p[1].role = ParticipantRole::Host;
        for _ in 0..10 {
            assert_eq!(s.select_flow_lock_speaker(&p).as_deref(), Some("bob"));
        }
    }

    #[test]
    fn flow_lock_without_host_picks_non_observer() {
        let mut s = TurnScheduler::new(SpeakingMode::Sequential).with_seed(11);
        let p = panel();
        for _ in 0..20 {
            let picked = s.select_flow_lock_speaker(&p).unwrap();
            assert!(picked == "alice" || picked == "bob");
        }
    }

    #[test]
    fn invitation_requires_known_participant() {
        let s = TurnScheduler::new(SpeakingMode::Invitation);
        let p = panel();
        assert!(s.validate_invitation("s1", "carol", &p).is_ok());
        assert!(matches!(
            s.validate_invitation("s1", "zed", &p),
            Err(SessionError::UnknownParticipant { .. })
        ));
    }
}
