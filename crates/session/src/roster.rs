//! The participants of one session and their live status.

use chrono::Utc;
use conclave_core::error::SessionError;
use conclave_core::event::{DomainEvent, EventBus};
use conclave_core::participant::{Participant, ParticipantStatus, StatusTracker};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct Roster {
    session_id: String,
    participants: RwLock<Vec<Participant>>,
    events: Arc<EventBus>,
}

impl Roster {
    /// Fails if two participants share an id.
    pub fn new(
        session_id: impl Into<String>,
        participants: Vec<Participant>,
        events: Arc<EventBus>,
    ) -> Result<Self, SessionError> {
        let mut seen = HashSet::new();
        for p in &participants {
            if !seen.insert(p.id.as_str()) {
                return Err(SessionError::DuplicateParticipant(p.id.clone()));
            }
        }
        Ok(Self {
            session_id: session_id.into(),
            participants: RwLock::new(participants),
            events,
        })
    }

    /// A copy of every participant, in roster order.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.read().clone()
    }

    pub fn get(&self, participant_id: &str) -> Option<Participant> {
        self.participants
            .read()
            .iter()
            .find(|p| p.id == participant_id)
            .cloned()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.read().iter().any(|p| p.id == participant_id)
    }

    pub fn status(&self, participant_id: &str) -> Option<ParticipantStatus> {
        self.participants
            .read()
            .iter()
            .find(|p| p.id == participant_id)
            .map(|p| p.status)
    }

    pub fn len(&self) -> usize {
        self.participants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.read().is_empty()
    }
}

impl StatusTracker for Roster {
    fn set_status(&self, participant_id: &str, status: ParticipantStatus) {
        let changed = {
            let mut participants = self.participants.write();
            let Some(p) = participants.iter_mut().find(|p| p.id == participant_id) else {
                warn!(participant_id, "Status update for unknown participant");
                return;
            };
            let before = p.status;
            // A new run recovers from a previous failure
            if before == ParticipantStatus::Error && status != ParticipantStatus::Error {
                p.status = ParticipantStatus::Idle;
            }
            if let Err(e) = p.transition(status) {
                warn!(error = %e, "Rejected status change");
                return;
            }
            before != status
        };

        if changed {
            self.events.publish(DomainEvent::ParticipantStatusChanged {
                session_id: self.session_id.clone(),
                participant_id: participant_id.to_string(),
                status,
                timestamp: Utc::now(),
            });
        }
    }
}
