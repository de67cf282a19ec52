use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ActorKey, InteractionEvent, InteractionKind};

/// Rolling per-student event window. Entries stay timestamp-ordered and the
/// buffer never grows past its cap; the oldest entries give way first.
#[derive(Debug)]
pub struct InteractionHistory {
    events: VecDeque<InteractionEvent>,
    cap: usize,
}

impl InteractionHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
        }
    }

    pub fn record(&mut self, event: InteractionEvent) {
        let pos = self
            .events
            .iter()
            .rposition(|existing| existing.occurred_at <= event.occurred_at)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        self.events.insert(pos, event);
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
    }

    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        while let Some(front) = self.events.front() {
            if front.occurred_at >= cutoff {
                break;
            }
            self.events.pop_front();
        }
        before - self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InteractionEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Checks an inbound event against the owning actor's key and clamps small
/// clock skew. Events further in the future than the tolerance are rejected
/// rather than recorded at a fictional time.
pub fn validate_event(
    event: &mut InteractionEvent,
    key: &ActorKey,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<(), EngineError> {
    if event.student_id != key.student_id || event.course_id != key.course_id {
        return Err(EngineError::Validation(
            "event does not belong to this student/course".into(),
        ));
    }
    if event.course_id.trim().is_empty() {
        return Err(EngineError::Validation("course_id is empty".into()));
    }
    if event.kind == InteractionKind::AssessmentAttempt && event.correct.is_none() {
        return Err(EngineError::Validation(
            "assessment attempt is missing the correct flag".into(),
        ));
    }
    if let Some(confidence) = event.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::Validation(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
    }
    if let Some(spent) = event.time_spent_ms {
        if spent < 0 {
            return Err(EngineError::Validation(format!(
                "negative time_spent_ms {spent}"
            )));
        }
    }
    if event.occurred_at > now + config.future_skew() {
        return Err(EngineError::Validation(
            "timestamp is too far in the future".into(),
        ));
    }
    if event.occurred_at > now {
        event.occurred_at = now;
    }
    Ok(())
}
