use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::models::{AlertDecision, PatternKind, StrugglePattern};

/// Cooldown bookkeeping for one student. Survives history eviction so a gap
/// in activity never resets an active cooldown.
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    last_alert: HashMap<PatternKind, DateTime<Utc>>,
    alert_counts: HashMap<PatternKind, u32>,
}

impl ThrottleState {
    pub fn last_alert(&self, kind: PatternKind) -> Option<DateTime<Utc>> {
        self.last_alert.get(&kind).copied()
    }

    pub fn alerts_sent(&self, kind: PatternKind) -> u32 {
        self.alert_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Called only after the alert row is durably written.
    pub fn note_alert(&mut self, kind: PatternKind, at: DateTime<Utc>) {
        self.last_alert.insert(kind, at);
        *self.alert_counts.entry(kind).or_insert(0) += 1;
    }
}

pub fn evaluate(
    pattern: &StrugglePattern,
    state: &ThrottleState,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> AlertDecision {
    if pattern.severity < config.low_severity {
        return AlertDecision::Suppress;
    }

    if let Some(last) = state.last_alert(pattern.kind) {
        if now - last < config.cooldown() {
            return AlertDecision::Suppress;
        }
    }

    if pattern.severity < config.high_severity {
        return AlertDecision::QueueIntervention;
    }

    AlertDecision::EmitAlert
}
