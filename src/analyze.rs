use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::history::InteractionHistory;
use crate::models::{InteractionEvent, InteractionKind, PatternKind, StrugglePattern};

/// Runs every detection heuristic over the current window. Pure: the caller
/// supplies `now`, so the same history and clock always produce the same
/// pattern list.
pub fn analyze(
    history: &InteractionHistory,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<StrugglePattern> {
    if history.is_empty() {
        return Vec::new();
    }

    let events: Vec<&InteractionEvent> = history.iter().collect();
    let mut patterns = Vec::new();

    let mut concepts: Vec<&str> = events
        .iter()
        .filter(|event| event.kind == InteractionKind::AssessmentAttempt)
        .filter_map(|event| event.concept_id.as_deref())
        .collect();
    concepts.sort_unstable();
    concepts.dedup();

    for concept in &concepts {
        if let Some(pattern) = detect_repeated_errors(&events, concept, config, now) {
            patterns.push(pattern);
        }
    }
    for concept in &concepts {
        if let Some(pattern) = detect_increasing_time(&events, concept, config, now) {
            patterns.push(pattern);
        }
    }
    if let Some(pattern) = detect_confidence_drop(&events, config, now) {
        patterns.push(pattern);
    }
    if let Some(pattern) = detect_help_seeking(&events, config, now) {
        patterns.push(pattern);
    }

    patterns
}

pub fn recency_weight(minutes_ago: i64) -> f64 {
    match minutes_ago {
        i64::MIN..=5 => 1.0,
        6..=30 => 0.85,
        31..=120 => 0.7,
        _ => 0.5,
    }
}

fn detect_repeated_errors(
    events: &[&InteractionEvent],
    concept: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StrugglePattern> {
    let attempts: Vec<&&InteractionEvent> = events
        .iter()
        .filter(|event| {
            event.kind == InteractionKind::AssessmentAttempt
                && event.concept_id.as_deref() == Some(concept)
        })
        .collect();

    let start = attempts.len().saturating_sub(config.error_window);
    let recent = &attempts[start..];
    let streak = recent
        .iter()
        .rev()
        .take_while(|event| event.correct == Some(false))
        .count();

    if streak < config.error_streak_threshold.max(1) {
        return None;
    }

    let latest = recent.last()?;
    let minutes_ago = (now - latest.occurred_at).num_minutes();
    let base = 0.3 + 0.15 * streak as f64;
    let severity = (base * recency_weight(minutes_ago)).clamp(0.0, 1.0);

    Some(StrugglePattern {
        kind: PatternKind::RepeatedErrors,
        concept_id: Some(concept.to_string()),
        severity,
        evidence_count: streak,
        detected_at: now,
    })
}

fn detect_increasing_time(
    events: &[&InteractionEvent],
    concept: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StrugglePattern> {
    let window = config.trend_window.max(2);
    let times: Vec<i64> = events
        .iter()
        .filter(|event| {
            event.kind == InteractionKind::AssessmentAttempt
                && event.concept_id.as_deref() == Some(concept)
        })
        .filter_map(|event| event.time_spent_ms)
        .collect();

    if times.len() < window {
        return None;
    }

    let recent = &times[times.len() - window..];
    let monotone = recent.windows(2).all(|pair| pair[1] > pair[0]);
    let first = recent[0];
    if !monotone || first <= 0 {
        return None;
    }

    let last = recent[recent.len() - 1];
    let growth = (last - first) as f64 / first as f64;
    let severity = (0.25 + growth * 0.35).clamp(0.0, 1.0);

    Some(StrugglePattern {
        kind: PatternKind::IncreasingTime,
        concept_id: Some(concept.to_string()),
        severity,
        evidence_count: recent.len(),
        detected_at: now,
    })
}

fn detect_confidence_drop(
    events: &[&InteractionEvent],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StrugglePattern> {
    let window = config.trend_window.max(2);
    let chats: Vec<&&InteractionEvent> = events
        .iter()
        .filter(|event| event.kind == InteractionKind::ChatMessage && event.confidence.is_some())
        .collect();

    if chats.len() < window {
        return None;
    }

    let recent = &chats[chats.len() - window..];
    let declining = recent.windows(2).all(|pair| {
        pair[1].confidence.unwrap_or(0.0) <= pair[0].confidence.unwrap_or(0.0)
    });
    let first = recent[0].confidence.unwrap_or(0.0);
    let last = recent[recent.len() - 1].confidence.unwrap_or(0.0);
    let drop = first - last;

    if !declining || drop <= 0.0 {
        return None;
    }

    let negative_tone = recent
        .iter()
        .any(|event| event.sentiment.map_or(false, |s| s.is_negative()));
    let bonus = if negative_tone { 0.15 } else { 0.0 };
    let severity = (drop * 1.2 + bonus).clamp(0.0, 1.0);

    Some(StrugglePattern {
        kind: PatternKind::ConfidenceDrop,
        concept_id: None,
        severity,
        evidence_count: recent.len(),
        detected_at: now,
    })
}

fn detect_help_seeking(
    events: &[&InteractionEvent],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<StrugglePattern> {
    let cutoff = now - config.help_seeking_window();
    let count = events
        .iter()
        .filter(|event| event.occurred_at >= cutoff)
        .filter(|event| match event.kind {
            InteractionKind::HintRequest => true,
            InteractionKind::ChatMessage => {
                event.sentiment.map_or(false, |s| s.is_negative())
            }
            _ => false,
        })
        .count();

    if count < config.help_seeking_threshold.max(1) {
        return None;
    }

    let severity = (0.25 + 0.08 * count as f64).clamp(0.0, 1.0);

    Some(StrugglePattern {
        kind: PatternKind::ExcessiveHelpSeeking,
        concept_id: None,
        severity,
        evidence_count: count,
        detected_at: now,
    })
}
