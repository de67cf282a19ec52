use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    AssessmentAttempt,
    ChatMessage,
    HintRequest,
    ContentView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Confused,
    Frustrated,
}

impl Sentiment {
    pub fn is_negative(&self) -> bool {
        matches!(self, Sentiment::Confused | Sentiment::Frustrated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub student_id: Uuid,
    pub course_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    #[serde(default)]
    pub concept_id: Option<String>,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub time_spent_ms: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorKey {
    pub student_id: Uuid,
    pub course_id: String,
}

impl ActorKey {
    pub fn for_event(event: &InteractionEvent) -> Self {
        Self {
            student_id: event.student_id,
            course_id: event.course_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RepeatedErrors,
    IncreasingTime,
    ConfidenceDrop,
    ExcessiveHelpSeeking,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::RepeatedErrors => "repeated_errors",
            PatternKind::IncreasingTime => "increasing_time",
            PatternKind::ConfidenceDrop => "confidence_drop",
            PatternKind::ExcessiveHelpSeeking => "excessive_help_seeking",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "repeated_errors" => Some(PatternKind::RepeatedErrors),
            "increasing_time" => Some(PatternKind::IncreasingTime),
            "confidence_drop" => Some(PatternKind::ConfidenceDrop),
            "excessive_help_seeking" => Some(PatternKind::ExcessiveHelpSeeking),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrugglePattern {
    #[serde(rename = "pattern_type")]
    pub kind: PatternKind,
    pub concept_id: Option<String>,
    pub severity: f64,
    pub evidence_count: usize,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Suppress,
    QueueIntervention,
    EmitAlert,
}

impl AlertDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertDecision::Suppress => "suppress",
            AlertDecision::QueueIntervention => "queue_intervention",
            AlertDecision::EmitAlert => "emit_alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(AlertStatus::New),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            "dismissed" => Some(AlertStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstructorAlert {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: String,
    pub pattern_type: PatternKind,
    pub severity: f64,
    pub evidence_count: i32,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl InstructorAlert {
    pub fn from_pattern(key: &ActorKey, pattern: &StrugglePattern) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id: key.student_id,
            course_id: key.course_id.clone(),
            pattern_type: pattern.kind,
            severity: pattern.severity,
            evidence_count: pattern.evidence_count as i32,
            status: AlertStatus::New,
            created_at: pattern.detected_at,
            acknowledged_at: None,
            resolved_at: None,
        }
    }
}
