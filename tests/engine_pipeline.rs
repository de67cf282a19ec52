use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use groupscholar_struggle_engine::actor::StruggleEngine;
use groupscholar_struggle_engine::config::EngineConfig;
use groupscholar_struggle_engine::db::{AlertStore, InterventionQueue};
use groupscholar_struggle_engine::error::EngineError;
use groupscholar_struggle_engine::hub::{BroadcastHub, ObserverSink, SinkError, SubscriberFilter};
use groupscholar_struggle_engine::models::{
    ActorKey, InstructorAlert, InteractionEvent, InteractionKind, PatternKind, StrugglePattern,
};

struct MemoryStore {
    alerts: Mutex<Vec<InstructorAlert>>,
    audits: Mutex<Vec<String>>,
    insert_attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            alerts: Mutex::new(Vec::new()),
            audits: Mutex::new(Vec::new()),
            insert_attempts: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(failures),
        })
    }

    fn alerts(&self) -> Vec<InstructorAlert> {
        self.alerts.lock().unwrap().clone()
    }

    fn audits(&self) -> Vec<String> {
        self.audits.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &InstructorAlert) -> anyhow::Result<()> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("storage backend unavailable");
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn record_audit(
        &self,
        _key: &ActorKey,
        _pattern: &StrugglePattern,
        decision: &str,
    ) -> anyhow::Result<()> {
        self.audits.lock().unwrap().push(decision.to_string());
        Ok(())
    }
}

struct MemoryQueue {
    queued: Mutex<Vec<(Uuid, StrugglePattern)>>,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(Vec::new()),
        })
    }

    fn queued(&self) -> Vec<(Uuid, StrugglePattern)> {
        self.queued.lock().unwrap().clone()
    }
}

#[async_trait]
impl InterventionQueue for MemoryQueue {
    async fn enqueue(&self, key: &ActorKey, pattern: &StrugglePattern) -> anyhow::Result<()> {
        self.queued
            .lock()
            .unwrap()
            .push((key.student_id, pattern.clone()));
        Ok(())
    }
}

struct CollectorSink {
    messages: Mutex<Vec<String>>,
}

impl CollectorSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ObserverSink for CollectorSink {
    fn try_send(&self, payload: String) -> Result<(), SinkError> {
        self.messages.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self) {}
}

fn test_config() -> EngineConfig {
    EngineConfig {
        housekeeping_interval: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

fn build_engine(
    config: EngineConfig,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
) -> (StruggleEngine, Arc<BroadcastHub>) {
    let hub = Arc::new(BroadcastHub::new());
    let engine = StruggleEngine::new(config, store, queue, hub.clone());
    (engine, hub)
}

fn incorrect_attempt(student: Uuid, concept: &str, minutes_ago: i64) -> InteractionEvent {
    InteractionEvent {
        student_id: student,
        course_id: "course-101".to_string(),
        kind: InteractionKind::AssessmentAttempt,
        concept_id: Some(concept.to_string()),
        correct: Some(false),
        time_spent_ms: Some(30_000),
        confidence: None,
        sentiment: None,
        occurred_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
    }
}

#[tokio::test]
async fn burst_of_errors_emits_exactly_one_alert() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    for _ in 0..4 {
        engine
            .record(incorrect_attempt(student, "loops", 0))
            .await
            .unwrap();
    }

    let alerts = store.alerts();
    assert_eq!(alerts.len(), 1, "cooldown should hold later alerts back");
    assert_eq!(alerts[0].pattern_type, PatternKind::RepeatedErrors);
    assert_eq!(alerts[0].student_id, student);
    assert!(store.audits().contains(&"emit_alert".to_string()));
}

#[tokio::test]
async fn failed_insert_is_retried_once_and_recovers() {
    let store = MemoryStore::failing_first(1);
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    for _ in 0..3 {
        engine
            .record(incorrect_attempt(student, "loops", 0))
            .await
            .unwrap();
    }

    assert_eq!(store.attempts(), 2, "one failure plus the synchronous retry");
    assert_eq!(store.alerts().len(), 1);
}

#[tokio::test]
async fn persistent_failure_keeps_the_cooldown_open() {
    let store = MemoryStore::failing_first(usize::MAX / 2);
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    for _ in 0..3 {
        engine
            .record(incorrect_attempt(student, "loops", 0))
            .await
            .unwrap();
    }
    let attempts_after_first_emit = store.attempts();
    assert_eq!(attempts_after_first_emit, 2);
    assert!(store.alerts().is_empty());

    // Throttle state was not updated, so the next pass tries again.
    engine
        .record(incorrect_attempt(student, "loops", 0))
        .await
        .unwrap();
    assert!(store.attempts() > attempts_after_first_emit);
    assert!(store.alerts().is_empty());
}

#[tokio::test]
async fn medium_severity_goes_to_the_intervention_queue() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    // Recency decay lands a three-error streak from a while ago in the
    // medium band instead of the alert band.
    for minutes_ago in [14, 12, 10] {
        engine
            .record(incorrect_attempt(student, "loops", minutes_ago))
            .await
            .unwrap();
    }

    assert!(store.alerts().is_empty());
    let queued = queue.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].0, student);
    assert_eq!(queued[0].1.kind, PatternKind::RepeatedErrors);
    assert!(store.audits().contains(&"queue_intervention".to_string()));
}

#[tokio::test]
async fn detected_patterns_reach_course_subscribers() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let (engine, hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    let sink = CollectorSink::new();
    hub.subscribe(
        SubscriberFilter {
            course_id: "course-101".to_string(),
            role: None,
        },
        sink.clone(),
    )
    .await;

    for _ in 0..3 {
        engine
            .record(incorrect_attempt(student, "loops", 0))
            .await
            .unwrap();
    }

    let frames = sink.received();
    assert!(!frames.is_empty());
    let parsed: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(parsed["type"], "struggle_detected");
    assert_eq!(parsed["data"]["pattern_type"], "repeated_errors");
    assert_eq!(parsed["data"]["student_id"], student.to_string());
}

#[tokio::test]
async fn future_timestamps_are_rejected() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let student = Uuid::new_v4();

    let mut event = incorrect_attempt(student, "loops", 0);
    event.occurred_at = Utc::now() + ChronoDuration::minutes(10);
    let outcome = engine.record(event).await;
    assert!(matches!(outcome, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn eviction_retires_the_actor_but_keeps_the_cooldown() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let config = EngineConfig {
        housekeeping_interval: Duration::from_millis(100),
        retention_hours: 1,
        low_severity: 0.3,
        high_severity: 0.6,
        ..EngineConfig::default()
    };
    let (engine, _hub) = build_engine(config, store.clone(), queue.clone());
    let student = Uuid::new_v4();

    // Old enough to age out of the one-hour retention shortly, recent enough
    // to still alert under the lowered threshold.
    for minutes_ago in [68, 66, 64, 62] {
        engine
            .record(incorrect_attempt(student, "loops", minutes_ago))
            .await
            .unwrap();
    }
    assert_eq!(store.alerts().len(), 1);
    assert_eq!(engine.active_actors().await, 1);

    // Housekeeping evicts everything and the idle actor retires.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.active_actors().await, 0);

    // A fresh burst respawns the actor with its cooldown intact.
    for _ in 0..4 {
        engine
            .record(incorrect_attempt(student, "loops", 0))
            .await
            .unwrap();
    }
    assert_eq!(engine.active_actors().await, 1);
    assert_eq!(
        store.alerts().len(),
        1,
        "cooldown must survive actor retirement"
    );
}

#[tokio::test]
async fn distinct_students_are_isolated() {
    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    let (engine, _hub) = build_engine(test_config(), store.clone(), queue.clone());
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    for _ in 0..3 {
        engine
            .record(incorrect_attempt(first, "loops", 0))
            .await
            .unwrap();
        engine
            .record(incorrect_attempt(second, "loops", 0))
            .await
            .unwrap();
    }

    let alerts = store.alerts();
    assert_eq!(alerts.len(), 2, "each student alerts independently");
    assert!(alerts.iter().any(|a| a.student_id == first));
    assert!(alerts.iter().any(|a| a.student_id == second));
    assert_eq!(engine.active_actors().await, 2);
}
