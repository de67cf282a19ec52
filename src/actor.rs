use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::analyze;
use crate::config::EngineConfig;
use crate::db::{AlertStore, InterventionQueue};
use crate::error::EngineError;
use crate::history::{self, InteractionHistory};
use crate::hub::BroadcastHub;
use crate::models::{ActorKey, AlertDecision, InstructorAlert, InteractionEvent, StrugglePattern};
use crate::throttle::{self, ThrottleState};

enum ActorMessage {
    Record {
        event: InteractionEvent,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Housekeeping,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn AlertStore>,
    interventions: Arc<dyn InterventionQueue>,
    hub: Arc<BroadcastHub>,
    actors: Mutex<HashMap<ActorKey, mpsc::Sender<ActorMessage>>>,
    // Cooldown state of retired actors, handed back on respawn.
    throttle: Mutex<HashMap<ActorKey, ThrottleState>>,
}

/// Supervisor over the per-(student, course) actors. Creates them lazily on
/// the first interaction, routes every operation through the owning actor's
/// mailbox, and lets idle actors retire.
pub struct StruggleEngine {
    inner: Arc<EngineInner>,
}

impl StruggleEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn AlertStore>,
        interventions: Arc<dyn InterventionQueue>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                interventions,
                hub,
                actors: Mutex::new(HashMap::new()),
                throttle: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }

    pub async fn active_actors(&self) -> usize {
        self.inner.actors.lock().await.len()
    }

    /// Routes one interaction to its owning actor and waits until that actor
    /// has fully processed it, so operations on one key never overlap. The
    /// rare retry covers an actor retiring between lookup and send.
    pub async fn record(&self, event: InteractionEvent) -> Result<(), EngineError> {
        let key = ActorKey::for_event(&event);
        for _ in 0..2 {
            let tx = self.actor_for(&key).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let msg = ActorMessage::Record {
                event: event.clone(),
                reply: reply_tx,
            };
            if tx.send(msg).await.is_err() {
                continue;
            }
            return match reply_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::MailboxClosed),
            };
        }
        Err(EngineError::MailboxClosed)
    }

    async fn actor_for(&self, key: &ActorKey) -> mpsc::Sender<ActorMessage> {
        let mut actors = self.inner.actors.lock().await;
        if let Some(tx) = actors.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.config.mailbox_depth);
        let carried = self
            .inner
            .throttle
            .lock()
            .await
            .remove(key)
            .unwrap_or_default();
        let actor = StudentActor {
            key: key.clone(),
            history: InteractionHistory::new(self.inner.config.history_cap),
            throttle: carried,
            mailbox: rx,
            shared: self.inner.clone(),
        };
        tokio::spawn(actor.run());
        spawn_ticker(tx.clone(), self.inner.config.housekeeping_interval);
        actors.insert(key.clone(), tx.clone());
        info!(student = %key.student_id, course = %key.course_id, "struggle actor spawned");
        tx
    }
}

fn spawn_ticker(tx: mpsc::Sender<ActorMessage>, interval: Duration) {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(ActorMessage::Housekeeping).await.is_err() {
                break;
            }
        }
    });
}

/// One student's live state. All operations against a key run here, one at a
/// time, in arrival order; nothing outside this task touches the history or
/// throttle state.
struct StudentActor {
    key: ActorKey,
    history: InteractionHistory,
    throttle: ThrottleState,
    mailbox: mpsc::Receiver<ActorMessage>,
    shared: Arc<EngineInner>,
}

impl StudentActor {
    async fn run(mut self) {
        loop {
            match self.mailbox.recv().await {
                Some(ActorMessage::Record { event, reply }) => {
                    self.handle_record(event, reply).await;
                }
                Some(ActorMessage::Housekeeping) => {
                    if self.handle_housekeeping().await {
                        return;
                    }
                }
                None => {
                    let state = std::mem::take(&mut self.throttle);
                    self.shared
                        .throttle
                        .lock()
                        .await
                        .insert(self.key.clone(), state);
                    return;
                }
            }
        }
    }

    async fn handle_record(
        &mut self,
        mut event: InteractionEvent,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) {
        let now = Utc::now();
        let outcome = history::validate_event(&mut event, &self.key, now, &self.shared.config);
        if let Err(err) = &outcome {
            debug!(student = %self.key.student_id, %err, "interaction rejected");
            let _ = reply.send(outcome);
            return;
        }

        self.history.record(event);
        let patterns = analyze::analyze(&self.history, &self.shared.config, now);
        self.dispatch(patterns, now).await;
        let _ = reply.send(Ok(()));
    }

    async fn handle_housekeeping(&mut self) -> bool {
        let now = Utc::now();
        let patterns = analyze::analyze(&self.history, &self.shared.config, now);
        let failures = self.dispatch(patterns, now).await;
        if failures > 0 {
            let err = EngineError::Scheduling(format!("{failures} emissions failed"));
            warn!(student = %self.key.student_id, %err, "housekeeping pass degraded");
        }

        let evicted = self
            .history
            .evict_older_than(now - self.shared.config.retention());
        if evicted > 0 {
            debug!(student = %self.key.student_id, evicted, "stale interactions evicted");
        }

        if self.history.is_empty() {
            return self.try_retire().await;
        }
        false
    }

    async fn dispatch(
        &mut self,
        patterns: Vec<StrugglePattern>,
        now: chrono::DateTime<Utc>,
    ) -> usize {
        let mut failures = 0;
        for pattern in patterns {
            self.broadcast_pattern(&pattern).await;

            let decision = throttle::evaluate(&pattern, &self.throttle, &self.shared.config, now);
            match decision {
                AlertDecision::Suppress => {
                    debug!(
                        student = %self.key.student_id,
                        pattern = pattern.kind.as_str(),
                        severity = pattern.severity,
                        "pattern suppressed"
                    );
                }
                AlertDecision::QueueIntervention => {
                    if let Err(err) = self.shared.interventions.enqueue(&self.key, &pattern).await
                    {
                        warn!(student = %self.key.student_id, error = %err, "intervention enqueue failed");
                        failures += 1;
                    } else {
                        self.audit(&pattern, decision).await;
                    }
                }
                AlertDecision::EmitAlert => {
                    let alert = InstructorAlert::from_pattern(&self.key, &pattern);
                    match self.persist_alert(&alert).await {
                        Ok(()) => {
                            self.throttle.note_alert(pattern.kind, now);
                            info!(
                                student = %self.key.student_id,
                                course = %self.key.course_id,
                                pattern = pattern.kind.as_str(),
                                severity = pattern.severity,
                                "instructor alert emitted"
                            );
                            self.audit(&pattern, decision).await;
                        }
                        Err(err) => {
                            // throttle state untouched so the next pass retries
                            error!(student = %self.key.student_id, %err, "alert not persisted");
                            failures += 1;
                        }
                    }
                }
            }
        }
        failures
    }

    async fn persist_alert(&self, alert: &InstructorAlert) -> Result<(), EngineError> {
        if let Err(first) = self.shared.store.insert_alert(alert).await {
            warn!(student = %self.key.student_id, error = %first, "alert insert failed, retrying once");
            self.shared
                .store
                .insert_alert(alert)
                .await
                .map_err(|err| EngineError::Persistence(format!("{err:#}")))?;
        }
        Ok(())
    }

    async fn audit(&self, pattern: &StrugglePattern, decision: AlertDecision) {
        if let Err(err) = self
            .shared
            .store
            .record_audit(&self.key, pattern, decision.as_str())
            .await
        {
            warn!(student = %self.key.student_id, error = %err, "audit write failed");
        }
    }

    async fn broadcast_pattern(&self, pattern: &StrugglePattern) {
        let payload = serde_json::json!({
            "type": "struggle_detected",
            "data": {
                "student_id": self.key.student_id,
                "pattern_type": pattern.kind,
                "concept_id": pattern.concept_id,
                "severity": pattern.severity,
                "evidence_count": pattern.evidence_count,
                "detected_at": pattern.detected_at,
            }
        });
        let delivered = self
            .shared
            .hub
            .broadcast(&self.key.course_id, None, &payload.to_string())
            .await;
        debug!(student = %self.key.student_id, delivered, "pattern broadcast");
    }

    /// Retirement happens under the supervisor lock so a concurrent lookup
    /// either finds the live entry or respawns after the state is saved. A
    /// record that raced into the closing mailbox keeps the actor alive.
    async fn try_retire(&mut self) -> bool {
        let mut actors = self.shared.actors.lock().await;
        self.mailbox.close();

        let mut pending = Vec::new();
        while let Ok(msg) = self.mailbox.try_recv() {
            if matches!(msg, ActorMessage::Record { .. }) {
                pending.push(msg);
            }
        }

        if pending.is_empty() {
            let state = std::mem::take(&mut self.throttle);
            self.shared
                .throttle
                .lock()
                .await
                .insert(self.key.clone(), state);
            if actors.get(&self.key).map_or(false, |tx| tx.is_closed()) {
                actors.remove(&self.key);
            }
            info!(student = %self.key.student_id, course = %self.key.course_id, "idle actor retired");
            return true;
        }

        let (tx, rx) = mpsc::channel(self.shared.config.mailbox_depth);
        actors.insert(self.key.clone(), tx.clone());
        spawn_ticker(tx, self.shared.config.housekeeping_interval);
        self.mailbox = rx;
        drop(actors);

        for msg in pending {
            if let ActorMessage::Record { event, reply } = msg {
                self.handle_record(event, reply).await;
            }
        }
        false
    }
}
