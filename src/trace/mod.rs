//! Trace manager
//!
//! Per-session append-only trace log with live fan-out. Subscribers get the
//! accumulated history on connect, then each new event as it happens; fusion
//! updates ride the same channel. Delivery is best-effort and non-blocking:
//! a subscriber whose channel is gone is dropped from the fan-out set
//! without affecting the emitter or its siblings.

use crate::config::TracePacing;
use crate::fusion::{FusionCalculator, FusionState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Agent labels used in trace events and the fusion phase machine.
pub mod agents {
    pub const GATEWAY: &str = "API Gateway";
    pub const FRONT_DESK: &str = "FrontDesk";
    pub const IDENTITY: &str = "IdentityAgent";
    pub const VISION: &str = "VisionAgent";
    pub const RISK_SCORER: &str = "RiskScorer";
    pub const VALIDATOR: &str = "MedicalValidator";
    pub const INVENTORY: &str = "Inventory";
    pub const FULFILLMENT: &str = "Fulfillment";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Thinking,
    ToolUse,
    Decision,
    Response,
    Error,
    Event,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Thinking => "thinking",
            TraceKind::ToolUse => "tool_use",
            TraceKind::Decision => "decision",
            TraceKind::Response => "response",
            TraceKind::Error => "error",
            TraceKind::Event => "event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Started,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: Uuid,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub step: String,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub status: TraceStatus,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

impl TraceEvent {
    pub fn new(
        session_id: &str,
        agent: &str,
        step: &str,
        kind: TraceKind,
        status: TraceStatus,
        details: serde_json::Value,
        parent_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            agent: agent.to_string(),
            step: step.to_string(),
            kind,
            status,
            details,
            parent_id,
        }
    }
}

/// What a live subscriber receives: trace events interleaved with fusion
/// updates, on one channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum TraceMessage {
    Trace(TraceEvent),
    Fusion(FusionState),
}

pub type SubscriberId = u64;
type TraceSender = mpsc::UnboundedSender<TraceMessage>;

struct SessionTrace {
    history: Vec<TraceEvent>,
    subscribers: Vec<(SubscriberId, TraceSender)>,
    fusion: FusionCalculator,
}

impl SessionTrace {
    fn new(session_id: &str, expected_agents: usize) -> Self {
        Self {
            history: Vec::new(),
            subscribers: Vec::new(),
            // The fusion reducer attaches with the session record, so it
            // tracks the session whether an emit or a connect came first.
            fusion: FusionCalculator::new(session_id, expected_agents),
        }
    }
}

pub struct TraceManager {
    sessions: DashMap<String, SessionTrace>,
    next_subscriber_id: AtomicU64,
    pacing: TracePacing,
    expected_agents: usize,
}

impl TraceManager {
    pub fn new(pacing: TracePacing, expected_agents: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            pacing,
            expected_agents: expected_agents.max(1),
        }
    }

    /// Register a live subscriber. The accumulated history and the current
    /// fusion snapshot are replayed onto the channel before live updates.
    pub fn connect(
        &self,
        session_id: &str,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<TraceMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionTrace::new(session_id, self.expected_agents));

        for event in &session.history {
            let _ = tx.send(TraceMessage::Trace(event.clone()));
        }
        let _ = tx.send(TraceMessage::Fusion(session.fusion.fusion_state()));
        session.subscribers.push((id, tx));

        tracing::info!(session_id, subscriber = id, "trace subscriber connected");
        (id, rx)
    }

    pub fn disconnect(&self, session_id: &str, subscriber: SubscriberId) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.subscribers.retain(|(id, _)| *id != subscriber);
        }
    }

    /// Append a trace event, fold it into the fusion state, and fan both out
    /// to live subscribers.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit(
        &self,
        session_id: &str,
        agent: &str,
        step: &str,
        kind: TraceKind,
        status: TraceStatus,
        details: serde_json::Value,
        parent_id: Option<Uuid>,
    ) -> TraceEvent {
        // Stagger delivery for a perceived streaming feel; zero in tests.
        let pause = match status {
            TraceStatus::Started => self.pacing.started_ms,
            TraceStatus::Running => self.pacing.running_ms,
            TraceStatus::Completed => self.pacing.completed_ms,
            TraceStatus::Failed => 0,
        };
        if pause > 0 {
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }

        let event = TraceEvent::new(session_id, agent, step, kind, status, details, parent_id);
        log_event(&event);

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionTrace::new(session_id, self.expected_agents));

        session.history.push(event.clone());
        let fusion_changed = session.fusion.process_event(&event);
        let fusion_state = fusion_changed.then(|| session.fusion.fusion_state());

        session.subscribers.retain(|(id, tx)| {
            let mut alive = tx.send(TraceMessage::Trace(event.clone())).is_ok();
            if alive {
                if let Some(state) = &fusion_state {
                    alive = tx.send(TraceMessage::Fusion(state.clone())).is_ok();
                }
            }
            if !alive {
                tracing::warn!(session_id, subscriber = *id, "dropping dead trace subscriber");
            }
            alive
        });

        event
    }

    pub fn history(&self, session_id: &str) -> Vec<TraceEvent> {
        self.sessions
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn fusion_state(&self, session_id: &str) -> Option<FusionState> {
        self.sessions.get(session_id).map(|s| s.fusion.fusion_state())
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }
}

fn log_event(event: &TraceEvent) {
    let icon = match (event.status, event.kind) {
        (TraceStatus::Failed, _) => "❌",
        (TraceStatus::Completed, _) => "✅",
        (_, TraceKind::Thinking) => "🧠",
        (_, TraceKind::ToolUse) => "🛠️",
        (_, TraceKind::Decision) => "🤔",
        (_, TraceKind::Response) => "🗣️",
        (_, TraceKind::Error) => "❌",
        (_, TraceKind::Event) => "⚡",
    };
    tracing::info!(
        session_id = %event.session_id,
        agent = %event.agent,
        status = ?event.status,
        "{icon} [{}] {}",
        event.agent,
        event.step
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> TraceManager {
        TraceManager::new(TracePacing::NONE, 4)
    }

    #[tokio::test]
    async fn late_subscriber_gets_history_then_live() {
        let tm = manager();
        tm.emit("s1", agents::GATEWAY, "received", TraceKind::Event, TraceStatus::Started, json!({}), None)
            .await;

        let (_id, mut rx) = tm.connect("s1");
        // replayed history
        match rx.recv().await.unwrap() {
            TraceMessage::Trace(e) => assert_eq!(e.step, "received"),
            other => panic!("expected trace, got {other:?}"),
        }
        // fusion snapshot after replay
        assert!(matches!(rx.recv().await.unwrap(), TraceMessage::Fusion(_)));

        tm.emit("s1", agents::INVENTORY, "checking stock", TraceKind::ToolUse, TraceStatus::Running, json!({"stock_status": "in_stock"}), None)
            .await;
        match rx.recv().await.unwrap() {
            TraceMessage::Trace(e) => assert_eq!(e.agent, agents::INVENTORY),
            other => panic!("expected trace, got {other:?}"),
        }
        // inventory signal changed the fusion state
        assert!(matches!(rx.recv().await.unwrap(), TraceMessage::Fusion(_)));
    }

    #[tokio::test]
    async fn dead_subscriber_is_evicted() {
        let tm = manager();
        let (_id, rx) = tm.connect("s1");
        drop(rx);
        assert_eq!(tm.subscriber_count("s1"), 1);

        tm.emit("s1", agents::GATEWAY, "step", TraceKind::Event, TraceStatus::Running, json!({}), None)
            .await;
        assert_eq!(tm.subscriber_count("s1"), 0);
        assert_eq!(tm.history("s1").len(), 1);
    }

    #[tokio::test]
    async fn fusion_tracks_session_without_subscribers() {
        let tm = manager();
        tm.emit("s1", agents::FULFILLMENT, "done", TraceKind::Decision, TraceStatus::Completed, json!({}), None)
            .await;
        let fusion = tm.fusion_state("s1").unwrap();
        assert_eq!(
            fusion.pipeline_phase,
            crate::fusion::PipelinePhase::Complete
        );
    }
}
