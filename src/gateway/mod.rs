//! HTTP/WebSocket boundary
//!
//! Thin adapter over the orchestration core: a conversation turn endpoint, a
//! confirmation endpoint, order/stats lookups and the live trace stream. The
//! request shape for items mirrors the LLM extraction contract, so the text
//! understanding service stays an external collaborator.

pub mod handlers;
pub mod ws;

use crate::confirm::ConfirmationStore;
use crate::events::EventBus;
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::trace::TraceManager;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Gateway application state (shared).
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub traces: Arc<TraceManager>,
    pub confirmations: Arc<ConfirmationStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversation", post(handlers::conversation))
        .route("/api/conversation/confirm", post(handlers::confirm))
        .route("/api/orders/{order_id}", get(handlers::get_order))
        .route("/api/events/stats", get(handlers::event_stats))
        .route("/api/trace/ws/{session_id}", get(ws::trace_ws))
        .with_state(state)
}
