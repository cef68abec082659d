//! Gateway request handlers

use super::AppState;
use crate::domain::{Intent, OrderItem, PatientContext, PipelineState, PrescriptionData};
use crate::errors::AgentError;
use crate::orchestrator::{ConfirmOutcome, TurnOutcome};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn internal(e: AgentError) -> (StatusCode, String) {
    tracing::error!(error = %e, "gateway request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Order could not be processed. Please try again.".to_string(),
    )
}

#[derive(Debug, Deserialize)]
pub struct ConversationRequest {
    pub session_id: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Free-text reply; only consulted while a confirmation is pending.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub intent: Option<Intent>,
    /// Items as extracted by the text understanding service (§6 contract).
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub prescription_uploaded: bool,
    #[serde(default)]
    pub prescription: Option<PrescriptionData>,
    #[serde(default)]
    pub patient_context: PatientContext,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub needs_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

pub async fn conversation(
    State(state): State<AppState>,
    Json(request): Json<ConversationRequest>,
) -> ApiResult<ConversationResponse> {
    let session_id = request.session_id.clone();

    // Confirmation intercept: while a gate is open, the user's message is a
    // YES/NO reply, checked before anything else.
    if state.confirmations.is_pending(&session_id) {
        if let Some(message) = &request.message {
            let outcome = state
                .orchestrator
                .resume(&session_id, message, None, None)
                .await
                .map_err(internal)?;
            return Ok(Json(confirm_to_conversation(session_id, outcome)));
        }
    }

    let mut pipeline_state = PipelineState::new(&session_id);
    pipeline_state.phone = request.phone;
    pipeline_state.intent = request.intent.unwrap_or(Intent::Purchase);
    pipeline_state.extracted_items = request.items;
    pipeline_state.prescription_uploaded =
        request.prescription_uploaded || request.prescription.is_some();
    pipeline_state.prescription = request.prescription;
    pipeline_state.patient_context = request.patient_context;

    let (outcome, _state) = state
        .orchestrator
        .run_turn(pipeline_state)
        .await
        .map_err(internal)?;

    let response = match outcome {
        TurnOutcome::AwaitingConfirmation { token, summary, .. } => ConversationResponse {
            session_id,
            status: "awaiting_confirmation".to_string(),
            message: summary,
            needs_confirmation: true,
            confirmation_token: Some(token),
            order_id: None,
        },
        TurnOutcome::Rejected { reasons } => ConversationResponse {
            session_id,
            status: "rejected".to_string(),
            message: if reasons.is_empty() {
                "Your request cannot be fulfilled.".to_string()
            } else {
                reasons.join("\n")
            },
            needs_confirmation: false,
            confirmation_token: None,
            order_id: None,
        },
        TurnOutcome::Failed { reason } => ConversationResponse {
            session_id,
            status: "failed".to_string(),
            message: match reason.as_str() {
                "no_items" => "I could not find any medicines in your request.".to_string(),
                _ => "None of the requested items are currently available.".to_string(),
            },
            needs_confirmation: false,
            confirmation_token: None,
            order_id: None,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: String,
    /// YES or NO.
    pub reply: String,
    #[serde(default)]
    pub confirmation_token: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_pharmacist_override: Option<bool>,
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> ApiResult<ConfirmResponse> {
    let outcome = state
        .orchestrator
        .resume(
            &request.session_id,
            &request.reply,
            request.confirmation_token.as_deref(),
            request.idempotency_key.as_deref(),
        )
        .await
        .map_err(internal)?;
    Ok(Json(confirm_response(outcome)))
}

fn confirm_response(outcome: ConfirmOutcome) -> ConfirmResponse {
    match outcome {
        ConfirmOutcome::Confirmed {
            order_id,
            requires_pharmacist_override,
        } => ConfirmResponse {
            status: "confirmed".to_string(),
            message: format!("Order confirmed. Order ID: {order_id}"),
            order_id: Some(order_id),
            requires_pharmacist_override: Some(requires_pharmacist_override),
        },
        ConfirmOutcome::Failed { reason } => ConfirmResponse {
            status: "failed".to_string(),
            message: reason,
            order_id: None,
            requires_pharmacist_override: None,
        },
        ConfirmOutcome::Expired => ConfirmResponse {
            status: "expired".to_string(),
            message: "Order already processed or expired.".to_string(),
            order_id: None,
            requires_pharmacist_override: None,
        },
        ConfirmOutcome::Invalid => ConfirmResponse {
            status: "invalid".to_string(),
            message: "Invalid confirmation token. Please use the token provided with your \
                      order summary."
                .to_string(),
            order_id: None,
            requires_pharmacist_override: None,
        },
        ConfirmOutcome::Cancelled => ConfirmResponse {
            status: "cancelled".to_string(),
            message: "Order cancelled. How else can I help you?".to_string(),
            order_id: None,
            requires_pharmacist_override: None,
        },
        ConfirmOutcome::Reprompt => ConfirmResponse {
            status: "awaiting_confirmation".to_string(),
            message: "Please reply YES to confirm your order or NO to cancel.".to_string(),
            order_id: None,
            requires_pharmacist_override: None,
        },
    }
}

fn confirm_to_conversation(session_id: String, outcome: ConfirmOutcome) -> ConversationResponse {
    let confirm = confirm_response(outcome);
    ConversationResponse {
        session_id,
        needs_confirmation: confirm.status == "awaiting_confirmation",
        status: confirm.status,
        message: confirm.message,
        confirmation_token: None,
        order_id: confirm.order_id,
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult<crate::store::OrderDetail> {
    let order = state
        .store
        .get_order(&order_id)
        .await
        .map_err(|e| internal(e.into()))?;
    order
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("order {order_id} not found")))
}

pub async fn event_stats(State(state): State<AppState>) -> Json<crate::events::BusStats> {
    Json(state.bus.stats())
}
