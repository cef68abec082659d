//! Pipeline orchestrator
//!
//! A small state machine over (pharmacist decision, availability):
//! risk_scorer → medical_validator → inventory, then either the confirmation
//! gate opens (pipeline suspends; a later confirm call resumes by consuming
//! the token) or the turn ends with a rejected/failed event. Fulfillment is
//! invoked only from the resume path, after a successful consume flipped the
//! gate flag.

use crate::confirm::ConfirmationStore;
use crate::domain::{ConversationPhase, PharmacistDecision, PipelineState};
use crate::errors::AgentError;
use crate::events::{EventBus, EventPayload, PharmacyEvent};
use crate::money::Paise;
use crate::store::Store;
use crate::trace::{TraceKind, TraceManager, TraceStatus, agents};
use crate::validator::{InteractionChecker, SeverityModel};
use crate::{fulfillment, inventory, risk, validator};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Result of one conversational turn through the pipeline.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Gate opened; the user must reply YES/NO with the token.
    AwaitingConfirmation {
        token: String,
        summary: String,
        estimated_total: Paise,
    },
    Rejected {
        reasons: Vec<String>,
    },
    Failed {
        reason: String,
    },
}

/// Result of a confirmation reply (§6 confirmation protocol).
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Confirmed {
        order_id: String,
        requires_pharmacist_override: bool,
    },
    Failed {
        reason: String,
    },
    Expired,
    Invalid,
    Cancelled,
    Reprompt,
}

struct CachedConfirm {
    order_id: String,
    requires_pharmacist_override: bool,
    at: Instant,
}

pub struct Orchestrator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    traces: Arc<TraceManager>,
    confirmations: Arc<ConfirmationStore>,
    checker: Arc<dyn InteractionChecker>,
    severity: Arc<dyn SeverityModel>,
    /// idempotency_key → recent confirm result (60 s window by default).
    confirm_cache: Mutex<HashMap<String, CachedConfirm>>,
    idempotency_window: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        traces: Arc<TraceManager>,
        confirmations: Arc<ConfirmationStore>,
        checker: Arc<dyn InteractionChecker>,
        severity: Arc<dyn SeverityModel>,
        idempotency_window: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            traces,
            confirmations,
            checker,
            severity,
            confirm_cache: Mutex::new(HashMap::new()),
            idempotency_window,
        }
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationStore> {
        &self.confirmations
    }

    /// Run one turn: risk → validation → inventory, then open the
    /// confirmation gate or end the turn with an event.
    pub async fn run_turn(
        &self,
        mut state: PipelineState,
    ) -> Result<(TurnOutcome, PipelineState), AgentError> {
        let session = state.session_id.clone();

        self.traces
            .emit(
                &session,
                agents::GATEWAY,
                "Received message",
                TraceKind::Event,
                TraceStatus::Started,
                json!({"items": state.extracted_items.len()}),
                None,
            )
            .await;

        self.identify_patient(&mut state).await?;
        self.prefill_prescription_hints(&mut state).await?;

        if state.extracted_items.is_empty() {
            return Ok((
                TurnOutcome::Failed {
                    reason: "no_items".to_string(),
                },
                state,
            ));
        }

        // Node: risk scorer
        self.traces
            .emit(
                &session,
                agents::RISK_SCORER,
                "Scoring behavioral risk",
                TraceKind::Thinking,
                TraceStatus::Started,
                json!({}),
                None,
            )
            .await;
        risk::run(&mut state, &self.store).await?;
        self.traces
            .emit(
                &session,
                agents::RISK_SCORER,
                "Scoring behavioral risk",
                TraceKind::Decision,
                TraceStatus::Completed,
                json!({
                    "risk_score": state.risk_score,
                    "risk_level": state.risk_level.as_str(),
                    "escalated": state.risk_escalated,
                }),
                None,
            )
            .await;

        // Node: medical validator
        self.traces
            .emit(
                &session,
                agents::VALIDATOR,
                "Verifying medical safety",
                TraceKind::Thinking,
                TraceStatus::Started,
                json!({}),
                None,
            )
            .await;
        validator::run(
            &mut state,
            &self.store,
            self.checker.as_ref(),
            self.severity.as_ref(),
        )
        .await?;

        let validation_details = validation_trace_details(&state);
        let decision = state.pharmacist_decision;

        if state.prescription_uploaded {
            self.bus
                .publish(PharmacyEvent::new(EventPayload::PrescriptionValidated {
                    user_id: state.user_id.clone().unwrap_or_default(),
                    decision: decision.unwrap_or(PharmacistDecision::NeedsReview),
                    safety_issues: state.safety_issues.clone(),
                }))
                .await;
        }

        // Conditional edge: rejected ends the turn.
        if decision == Some(PharmacistDecision::Rejected) {
            self.traces
                .emit(
                    &session,
                    agents::VALIDATOR,
                    "Verifying medical safety",
                    TraceKind::Decision,
                    TraceStatus::Failed,
                    validation_details,
                    None,
                )
                .await;
            self.bus
                .publish(PharmacyEvent::new(EventPayload::OrderRejected {
                    user_id: state.user_id.clone().unwrap_or_default(),
                    reason: state.safety_issues.join("; "),
                }))
                .await;
            return Ok((
                TurnOutcome::Rejected {
                    reasons: state.safety_issues.clone(),
                },
                state,
            ));
        }
        self.traces
            .emit(
                &session,
                agents::VALIDATOR,
                "Verifying medical safety",
                TraceKind::Decision,
                TraceStatus::Completed,
                validation_details,
                None,
            )
            .await;

        // Node: inventory
        self.traces
            .emit(
                &session,
                agents::INVENTORY,
                "Checking pharmacy stock",
                TraceKind::ToolUse,
                TraceStatus::Started,
                json!({}),
                None,
            )
            .await;
        inventory::run(&mut state, &self.store).await?;
        let availability_score = state
            .trace_metadata
            .inventory
            .as_ref()
            .map(|r| r.availability_score)
            .unwrap_or(0.0);
        self.traces
            .emit(
                &session,
                agents::INVENTORY,
                "Checking pharmacy stock",
                TraceKind::ToolUse,
                TraceStatus::Completed,
                json!({
                    "match_score": availability_score,
                    "stock_status": if availability_score >= 1.0 { "in_stock" }
                        else if availability_score > 0.0 { "substitute" }
                        else { "out_of_stock" },
                }),
                None,
            )
            .await;

        // Conditional edge: open the gate or fail the turn.
        if availability_score > 0.0 && decision != Some(PharmacistDecision::Rejected) {
            let (summary, estimated_total) = self.build_confirmation_summary(&state).await?;
            let replacement = state.replacement_pending.clone();
            let token = self.confirmations.create(&session, &state, replacement);
            state.confirmation_token = Some(token.clone());
            state.conversation_phase = ConversationPhase::AwaitingConfirmation;

            self.traces
                .emit(
                    &session,
                    agents::FRONT_DESK,
                    "Awaiting order confirmation",
                    TraceKind::Response,
                    TraceStatus::Completed,
                    json!({"estimated_total": estimated_total.to_rupees()}),
                    None,
                )
                .await;

            Ok((
                TurnOutcome::AwaitingConfirmation {
                    token,
                    summary,
                    estimated_total,
                },
                state,
            ))
        } else {
            self.traces
                .emit(
                    &session,
                    agents::INVENTORY,
                    "Checking pharmacy stock",
                    TraceKind::Decision,
                    TraceStatus::Failed,
                    json!({"reason": "no items available"}),
                    None,
                )
                .await;
            self.bus
                .publish(PharmacyEvent::new(EventPayload::OrderFailed {
                    user_id: state.user_id.clone().unwrap_or_default(),
                    error: "no items available".to_string(),
                    error_type: "InventoryProblem".to_string(),
                }))
                .await;
            Ok((
                TurnOutcome::Failed {
                    reason: "no_inventory".to_string(),
                },
                state,
            ))
        }
    }

    /// Handle the user's YES/NO reply for a pending confirmation.
    ///
    /// YES consumes the token atomically, hydrates the stored snapshot,
    /// flips the gate flag and runs fulfillment. A repeated YES with the
    /// same idempotency key inside the window returns the prior result
    /// instead of re-executing.
    pub async fn resume(
        &self,
        session_id: &str,
        reply: &str,
        token_override: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<ConfirmOutcome, AgentError> {
        let normalized = reply.trim().to_uppercase();
        match normalized.as_str() {
            "YES" => {}
            "NO" => {
                self.confirmations.cancel(session_id);
                self.traces
                    .emit(
                        session_id,
                        agents::FRONT_DESK,
                        "Order cancelled by user",
                        TraceKind::Response,
                        TraceStatus::Completed,
                        json!({}),
                        None,
                    )
                    .await;
                return Ok(ConfirmOutcome::Cancelled);
            }
            _ => {
                return if self.confirmations.is_pending(session_id) {
                    Ok(ConfirmOutcome::Reprompt)
                } else {
                    Ok(ConfirmOutcome::Expired)
                };
            }
        }

        if let Some(key) = idempotency_key {
            if let Some(cached) = self.cached_confirm(key) {
                tracing::info!(session_id, key, "idempotent confirm replay");
                return Ok(cached);
            }
        }

        let Some(pending) = self.confirmations.get_pending(session_id) else {
            return Ok(ConfirmOutcome::Expired);
        };
        let token = token_override.unwrap_or(pending.token.as_str());
        if token != pending.token {
            return Ok(ConfirmOutcome::Invalid);
        }
        // Atomic: exactly one caller per (session, token) gets the entry.
        let Some(entry) = self.confirmations.consume(session_id, token) else {
            return Ok(ConfirmOutcome::Expired);
        };

        let mut state = entry.pending_state;
        state.confirmation_confirmed = true;
        state.conversation_phase = ConversationPhase::FulfillmentExecuting;

        self.traces
            .emit(
                session_id,
                agents::FULFILLMENT,
                "Executing confirmed order",
                TraceKind::ToolUse,
                TraceStatus::Started,
                json!({}),
                None,
            )
            .await;

        if let Err(e) = fulfillment::run(&mut state, &self.store, &self.bus).await {
            // The gate error is internal; the user gets a benign message.
            tracing::error!(session_id, error = %e, "fulfillment aborted");
            self.traces
                .emit(
                    session_id,
                    agents::FULFILLMENT,
                    "Executing confirmed order",
                    TraceKind::Error,
                    TraceStatus::Failed,
                    json!({"reason": "internal_error"}),
                    None,
                )
                .await;
            return Ok(ConfirmOutcome::Failed {
                reason: "Order could not be processed. Please try again.".to_string(),
            });
        }

        match state.order_id.clone() {
            Some(order_id) => {
                state.conversation_phase = ConversationPhase::Completed;
                self.traces
                    .emit(
                        session_id,
                        agents::FULFILLMENT,
                        "Executing confirmed order",
                        TraceKind::Decision,
                        TraceStatus::Completed,
                        json!({
                            "order_id": order_id,
                            "total_amount": state.total_amount.map(Paise::to_rupees),
                        }),
                        None,
                    )
                    .await;

                let requires_pharmacist_override = state.pharmacist_decision
                    == Some(PharmacistDecision::NeedsReview)
                    || state
                        .replacement_pending
                        .as_ref()
                        .map(|r| r.requires_pharmacist_override)
                        .unwrap_or(false);

                if let Some(key) = idempotency_key {
                    self.remember_confirm(key, &order_id, requires_pharmacist_override);
                }
                Ok(ConfirmOutcome::Confirmed {
                    order_id,
                    requires_pharmacist_override,
                })
            }
            None => {
                let reason = state
                    .trace_metadata
                    .fulfillment
                    .as_ref()
                    .and_then(|r| r.reason.clone())
                    .unwrap_or_else(|| "fulfillment_failed".to_string());
                self.traces
                    .emit(
                        session_id,
                        agents::FULFILLMENT,
                        "Executing confirmed order",
                        TraceKind::Decision,
                        TraceStatus::Failed,
                        json!({"reason": reason}),
                        None,
                    )
                    .await;
                Ok(ConfirmOutcome::Failed { reason })
            }
        }
    }

    async fn identify_patient(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        if state.user_id.is_some() {
            return Ok(());
        }
        let Some(phone) = state.phone.clone() else {
            return Ok(());
        };

        let (patient, is_new) = self.store.resolve_patient(&phone, None).await?;
        state.user_id = Some(patient.pid.clone());

        self.bus
            .publish(PharmacyEvent::new(EventPayload::PatientIdentified {
                pid: patient.pid.clone(),
                phone: phone.clone(),
                source: "phone".to_string(),
            }))
            .await;
        self.traces
            .emit(
                &state.session_id,
                agents::IDENTITY,
                "Resolving patient identity",
                TraceKind::ToolUse,
                TraceStatus::Completed,
                json!({"pid": patient.pid, "is_new": is_new, "confidence": 1.0}),
                None,
            )
            .await;
        Ok(())
    }

    /// Resolve requires-prescription hints so the risk scorer's pure
    /// assessment can see them.
    async fn prefill_prescription_hints(
        &self,
        state: &mut PipelineState,
    ) -> Result<(), AgentError> {
        for i in 0..state.extracted_items.len() {
            if state.extracted_items[i].requires_prescription.is_some() {
                continue;
            }
            let name = state.extracted_items[i].medicine_name.clone();
            if let Some(found) = self.store.get_medicine(&name).await? {
                state.extracted_items[i].requires_prescription =
                    Some(found.medicine.requires_prescription);
            }
        }
        Ok(())
    }

    async fn build_confirmation_summary(
        &self,
        state: &PipelineState,
    ) -> Result<(String, Paise), AgentError> {
        let mut lines = vec!["Order summary:".to_string()];
        let mut total = Paise::ZERO;

        for item in &state.extracted_items {
            if item.in_stock != Some(true) {
                lines.push(format!(
                    "  • {} x{} - unavailable",
                    item.medicine_name, item.quantity
                ));
                continue;
            }
            if let Some(found) = self.store.get_medicine(&item.medicine_name).await? {
                let line_total = found
                    .medicine
                    .price
                    .checked_mul_qty(item.quantity)
                    .unwrap_or(Paise::ZERO);
                total = total.checked_add(line_total).unwrap_or(total);
                lines.push(format!(
                    "  • {} x{} = {}",
                    found.medicine.name, item.quantity, line_total
                ));
            }
        }
        lines.push(format!("Total: {total}"));

        if let Some(replacement) = &state.replacement_pending {
            lines.push(format!(
                "Suggested replacement for {}: {} ({})",
                replacement.original, replacement.replacement, replacement.reason
            ));
        }
        if state.pharmacist_decision == Some(PharmacistDecision::NeedsReview) {
            lines.push("Note: this order will be held for pharmacist review.".to_string());
        }
        lines.push("Reply YES to confirm or NO to cancel.".to_string());

        Ok((lines.join("\n"), total))
    }

    fn cached_confirm(&self, key: &str) -> Option<ConfirmOutcome> {
        let mut cache = self.confirm_cache.lock().expect("confirm cache poisoned");
        let window = self.idempotency_window;
        cache.retain(|_, v| v.at.elapsed() < window);
        cache.get(key).map(|v| ConfirmOutcome::Confirmed {
            order_id: v.order_id.clone(),
            requires_pharmacist_override: v.requires_pharmacist_override,
        })
    }

    fn remember_confirm(&self, key: &str, order_id: &str, requires_pharmacist_override: bool) {
        self.confirm_cache
            .lock()
            .expect("confirm cache poisoned")
            .insert(
                key.to_string(),
                CachedConfirm {
                    order_id: order_id.to_string(),
                    requires_pharmacist_override,
                    at: Instant::now(),
                },
            );
    }
}

fn validation_trace_details(state: &PipelineState) -> serde_json::Value {
    let record = state.trace_metadata.medical_validator.as_ref();
    let severity_score = record
        .and_then(|r| r.severity_assessment.as_ref())
        .map(|s| s.severity_score);
    let safe_to_dispense = record
        .and_then(|r| r.drug_interactions.as_ref())
        .map(|i| i.safe_to_dispense);
    json!({
        "decision": state.pharmacist_decision.map(|d| d.as_str()),
        "safety_issues": state.safety_issues,
        "severity_score": severity_score,
        "safe_to_dispense": safe_to_dispense,
    })
}
