//! Fulfillment agent
//!
//! The only component that mutates stock, and only behind the hard
//! confirmation gate: a state whose `confirmation_confirmed` flag is false
//! fails with `ConfirmationRequired` before anything is read or written,
//! even when invoked directly. After the gate, stock decrements and order
//! creation happen in one transaction; any failure rolls the whole region
//! back and is reported as a typed record plus an `OrderFailed` event.

use crate::domain::{OrderStatus, PharmacistDecision, PipelineState};
use crate::errors::{AgentError, ErrorPayload};
use crate::events::{EventBus, EventPayload, PharmacyEvent};
use crate::money::Paise;
use crate::store::{OrderLineDetail, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Fulfilled,
    PendingReview,
    Rejected,
    Failed,
    NoItems,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockUpdate {
    pub medicine: String,
    pub quantity: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub status: FulfillmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<Paise>,
    pub items_fulfilled: usize,
    pub items_skipped: usize,
    pub item_details: Vec<OrderLineDetail>,
    pub stock_updates: Vec<StockUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub reasoning_trace: Vec<String>,
    pub fulfillment_timestamp: DateTime<Utc>,
}

impl FulfillmentRecord {
    fn failed(reason: &str, trace: Vec<String>, error: Option<ErrorPayload>) -> Self {
        Self {
            status: FulfillmentStatus::Failed,
            reason: Some(reason.to_string()),
            order_id: None,
            total_amount: None,
            items_fulfilled: 0,
            items_skipped: 0,
            item_details: Vec::new(),
            stock_updates: Vec::new(),
            error,
            reasoning_trace: trace,
            fulfillment_timestamp: Utc::now(),
        }
    }
}

pub async fn run(
    state: &mut PipelineState,
    store: &Store,
    bus: &EventBus,
) -> Result<(), AgentError> {
    // HARD CONFIRMATION GATE. The flag is flipped only by the orchestrator's
    // resume path after a successful consume; a direct invocation with the
    // default state aborts here with no reads, writes or events.
    if !state.confirmation_confirmed {
        return Err(AgentError::ConfirmationRequired {
            session_id: state.session_id.clone(),
        });
    }

    let mut trace = Vec::new();
    let user_id = state
        .user_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());

    // Prerequisites
    if state.extracted_items.is_empty() {
        trace.push("No items to fulfill".to_string());
        state.order_status = Some(OrderStatus::Failed);
        let mut record = FulfillmentRecord::failed("no_items", trace, None);
        record.status = FulfillmentStatus::NoItems;
        state.trace_metadata.fulfillment = Some(record);
        return Ok(());
    }
    trace.push(format!(
        "Processing {} item(s)",
        state.extracted_items.len()
    ));

    if state.pharmacist_decision == Some(PharmacistDecision::Rejected) {
        trace.push("Order rejected by pharmacist, cannot fulfill".to_string());
        state.order_status = Some(OrderStatus::Rejected);
        state.trace_metadata.fulfillment = Some(FulfillmentRecord {
            status: FulfillmentStatus::Rejected,
            reason: Some("pharmacist_rejection".to_string()),
            order_id: None,
            total_amount: None,
            items_fulfilled: 0,
            items_skipped: 0,
            item_details: Vec::new(),
            stock_updates: Vec::new(),
            error: None,
            reasoning_trace: trace,
            fulfillment_timestamp: Utc::now(),
        });
        return Ok(());
    }

    // A missing decision means validation ran in the recommendation phase;
    // treat it as approved. needs_review is preserved.
    let effective_decision = state
        .pharmacist_decision
        .unwrap_or(PharmacistDecision::Approved);
    trace.push(format!("Pharmacist decision: {effective_decision}"));

    // Visibility pre-check outside the transaction. The authoritative check
    // is the guarded decrement below.
    let mut available = Vec::new();
    let mut skipped = Vec::new();
    for i in 0..state.extracted_items.len() {
        let item = state.extracted_items[i].clone();
        let in_stock = store
            .get_medicine(&item.medicine_name)
            .await?
            .map(|m| m.medicine.stock >= i64::from(item.quantity))
            .unwrap_or(false);
        state.extracted_items[i].in_stock = Some(in_stock);
        if in_stock {
            trace.push(format!("{}: in stock", item.medicine_name));
            available.push(item);
        } else {
            trace.push(format!("{}: insufficient stock, skipping", item.medicine_name));
            skipped.push(item);
        }
    }

    if available.is_empty() {
        trace.push("No available items to fulfill".to_string());
        state.order_status = Some(OrderStatus::Failed);
        state.trace_metadata.fulfillment =
            Some(FulfillmentRecord::failed("no_available_items", trace.clone(), None));
        publish_failed(bus, &user_id, "no available items", "InventoryProblem").await;
        return Ok(());
    }

    // Atomic region: every decrement under the row lock, then the order row.
    let outcome = async {
        let mut tx = store.begin().await?;
        let mut stock_updates = Vec::new();
        for item in &available {
            tx.decrement_stock(&item.medicine_name, item.quantity).await?;
            stock_updates.push(StockUpdate {
                medicine: item.medicine_name.clone(),
                quantity: item.quantity,
                status: "decremented".to_string(),
            });
        }
        let created = tx
            .create_order(&user_id, &available, effective_decision, &state.safety_issues)
            .await?;
        tx.add_audit_log(
            &created.order_id,
            "fulfillment_agent",
            effective_decision.as_str(),
            "order created and stock decremented atomically",
            None,
            &serde_json::json!({
                "items_fulfilled": available.len(),
                "items_skipped": skipped.len(),
            }),
        )
        .await?;
        tx.commit().await?;
        Ok::<_, StoreError>((created, stock_updates))
    }
    .await;

    let (created, stock_updates) = match outcome {
        Ok(ok) => ok,
        Err(e) => {
            let e = e.into_transaction("fulfillment");
            trace.push(format!("Transaction failed: {e}"));
            trace.push("Database rolled back, no partial state".to_string());
            state.order_status = Some(OrderStatus::Failed);

            let agent_error = AgentError::Inventory(e);
            let reason = match &agent_error {
                AgentError::Inventory(StoreError::OutOfStock { .. }) => "out_of_stock",
                _ => "transaction_error",
            };
            state.trace_metadata.fulfillment = Some(FulfillmentRecord::failed(
                reason,
                trace.clone(),
                Some(agent_error.to_payload()),
            ));
            publish_failed(
                bus,
                &user_id,
                &agent_error.to_string(),
                agent_error.error_type(),
            )
            .await;
            return Ok(());
        }
    };

    for update in &stock_updates {
        trace.push(format!("Stock updated: {} (-{})", update.medicine, update.quantity));
    }
    trace.push(format!("Order created: {}", created.order_id));
    trace.push(format!("Total amount: {}", created.total_amount));

    state.order_id = Some(created.order_id.clone());
    state.total_amount = Some(created.total_amount);

    let (order_status, record_status) = match effective_decision {
        PharmacistDecision::Approved => {
            trace.push("Order fulfilled, ready for pickup/delivery".to_string());
            (OrderStatus::Fulfilled, FulfillmentStatus::Fulfilled)
        }
        PharmacistDecision::NeedsReview => {
            trace.push("Order pending pharmacist review".to_string());
            (OrderStatus::PendingReview, FulfillmentStatus::PendingReview)
        }
        PharmacistDecision::Rejected => unreachable!("rejected orders return earlier"),
    };
    state.order_status = Some(order_status);

    state.trace_metadata.fulfillment = Some(FulfillmentRecord {
        status: record_status,
        reason: None,
        order_id: Some(created.order_id.clone()),
        total_amount: Some(created.total_amount),
        items_fulfilled: available.len(),
        items_skipped: skipped.len(),
        item_details: created.lines.clone(),
        stock_updates,
        error: None,
        reasoning_trace: trace,
        fulfillment_timestamp: Utc::now(),
    });

    // Publication failures never roll back the committed transaction; the
    // bus isolates and counts handler errors internally.
    bus.publish(PharmacyEvent::new(EventPayload::OrderCreated {
        order_id: created.order_id,
        user_id,
        phone: state.phone.clone(),
        total_amount: created.total_amount,
        items: created.lines,
        pharmacist_decision: effective_decision,
    }))
    .await;

    Ok(())
}

async fn publish_failed(bus: &EventBus, user_id: &str, error: &str, error_type: &str) {
    bus.publish(PharmacyEvent::new(EventPayload::OrderFailed {
        user_id: user_id.to_string(),
        error: error.to_string(),
        error_type: error_type.to_string(),
    }))
    .await;
}
