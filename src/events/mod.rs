//! Event types published by the fulfillment core
//!
//! Every event is an envelope (id, timestamp) around one of the payload
//! kinds. Subscribers register per kind; the `data()` view is what external
//! consumers (and the history buffer) see.

mod bus;

pub use bus::{BusStats, EventBus, EventHandler, EventRecord};

use crate::domain::PharmacistDecision;
use crate::money::Paise;
use crate::store::OrderLineDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    OrderCreated,
    OrderFailed,
    OrderRejected,
    PrescriptionValidated,
    PatientIdentified,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::OrderCreated => "OrderCreated",
            EventKind::OrderFailed => "OrderFailed",
            EventKind::OrderRejected => "OrderRejected",
            EventKind::PrescriptionValidated => "PrescriptionValidated",
            EventKind::PatientIdentified => "PatientIdentified",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    OrderCreated {
        order_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
        total_amount: Paise,
        items: Vec<OrderLineDetail>,
        pharmacist_decision: PharmacistDecision,
    },
    OrderFailed {
        user_id: String,
        error: String,
        error_type: String,
    },
    OrderRejected {
        user_id: String,
        reason: String,
    },
    PrescriptionValidated {
        user_id: String,
        decision: PharmacistDecision,
        safety_issues: Vec<String>,
    },
    PatientIdentified {
        pid: String,
        phone: String,
        source: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::OrderCreated { .. } => EventKind::OrderCreated,
            EventPayload::OrderFailed { .. } => EventKind::OrderFailed,
            EventPayload::OrderRejected { .. } => EventKind::OrderRejected,
            EventPayload::PrescriptionValidated { .. } => EventKind::PrescriptionValidated,
            EventPayload::PatientIdentified { .. } => EventKind::PatientIdentified,
        }
    }
}

/// Envelope around a payload: identity, time, and a JSON data view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PharmacyEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl PharmacyEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}
