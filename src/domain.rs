//! Core domain types
//!
//! Shared vocabulary for the agent pipeline: catalog entities, the pipeline
//! state that flows between agents, and the typed per-agent result records.
//! Only the orchestrator mutates a `PipelineState`; agents receive it by
//! `&mut` for the duration of their node and record their outcome in
//! `TraceMetadata`.

use crate::fulfillment::FulfillmentRecord;
use crate::inventory::{InventoryRecord, ReplacementSuggestion};
use crate::money::Paise;
use crate::risk::RiskRecord;
use crate::validator::ValidationRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================
// ENUMS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Purchase,
    Refill,
    Inquiry,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PharmacistDecision {
    Approved,
    NeedsReview,
    Rejected,
}

impl PharmacistDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PharmacistDecision::Approved => "approved",
            PharmacistDecision::NeedsReview => "needs_review",
            PharmacistDecision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PharmacistDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Fulfilled,
    PendingReview,
    Rejected,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::PendingReview => "pending_review",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "fulfilled" => Some(OrderStatus::Fulfilled),
            "pending_review" => Some(OrderStatus::PendingReview),
            "rejected" => Some(OrderStatus::Rejected),
            "failed" => Some(OrderStatus::Failed),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    #[default]
    Intake,
    CollectingItems,
    AwaitingConfirmation,
    FulfillmentExecuting,
    Completed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Normal,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=30 => RiskLevel::Normal,
            31..=60 => RiskLevel::Elevated,
            61..=80 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Normal => "normal",
            RiskLevel::Elevated => "elevated",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

// ============================================================
// CATALOG ENTITIES
// ============================================================

/// A catalog medicine. `stock >= 0` at every committed state; the store
/// enforces it with a guarded decrement under the transaction write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Medicine {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub price: Paise,
    pub stock: i64,
    pub requires_prescription: bool,
    pub active_ingredients: Option<String>,
    pub generic_equivalent: Option<String>,
    pub contraindications: Option<String>,
    pub strength: Option<String>,
    pub dosage_form: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Substring,
    Similar,
}

/// Result of a three-tier catalog lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicineMatch {
    pub medicine: Medicine,
    pub match_kind: MatchKind,
    /// Levenshtein similarity, only set for `MatchKind::Similar`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub pid: String,
    pub phone: String,
    pub name: Option<String>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub risk_flags: Vec<String>,
    pub risk_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub flagged_for_review: bool,
}

// ============================================================
// REQUEST / PIPELINE STATE
// ============================================================

/// One requested line in a user order, shaped like the LLM extraction
/// contract. `in_stock` and `requires_prescription` are advisory hints; the
/// fulfillment agent re-verifies stock under the transaction lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub medicine_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_prescription: Option<bool>,
}

impl OrderItem {
    pub fn new(name: impl Into<String>, quantity: u32) -> Self {
        Self {
            medicine_name: name.into(),
            dosage: None,
            frequency: None,
            quantity,
            in_stock: None,
            requires_prescription: None,
        }
    }
}

/// Patient context gathered during intake (age, allergies, conditions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub existing_conditions: Vec<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
}

/// Prescription fields as extracted by the vision service (§6 OCR contract).
/// Absent fields stay absent; the validator renders them as
/// "[Not clearly visible]" and never invents data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub signature_present: bool,
    #[serde(default)]
    pub confidence: f64,
}

/// The value passed agent-to-agent through one pipeline run.
///
/// `confirmation_confirmed` is the hard gate: it defaults to `false`, is
/// never serialized as `true` into a stored pending state, and is flipped
/// only by the orchestrator's resume path after a successful
/// `ConfirmationStore::consume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub extracted_items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pharmacist_decision: Option<PharmacistDecision>,
    #[serde(default)]
    pub safety_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<Paise>,
    #[serde(default)]
    pub prescription_uploaded: bool,
    #[serde(default)]
    pub prescription_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescription: Option<PrescriptionData>,
    #[serde(default)]
    pub patient_context: PatientContext,
    #[serde(default)]
    pub risk_score: u32,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub risk_factors_triggered: Vec<String>,
    #[serde(default)]
    pub risk_escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
    #[serde(default)]
    pub confirmation_confirmed: bool,
    #[serde(default)]
    pub conversation_phase: ConversationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_pending: Option<ReplacementSuggestion>,
    #[serde(default)]
    pub trace_metadata: TraceMetadata,
}

impl PipelineState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            phone: None,
            intent: Intent::Unknown,
            extracted_items: Vec::new(),
            pharmacist_decision: None,
            safety_issues: Vec::new(),
            order_id: None,
            order_status: None,
            total_amount: None,
            prescription_uploaded: false,
            prescription_verified: false,
            prescription: None,
            patient_context: PatientContext::default(),
            risk_score: 0,
            risk_level: RiskLevel::Normal,
            risk_factors_triggered: Vec::new(),
            risk_escalated: false,
            confirmation_token: None,
            confirmation_confirmed: false,
            conversation_phase: ConversationPhase::Intake,
            replacement_pending: None,
            trace_metadata: TraceMetadata::default(),
        }
    }

    /// Snapshot checked into the confirmation store. The gate flag is forced
    /// off so a hydrated state cannot pass the fulfillment gate without a
    /// fresh consume.
    pub fn confirmation_snapshot(&self) -> Self {
        let mut snap = self.clone();
        snap.confirmation_confirmed = false;
        snap
    }
}

/// Closed set of per-agent results, keyed on the wire by agent name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(
        rename = "risk_scoring_agent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub risk_scoring: Option<RiskRecord>,
    #[serde(
        rename = "medical_validator",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub medical_validator: Option<ValidationRecord>,
    #[serde(
        rename = "inventory_agent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inventory: Option<InventoryRecord>,
    #[serde(
        rename = "fulfillment_agent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fulfillment: Option<FulfillmentRecord>,
}
