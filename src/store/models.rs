//! Row types for the store
//!
//! Internal sqlx row structs plus their conversions into domain types.

use crate::domain::{Medicine, OrderStatus, Patient, PharmacistDecision, RiskLevel};
use crate::money::Paise;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
pub(crate) struct MedicineRow {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    pub price: i64,
    pub stock: i64,
    pub requires_prescription: bool,
    pub active_ingredients: Option<String>,
    pub generic_equivalent: Option<String>,
    pub contraindications: Option<String>,
    pub strength: Option<String>,
    pub dosage_form: Option<String>,
}

impl From<MedicineRow> for Medicine {
    fn from(row: MedicineRow) -> Self {
        Medicine {
            id: row.id,
            name: row.name,
            category: row.category,
            // Stored prices are inserted through `Paise`, never negative.
            price: Paise::from_raw(row.price.max(0)).unwrap_or(Paise::ZERO),
            stock: row.stock,
            requires_prescription: row.requires_prescription,
            active_ingredients: row.active_ingredients,
            generic_equivalent: row.generic_equivalent,
            contraindications: row.contraindications,
            strength: row.strength,
            dosage_form: row.dosage_form,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PatientRow {
    pub pid: String,
    pub phone: String,
    pub name: Option<String>,
    pub risk_score: i64,
    pub risk_level: String,
    pub risk_flags: String,
    pub risk_updated_at: Option<DateTime<Utc>>,
    pub flagged_for_review: bool,
}

impl From<PatientRow> for Patient {
    fn from(row: PatientRow) -> Self {
        let risk_level = match row.risk_level.as_str() {
            "elevated" => RiskLevel::Elevated,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            _ => RiskLevel::Normal,
        };
        Patient {
            pid: row.pid,
            phone: row.phone,
            name: row.name,
            risk_score: row.risk_score.clamp(0, 100) as u32,
            risk_level,
            risk_flags: serde_json::from_str(&row.risk_flags).unwrap_or_default(),
            risk_updated_at: row.risk_updated_at,
            flagged_for_review: row.flagged_for_review,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct OrderRow {
    pub id: i64,
    pub order_id: String,
    pub user_id: String,
    pub status: String,
    pub pharmacist_decision: Option<String>,
    pub safety_issues: String,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct OrderLineRow {
    pub medicine_name: String,
    pub dosage: Option<String>,
    pub quantity: i64,
    pub unit_price: i64,
}

/// Input for the admin medicine path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMedicine {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub price: Paise,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub requires_prescription: bool,
    #[serde(default)]
    pub active_ingredients: Option<String>,
    #[serde(default)]
    pub generic_equivalent: Option<String>,
    #[serde(default)]
    pub contraindications: Option<String>,
    #[serde(default)]
    pub strength: Option<String>,
    #[serde(default)]
    pub dosage_form: Option<String>,
}

/// One fulfilled order line with its price snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLineDetail {
    pub medicine_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    pub quantity: u32,
    pub unit_price: Paise,
    pub line_total: Paise,
}

/// An order with its owned lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order_id: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub pharmacist_decision: Option<PharmacistDecision>,
    pub safety_issues: Vec<String>,
    pub total_amount: Paise,
    pub created_at: DateTime<Utc>,
    pub lines: Vec<OrderLineDetail>,
}

/// Append-only audit entry attached to an order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub agent_name: String,
    pub decision: String,
    pub reasoning: String,
    pub confidence: Option<f64>,
    pub extra_data: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefillPrediction {
    pub user_id: String,
    pub medicine_name: String,
    pub predicted_depletion_date: DateTime<Utc>,
    pub confidence: f64,
    pub reminder_sent: bool,
    pub refill_confirmed: bool,
}
