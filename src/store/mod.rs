//! Inventory/Order Store
//!
//! Transactional persistence over embedded SQLite: medicines, orders with
//! owned lines, patients, audit log, refill predictions. Plain reads run on
//! the pool; anything that decrements stock goes through [`InventoryTx`],
//! which acquires the write lock before reading and rolls the whole region
//! back on any error.
//!
//! Medicine lookup is three-tier: exact (case-insensitive), then substring,
//! then Levenshtein similarity with a 0.70 threshold. The similarity scan is
//! capped to keep cost bounded on large catalogs.

mod models;
mod tx;

pub use models::{AuditEntry, NewMedicine, OrderDetail, OrderLineDetail, RefillPrediction};
pub use tx::{CreatedOrder, InventoryTx};

use crate::domain::{MatchKind, Medicine, MedicineMatch, Patient, RiskLevel};
use crate::money::MoneyError;
use crate::Paise;
use chrono::{DateTime, Utc};
use models::{MedicineRow, PatientRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Rows scanned at most by the similarity tier.
const SIMILARITY_SCAN_CAP: i64 = 5000;
/// Minimum Levenshtein similarity for a fuzzy match.
const SIMILARITY_THRESHOLD: f64 = 0.70;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("medicine not found: {0}")]
    MedicineNotFound(String),

    #[error("{medicine} out of stock (requested: {requested}, available: {available})")]
    OutOfStock {
        medicine: String,
        requested: u32,
        available: i64,
    },

    #[error("transaction failed during {operation}: {reason}")]
    Transaction { operation: String, reason: String },

    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl StoreError {
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DatabaseFailure",
            StoreError::MedicineNotFound(_) => "InventoryProblem",
            StoreError::OutOfStock { .. } => "OutOfStock",
            StoreError::Transaction { .. } => "TransactionFailure",
            StoreError::Money(_) => "ValidationFailure",
        }
    }

    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_) | StoreError::Transaction { .. } | StoreError::OutOfStock { .. }
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            StoreError::Database(_) | StoreError::Transaction { .. } => Some(5),
            _ => None,
        }
    }

    /// Collapse a transactional failure into `Transaction`, preserving the
    /// typed `OutOfStock` condition callers branch on.
    pub fn into_transaction(self, operation: &str) -> StoreError {
        match self {
            e @ StoreError::OutOfStock { .. } => e,
            other => StoreError::Transaction {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS medicines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    category TEXT,
    price INTEGER NOT NULL,
    stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
    requires_prescription INTEGER NOT NULL DEFAULT 0,
    active_ingredients TEXT,
    generic_equivalent TEXT,
    contraindications TEXT,
    strength TEXT,
    dosage_form TEXT
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    pharmacist_decision TEXT,
    safety_issues TEXT NOT NULL DEFAULT '[]',
    total_amount INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_lines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    medicine_id INTEGER,
    medicine_name TEXT NOT NULL,
    dosage TEXT,
    quantity INTEGER NOT NULL,
    unit_price INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pid TEXT NOT NULL UNIQUE,
    phone TEXT NOT NULL UNIQUE,
    name TEXT,
    risk_score INTEGER NOT NULL DEFAULT 0,
    risk_level TEXT NOT NULL DEFAULT 'normal',
    risk_flags TEXT NOT NULL DEFAULT '[]',
    risk_updated_at TEXT,
    flagged_for_review INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    agent_name TEXT NOT NULL,
    decision TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    confidence REAL,
    extra_data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refill_predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    medicine_name TEXT NOT NULL,
    predicted_depletion_date TEXT NOT NULL,
    confidence REAL NOT NULL,
    reminder_sent INTEGER NOT NULL DEFAULT 0,
    refill_confirmed INTEGER NOT NULL DEFAULT 0,
    UNIQUE (user_id, medicine_name)
);

CREATE INDEX IF NOT EXISTS idx_order_lines_order ON order_lines(order_id);
CREATE INDEX IF NOT EXISTS idx_audit_logs_order ON audit_logs(order_id);
"#;

const MEDICINE_COLUMNS: &str = "id, name, category, price, stock, requires_prescription, \
     active_ingredients, generic_equivalent, contraindications, strength, dosage_form";

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open a store at the given sqlx URL and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // In-memory databases exist per connection: a pool must keep exactly
        // one connection alive or the data vanishes between acquires.
        let memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Ephemeral store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============================================================
    // MEDICINES
    // ============================================================

    /// Three-tier lookup: exact case-insensitive, substring, then best
    /// Levenshtein match at or above the 0.70 threshold.
    pub async fn get_medicine(&self, name: &str) -> Result<Option<MedicineMatch>, StoreError> {
        let sql = format!(
            "SELECT {MEDICINE_COLUMNS} FROM medicines WHERE lower(name) = lower(?1)"
        );
        if let Some(row) = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(MedicineMatch {
                medicine: row.into(),
                match_kind: MatchKind::Exact,
                similarity: None,
            }));
        }

        let sql = format!(
            "SELECT {MEDICINE_COLUMNS} FROM medicines \
             WHERE instr(lower(name), lower(?1)) > 0 ORDER BY name LIMIT 1"
        );
        if let Some(row) = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(MedicineMatch {
                medicine: row.into(),
                match_kind: MatchKind::Substring,
                similarity: None,
            }));
        }

        let sql = format!("SELECT {MEDICINE_COLUMNS} FROM medicines LIMIT ?1");
        let rows = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(SIMILARITY_SCAN_CAP)
            .fetch_all(&self.pool)
            .await?;

        let needle = name.to_lowercase();
        let mut best: Option<(f64, MedicineRow)> = None;
        for row in rows {
            let score = similarity(&needle, &row.name.to_lowercase());
            if score >= SIMILARITY_THRESHOLD
                && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true)
            {
                best = Some((score, row));
            }
        }

        Ok(best.map(|(score, row)| MedicineMatch {
            medicine: row.into(),
            match_kind: MatchKind::Similar,
            similarity: Some(score),
        }))
    }

    /// In-stock medicines sharing a category, excluding the original.
    pub async fn alternatives_by_category(
        &self,
        category: &str,
        exclude_name: &str,
        limit: i64,
    ) -> Result<Vec<Medicine>, StoreError> {
        let sql = format!(
            "SELECT {MEDICINE_COLUMNS} FROM medicines \
             WHERE category = ?1 AND lower(name) != lower(?2) AND stock > 0 LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(category)
            .bind(exclude_name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Medicine::from).collect())
    }

    /// In-stock medicines whose name contains the given fragment.
    pub async fn medicines_matching(
        &self,
        fragment: &str,
        limit: i64,
    ) -> Result<Vec<Medicine>, StoreError> {
        let sql = format!(
            "SELECT {MEDICINE_COLUMNS} FROM medicines \
             WHERE instr(lower(name), lower(?1)) > 0 AND stock > 0 LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(fragment)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Medicine::from).collect())
    }

    // Admin path: plain writes, no locking semantics.

    pub async fn add_medicine(&self, med: &NewMedicine) -> Result<i64, StoreError> {
        let res = sqlx::query(
            "INSERT INTO medicines \
             (name, category, price, stock, requires_prescription, active_ingredients, \
              generic_equivalent, contraindications, strength, dosage_form) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&med.name)
        .bind(&med.category)
        .bind(med.price.to_raw())
        .bind(med.stock)
        .bind(med.requires_prescription)
        .bind(&med.active_ingredients)
        .bind(&med.generic_equivalent)
        .bind(&med.contraindications)
        .bind(&med.strength)
        .bind(&med.dosage_form)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_medicine(&self, id: i64, med: &NewMedicine) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE medicines SET name = ?1, category = ?2, price = ?3, stock = ?4, \
             requires_prescription = ?5, active_ingredients = ?6, generic_equivalent = ?7, \
             contraindications = ?8, strength = ?9, dosage_form = ?10 WHERE id = ?11",
        )
        .bind(&med.name)
        .bind(&med.category)
        .bind(med.price.to_raw())
        .bind(med.stock)
        .bind(med.requires_prescription)
        .bind(&med.active_ingredients)
        .bind(&med.generic_equivalent)
        .bind(&med.contraindications)
        .bind(&med.strength)
        .bind(&med.dosage_form)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn delete_medicine(&self, id: i64) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM medicines WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ============================================================
    // PATIENTS
    // ============================================================

    /// Upsert by phone. Returns the patient and whether it was just created.
    pub async fn resolve_patient(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<(Patient, bool), StoreError> {
        if let Some(row) = self.patient_row_by_phone(phone).await? {
            return Ok((row.into(), false));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patients")
            .fetch_one(&self.pool)
            .await?;
        let pid = format!("PID-{:06}", count + 1001);
        let display_name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Patient {}", &pid[pid.len() - 4..]));

        let inserted = sqlx::query(
            "INSERT INTO patients (pid, phone, name, created_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(phone) DO NOTHING",
        )
        .bind(&pid)
        .bind(phone)
        .bind(&display_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = self
            .patient_row_by_phone(phone)
            .await?
            .ok_or_else(|| StoreError::Transaction {
                operation: "resolve_patient".to_string(),
                reason: "patient vanished after upsert".to_string(),
            })?;
        Ok((row.into(), inserted > 0))
    }

    pub async fn patient_by_pid(&self, pid: &str) -> Result<Option<Patient>, StoreError> {
        let row = sqlx::query_as::<_, PatientRow>(
            "SELECT pid, phone, name, risk_score, risk_level, risk_flags, risk_updated_at, \
             flagged_for_review FROM patients WHERE pid = ?1",
        )
        .bind(pid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Patient::from))
    }

    async fn patient_row_by_phone(&self, phone: &str) -> Result<Option<PatientRow>, StoreError> {
        let row = sqlx::query_as::<_, PatientRow>(
            "SELECT pid, phone, name, risk_score, risk_level, risk_flags, risk_updated_at, \
             flagged_for_review FROM patients WHERE phone = ?1",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_patient_risk(
        &self,
        pid: &str,
        score: u32,
        level: RiskLevel,
        flags: &[String],
        flagged_for_review: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE patients SET risk_score = ?1, risk_level = ?2, risk_flags = ?3, \
             risk_updated_at = ?4, flagged_for_review = ?5 WHERE pid = ?6",
        )
        .bind(i64::from(score))
        .bind(level.as_str())
        .bind(serde_json::to_string(flags).unwrap_or_else(|_| "[]".to_string()))
        .bind(Utc::now())
        .bind(flagged_for_review)
        .bind(pid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================================
    // ORDERS / AUDIT / REFILLS
    // ============================================================

    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderDetail>, StoreError> {
        let order = sqlx::query_as::<_, models::OrderRow>(
            "SELECT id, order_id, user_id, status, pharmacist_decision, safety_issues, \
             total_amount, created_at FROM orders WHERE order_id = ?1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(order) = order else {
            return Ok(None);
        };

        let lines = sqlx::query_as::<_, models::OrderLineRow>(
            "SELECT medicine_name, dosage, quantity, unit_price FROM order_lines \
             WHERE order_id = ?1 ORDER BY id",
        )
        .bind(order.id)
        .fetch_all(&self.pool)
        .await?;

        let lines = lines
            .into_iter()
            .map(|l| {
                let unit_price = Paise::from_raw(l.unit_price.max(0)).unwrap_or(Paise::ZERO);
                let quantity = l.quantity.max(0) as u32;
                OrderLineDetail {
                    medicine_name: l.medicine_name,
                    dosage: l.dosage,
                    quantity,
                    unit_price,
                    line_total: unit_price.checked_mul_qty(quantity).unwrap_or(Paise::ZERO),
                }
            })
            .collect();

        let decision = order.pharmacist_decision.as_deref().and_then(|d| match d {
            "approved" => Some(crate::domain::PharmacistDecision::Approved),
            "needs_review" => Some(crate::domain::PharmacistDecision::NeedsReview),
            "rejected" => Some(crate::domain::PharmacistDecision::Rejected),
            _ => None,
        });

        Ok(Some(OrderDetail {
            order_id: order.order_id,
            user_id: order.user_id,
            status: crate::domain::OrderStatus::parse(&order.status)
                .unwrap_or(crate::domain::OrderStatus::Pending),
            pharmacist_decision: decision,
            safety_issues: serde_json::from_str(&order.safety_issues).unwrap_or_default(),
            total_amount: Paise::from_raw(order.total_amount.max(0)).unwrap_or(Paise::ZERO),
            created_at: order.created_at,
            lines,
        }))
    }

    pub async fn order_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn audit_for_order(&self, order_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT a.agent_name, a.decision, a.reasoning, a.confidence, a.extra_data, \
             a.created_at FROM audit_logs a JOIN orders o ON o.id = a.order_id \
             WHERE o.order_id = ?1 ORDER BY a.id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_refill_prediction(
        &self,
        user_id: &str,
        medicine_name: &str,
        predicted_depletion_date: DateTime<Utc>,
        confidence: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO refill_predictions \
             (user_id, medicine_name, predicted_depletion_date, confidence) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id, medicine_name) DO UPDATE SET \
             predicted_depletion_date = excluded.predicted_depletion_date, \
             confidence = excluded.confidence, reminder_sent = 0, refill_confirmed = 0",
        )
        .bind(user_id)
        .bind(medicine_name)
        .bind(predicted_depletion_date)
        .bind(confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn refill_predictions_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<RefillPrediction>, StoreError> {
        let rows = sqlx::query_as::<_, RefillPrediction>(
            "SELECT user_id, medicine_name, predicted_depletion_date, confidence, \
             reminder_sent, refill_confirmed FROM refill_predictions WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ============================================================
    // TRANSACTIONS
    // ============================================================

    /// Open a transactional region. All operations on the returned handle
    /// commit together or not at all; dropping it without `commit` rolls
    /// back.
    pub async fn begin(&self) -> Result<InventoryTx, StoreError> {
        Ok(InventoryTx::new(self.pool.begin().await?))
    }
}

// ============================================================
// SIMILARITY
// ============================================================

/// Levenshtein similarity in [0, 1]. No pack crate covers this; the matrix
/// is small (medicine names) so the quadratic cost is fine.
pub(crate) fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[b.len()] as f64;
    1.0 - distance / a.len().max(b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn med(name: &str, price_rupees: i64, stock: i64) -> NewMedicine {
        NewMedicine {
            name: name.to_string(),
            category: Some("Analgesic".to_string()),
            price: crate::money::Paise::from_rupees(Decimal::from(price_rupees)).unwrap(),
            stock,
            requires_prescription: false,
            active_ingredients: None,
            generic_equivalent: None,
            contraindications: None,
            strength: None,
            dosage_form: Some("tablet".to_string()),
        }
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("paracetamol", "paracetamol"), 1.0);
        assert!(similarity("paracetamol", "paracetamole") > 0.9);
        assert!(similarity("paracetamol", "warfarin") < 0.5);
        assert_eq!(similarity("", "abc"), 0.0);
    }

    #[tokio::test]
    async fn lookup_tiers() {
        let store = Store::in_memory().await.unwrap();
        store.add_medicine(&med("Paracetamol 500mg", 10, 100)).await.unwrap();

        let exact = store.get_medicine("paracetamol 500MG").await.unwrap().unwrap();
        assert_eq!(exact.match_kind, MatchKind::Exact);

        let sub = store.get_medicine("Paracetamol").await.unwrap().unwrap();
        assert_eq!(sub.match_kind, MatchKind::Substring);
        assert_eq!(sub.medicine.name, "Paracetamol 500mg");

        let fuzzy = store.get_medicine("Paracetmol 500mg").await.unwrap().unwrap();
        assert_eq!(fuzzy.match_kind, MatchKind::Similar);
        assert!(fuzzy.similarity.unwrap() >= 0.70);

        assert!(store.get_medicine("Zzzyx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patient_upsert_by_phone() {
        let store = Store::in_memory().await.unwrap();
        let (p1, new1) = store.resolve_patient("9876543210", Some("Asha")).await.unwrap();
        assert!(new1);
        assert_eq!(p1.name.as_deref(), Some("Asha"));

        let (p2, new2) = store.resolve_patient("9876543210", None).await.unwrap();
        assert!(!new2);
        assert_eq!(p1.pid, p2.pid);
    }
}
