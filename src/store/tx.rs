//! Transactional region over the inventory/order tables
//!
//! `InventoryTx` wraps a single sqlx transaction. `medicine_for_update`
//! escalates the connection to the database write lock before any stock read,
//! so every read feeding a decrement happens under the lock, inside the same
//! transaction. Dropping the handle without `commit` rolls everything back,
//! including stock decrements and order rows.

use super::StoreError;
use super::models::{MedicineRow, OrderLineDetail};
use crate::domain::{Medicine, OrderItem, PharmacistDecision};
use crate::money::Paise;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use ulid::Ulid;

/// Result of `create_order`: id, exact total, and the line snapshots.
#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_id: String,
    pub total_amount: Paise,
    pub lines: Vec<OrderLineDetail>,
}

pub struct InventoryTx {
    tx: Transaction<'static, Sqlite>,
}

impl InventoryTx {
    pub(super) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    /// Read a medicine row under the transaction's exclusive write lock.
    ///
    /// The same-value update escalates this transaction to the writer before
    /// the row is read, so no other writer can interleave between the read
    /// and a following decrement.
    pub async fn medicine_for_update(&mut self, name: &str) -> Result<Medicine, StoreError> {
        sqlx::query("UPDATE medicines SET stock = stock WHERE lower(name) = lower(?1)")
            .bind(name)
            .execute(&mut *self.tx)
            .await?;

        let sql = format!(
            "SELECT {} FROM medicines WHERE lower(name) = lower(?1)",
            super::MEDICINE_COLUMNS
        );
        let row = sqlx::query_as::<_, MedicineRow>(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Medicine::from)
            .ok_or_else(|| StoreError::MedicineNotFound(name.to_string()))
    }

    /// Decrement stock, failing with a typed `OutOfStock` when the medicine
    /// cannot cover the quantity. The guarded update re-checks stock at write
    /// time; the CHECK constraint makes negative stock unrepresentable.
    pub async fn decrement_stock(&mut self, name: &str, qty: u32) -> Result<(), StoreError> {
        let med = self.medicine_for_update(name).await?;
        if med.stock < i64::from(qty) {
            return Err(StoreError::OutOfStock {
                medicine: med.name,
                requested: qty,
                available: med.stock,
            });
        }

        let res = sqlx::query(
            "UPDATE medicines SET stock = stock - ?1 WHERE id = ?2 AND stock >= ?1",
        )
        .bind(i64::from(qty))
        .bind(med.id)
        .execute(&mut *self.tx)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::OutOfStock {
                medicine: med.name,
                requested: qty,
                available: med.stock,
            });
        }
        Ok(())
    }

    /// Create an order with its owned lines. Unit prices are snapshotted
    /// from the catalog inside this transaction, so the stored total always
    /// equals the sum of its lines.
    pub async fn create_order(
        &mut self,
        user_id: &str,
        items: &[OrderItem],
        decision: PharmacistDecision,
        safety_issues: &[String],
    ) -> Result<CreatedOrder, StoreError> {
        let order_id = format!("ORD-{}", Ulid::new());

        let mut lines = Vec::with_capacity(items.len());
        let mut total = Paise::ZERO;
        for item in items {
            let sql = format!(
                "SELECT {} FROM medicines WHERE lower(name) = lower(?1)",
                super::MEDICINE_COLUMNS
            );
            let row = sqlx::query_as::<_, MedicineRow>(&sql)
                .bind(&item.medicine_name)
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| StoreError::MedicineNotFound(item.medicine_name.clone()))?;

            let unit_price = Paise::from_raw(row.price.max(0)).unwrap_or(Paise::ZERO);
            let line_total = unit_price
                .checked_mul_qty(item.quantity)
                .ok_or(crate::money::MoneyError::Overflow)?;
            total = total
                .checked_add(line_total)
                .ok_or(crate::money::MoneyError::Overflow)?;

            lines.push((row.id, row.name, item, unit_price, line_total));
        }

        let status = match decision {
            PharmacistDecision::Approved => "fulfilled",
            PharmacistDecision::NeedsReview => "pending_review",
            PharmacistDecision::Rejected => "rejected",
        };

        let res = sqlx::query(
            "INSERT INTO orders \
             (order_id, user_id, status, pharmacist_decision, safety_issues, total_amount, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&order_id)
        .bind(user_id)
        .bind(status)
        .bind(decision.as_str())
        .bind(serde_json::to_string(safety_issues).unwrap_or_else(|_| "[]".to_string()))
        .bind(total.to_raw())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        let order_rowid = res.last_insert_rowid();

        let mut detail = Vec::with_capacity(lines.len());
        for (medicine_id, catalog_name, item, unit_price, line_total) in lines {
            sqlx::query(
                "INSERT INTO order_lines \
                 (order_id, medicine_id, medicine_name, dosage, quantity, unit_price) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(order_rowid)
            .bind(medicine_id)
            .bind(&catalog_name)
            .bind(&item.dosage)
            .bind(i64::from(item.quantity))
            .bind(unit_price.to_raw())
            .execute(&mut *self.tx)
            .await?;

            detail.push(OrderLineDetail {
                medicine_name: catalog_name,
                dosage: item.dosage.clone(),
                quantity: item.quantity,
                unit_price,
                line_total,
            });
        }

        Ok(CreatedOrder {
            order_id,
            total_amount: total,
            lines: detail,
        })
    }

    pub async fn add_audit_log(
        &mut self,
        order_id: &str,
        agent_name: &str,
        decision: &str,
        reasoning: &str,
        confidence: Option<f64>,
        extra_data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let rowid: Option<i64> = sqlx::query_scalar("SELECT id FROM orders WHERE order_id = ?1")
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        let rowid = rowid.ok_or_else(|| StoreError::Transaction {
            operation: "add_audit_log".to_string(),
            reason: format!("unknown order {order_id}"),
        })?;

        sqlx::query(
            "INSERT INTO audit_logs \
             (order_id, agent_name, decision, reasoning, confidence, extra_data, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(rowid)
        .bind(agent_name)
        .bind(decision)
        .bind(reasoning)
        .bind(confidence)
        .bind(extra_data.to_string())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
