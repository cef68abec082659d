//! Refill predictor
//!
//! Bus subscriber: on every `OrderCreated` it projects a depletion date per
//! line (one unit per day, 30-day fallback) and upserts a refill prediction
//! the reminder pipeline can pick up later. Runs fully decoupled from the
//! ordering path; a failure here never touches the order.

use crate::events::{EventHandler, EventPayload, PharmacyEvent};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

const FALLBACK_SUPPLY_DAYS: i64 = 30;

pub struct RefillPredictor {
    store: Arc<Store>,
}

impl RefillPredictor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for RefillPredictor {
    fn name(&self) -> &str {
        "refill_predictor"
    }

    async fn handle(&self, event: &PharmacyEvent) -> anyhow::Result<()> {
        let EventPayload::OrderCreated { user_id, items, .. } = &event.payload else {
            return Ok(());
        };

        for line in items {
            let days_supply = if line.quantity > 0 {
                i64::from(line.quantity)
            } else {
                FALLBACK_SUPPLY_DAYS
            };
            let depletion = Utc::now() + Duration::days(days_supply);
            let confidence = if line.quantity > 0 { 0.7 } else { 0.5 };

            self.store
                .upsert_refill_prediction(user_id, &line.medicine_name, depletion, confidence)
                .await?;
            tracing::debug!(
                %user_id,
                medicine = %line.medicine_name,
                days_supply,
                "refill prediction updated"
            );
        }
        Ok(())
    }
}
