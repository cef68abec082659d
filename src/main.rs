//! rxflow - pharmacy fulfillment service
//!
//! Bring-up order:
//!
//! ```text
//! ┌──────────┐    ┌─────────┐    ┌────────────┐    ┌─────────┐
//! │  Config  │───▶│  Store  │───▶│ Components │───▶│ Gateway │
//! │  (YAML)  │    │ (SQLite)│    │ (bus/trace)│    │ (axum)  │
//! └──────────┘    └─────────┘    └────────────┘    └─────────┘
//! ```

use anyhow::Context;
use rust_decimal::Decimal;
use rxflow::confirm::ConfirmationStore;
use rxflow::events::{EventBus, EventKind};
use rxflow::gateway::{self, AppState};
use rxflow::money::Paise;
use rxflow::orchestrator::Orchestrator;
use rxflow::refill::RefillPredictor;
use rxflow::store::{NewMedicine, Store};
use rxflow::trace::TraceManager;
use rxflow::validator::{HeuristicSeverityModel, RuleBasedInteractionChecker};
use rxflow::{AppConfig, logging};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("RXFLOW_CONFIG").unwrap_or_else(|_| "rxflow.yaml".to_string());
    let config = AppConfig::load(&config_path).context("loading configuration")?;
    let _log_guard = logging::init_logging(&config);
    tracing::info!(config = %config_path, "rxflow starting");

    let store = Arc::new(
        Store::connect(&config.database_url)
            .await
            .context("opening store")?,
    );
    seed_catalog_if_empty(&store).await?;

    let bus = Arc::new(EventBus::default());
    let traces = Arc::new(TraceManager::new(config.trace_pacing, config.expected_agents));
    let confirmations = Arc::new(ConfirmationStore::new(config.confirmation_ttl()));
    let _sweeper = confirmations.spawn_sweeper(Duration::from_secs(30));

    bus.subscribe(
        EventKind::OrderCreated,
        Arc::new(RefillPredictor::new(store.clone())),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        bus.clone(),
        traces.clone(),
        confirmations.clone(),
        Arc::new(RuleBasedInteractionChecker),
        Arc::new(HeuristicSeverityModel),
        config.idempotency_window(),
    ));

    let app = gateway::router(AppState {
        orchestrator,
        store,
        bus,
        traces,
        confirmations,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "gateway listening");
    axum::serve(listener, app).await.context("serving gateway")?;

    Ok(())
}

/// Minimal starter catalog for a fresh database.
async fn seed_catalog_if_empty(store: &Store) -> anyhow::Result<()> {
    if store.get_medicine("Paracetamol 500mg").await?.is_some() {
        return Ok(());
    }
    tracing::info!("seeding starter catalog");

    let seed: &[(&str, &str, i64, i64, bool, Option<&str>, Option<&str>)] = &[
        ("Paracetamol 500mg", "Analgesic", 10, 100, false, Some("Paracetamol"), Some("500mg")),
        ("Ibuprofen 400mg", "Analgesic", 15, 80, false, Some("Ibuprofen"), Some("400mg")),
        ("Cetirizine 10mg", "Antihistamine", 8, 120, false, Some("Cetirizine"), Some("10mg")),
        ("Aspirin 100mg", "Analgesic", 12, 90, false, Some("Aspirin"), Some("100mg")),
        ("Amoxicillin 500mg", "Antibiotic", 45, 60, true, Some("Amoxicillin"), Some("500mg")),
        ("Azithromycin 250mg", "Antibiotic", 70, 40, true, Some("Azithromycin"), Some("250mg")),
        ("Omeprazole 20mg", "Antacid", 25, 70, false, Some("Omeprazole"), Some("20mg")),
    ];
    for &(name, category, price, stock, rx, ingredient, strength) in seed {
        store
            .add_medicine(&NewMedicine {
                name: name.to_string(),
                category: Some(category.to_string()),
                price: Paise::from_rupees(Decimal::from(price))
                    .expect("seed prices are non-negative"),
                stock,
                requires_prescription: rx,
                active_ingredients: ingredient.map(str::to_string),
                generic_equivalent: ingredient.map(|i| i.to_lowercase()),
                contraindications: None,
                strength: strength.map(str::to_string),
                dosage_form: Some("tablet".to_string()),
            })
            .await?;
    }
    Ok(())
}
