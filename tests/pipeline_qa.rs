//! End-to-end pipeline scenarios
//!
//! Full-stack runs over an in-memory store with trace pacing disabled:
//! happy path, concurrent sellout, gate bypass, expiry, prescription and
//! interaction rejections, plus the cross-cutting invariants (no
//! overselling, token single-use, order-id uniqueness, risk monotonicity).

use rust_decimal::Decimal;
use rxflow::confirm::ConfirmationStore;
use rxflow::domain::{OrderItem, PharmacistDecision, PipelineState, PrescriptionData};
use rxflow::events::{EventBus, EventKind};
use rxflow::money::Paise;
use rxflow::orchestrator::{ConfirmOutcome, Orchestrator, TurnOutcome};
use rxflow::store::{NewMedicine, Store};
use rxflow::trace::TraceManager;
use rxflow::validator::{HeuristicSeverityModel, RuleBasedInteractionChecker};
use rxflow::{AppConfig, TracePacing, fulfillment};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Stack {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    traces: Arc<TraceManager>,
    confirmations: Arc<ConfirmationStore>,
    orchestrator: Arc<Orchestrator>,
}

async fn stack() -> Stack {
    stack_with_ttl(Duration::from_secs(300)).await
}

async fn stack_with_ttl(ttl: Duration) -> Stack {
    let config = AppConfig::default();
    let store = Arc::new(Store::in_memory().await.unwrap());
    seed_catalog(&store).await;

    let bus = Arc::new(EventBus::default());
    let traces = Arc::new(TraceManager::new(TracePacing::NONE, config.expected_agents));
    let confirmations = Arc::new(ConfirmationStore::new(ttl));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        bus.clone(),
        traces.clone(),
        confirmations.clone(),
        Arc::new(RuleBasedInteractionChecker),
        Arc::new(HeuristicSeverityModel),
        Duration::from_secs(60),
    ));

    Stack {
        store,
        bus,
        traces,
        confirmations,
        orchestrator,
    }
}

async fn seed_catalog(store: &Store) {
    let meds: &[(&str, &str, i64, i64, bool)] = &[
        ("Paracetamol 500mg", "Analgesic", 10, 100, false),
        ("Cetirizine 10mg", "Antihistamine", 8, 120, false),
        ("Warfarin 5mg", "Anticoagulant", 30, 50, false),
        ("Aspirin 100mg", "Analgesic", 12, 50, false),
        ("Tramadol 50mg", "Analgesic", 20, 60, false),
        ("Amoxicillin 500mg", "Antibiotic", 45, 60, true),
    ];
    for (name, category, price, stock, rx) in meds {
        store
            .add_medicine(&NewMedicine {
                name: name.to_string(),
                category: Some(category.to_string()),
                price: Paise::from_rupees(Decimal::from(*price)).unwrap(),
                stock: *stock,
                requires_prescription: *rx,
                active_ingredients: None,
                generic_equivalent: None,
                contraindications: None,
                strength: Some(name.rsplit(' ').next().unwrap_or("").to_string()),
                dosage_form: Some("tablet".to_string()),
            })
            .await
            .unwrap();
    }
}

fn purchase_state(session: &str, items: Vec<OrderItem>) -> PipelineState {
    let mut state = PipelineState::new(session);
    state.extracted_items = items;
    state
}

#[tokio::test]
async fn happy_path_single_otc_medicine() {
    let stack = stack().await;

    let mut state = purchase_state("S", vec![OrderItem::new("Paracetamol 500mg", 2)]);
    state.phone = Some("9876543210".to_string());

    // Turn 1: pipeline runs up to the confirmation gate.
    let (outcome, state) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::AwaitingConfirmation {
        token,
        summary,
        estimated_total,
    } = outcome
    else {
        panic!("expected confirmation gate, got {outcome:?}");
    };
    assert_eq!(estimated_total, Paise::from_raw(2000).unwrap());
    assert!(summary.contains("YES"));
    assert!(!state.confirmation_confirmed);

    // Turn 2: YES with the issued token.
    let outcome = stack
        .orchestrator
        .resume("S", "YES", Some(token.as_str()), None)
        .await
        .unwrap();
    let ConfirmOutcome::Confirmed { order_id, .. } = outcome else {
        panic!("expected confirmed, got {outcome:?}");
    };

    let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
    assert_eq!(order.total_amount, Paise::from_raw(2000).unwrap());
    assert_eq!(order.lines.len(), 1);
    assert_eq!(order.lines[0].quantity, 2);

    let med = stack
        .store
        .get_medicine("Paracetamol 500mg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(med.medicine.stock, 98);

    // OrderCreated published exactly once; patient was identified.
    assert_eq!(stack.bus.history(Some(EventKind::OrderCreated), 10).len(), 1);
    assert_eq!(
        stack
            .bus
            .history(Some(EventKind::PatientIdentified), 10)
            .len(),
        1
    );
    assert!(!stack.traces.history("S").is_empty());
}

#[tokio::test]
async fn concurrent_sellout_never_goes_negative() {
    let stack = stack().await;

    // 10 pending confirmations for 15 units each against a stock of 100.
    let mut tokens = Vec::new();
    for i in 0..10 {
        let session = format!("sellout-{i}");
        let state = purchase_state(&session, vec![OrderItem::new("Paracetamol 500mg", 15)]);
        let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
        let TurnOutcome::AwaitingConfirmation { token, .. } = outcome else {
            panic!("expected gate for {session}");
        };
        tokens.push((session, token));
    }

    // Confirm all 10 concurrently.
    let mut handles = Vec::new();
    for (session, token) in tokens {
        let orchestrator = stack.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .resume(&session, "YES", Some(token.as_str()), None)
                .await
                .unwrap()
        }));
    }

    let mut confirmed = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await.unwrap() {
            ConfirmOutcome::Confirmed { .. } => confirmed += 1,
            ConfirmOutcome::Failed { .. } => failed += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(confirmed, 6, "exactly 6 orders of 15 fit into 100");
    assert_eq!(failed, 4);

    let med = stack
        .store
        .get_medicine("Paracetamol 500mg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(med.medicine.stock, 10);
    assert!(med.medicine.stock >= 0);

    // Failing confirmations left no order rows behind.
    assert_eq!(stack.store.order_count().await.unwrap(), 6);
    assert_eq!(stack.bus.history(Some(EventKind::OrderCreated), 20).len(), 6);
}

#[tokio::test]
async fn gate_bypass_attempt_is_refused() {
    let stack = stack().await;

    let mut state = purchase_state("bypass", vec![OrderItem::new("Paracetamol 500mg", 2)]);
    state.confirmation_confirmed = false;

    let err = fulfillment::run(&mut state, &stack.store, &stack.bus)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rxflow::AgentError::ConfirmationRequired { .. }
    ));

    assert_eq!(stack.store.order_count().await.unwrap(), 0);
    assert_eq!(stack.bus.stats().events_published, 0);
    let med = stack
        .store
        .get_medicine("Paracetamol 500mg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(med.medicine.stock, 100);
}

#[tokio::test]
async fn expired_confirmation_is_refused() {
    let stack = stack_with_ttl(Duration::from_millis(40)).await;

    let state = purchase_state("expiry", vec![OrderItem::new("Paracetamol 500mg", 1)]);
    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::AwaitingConfirmation { token, .. } = outcome else {
        panic!("expected gate");
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = stack
        .orchestrator
        .resume("expiry", "YES", Some(token.as_str()), None)
        .await
        .unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Expired));

    assert_eq!(stack.store.order_count().await.unwrap(), 0);
    assert_eq!(stack.bus.history(Some(EventKind::OrderCreated), 10).len(), 0);
}

#[tokio::test]
async fn expired_prescription_is_rejected() {
    let stack = stack().await;

    let mut item = OrderItem::new("Cetirizine 10mg", 1);
    item.dosage = Some("10mg".to_string());
    item.frequency = Some("1 time daily".to_string());

    let mut state = purchase_state("rx-expired", vec![item]);
    state.prescription_uploaded = true;
    let old = chrono::Utc::now().date_naive() - chrono::Duration::days(200);
    state.prescription = Some(PrescriptionData {
        patient_name: Some("Asha".to_string()),
        doctor_name: Some("Dr. Rao".to_string()),
        date: Some(old.format("%d/%m/%Y").to_string()),
        signature_present: true,
        confidence: 0.9,
    });

    let (outcome, state) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::Rejected { reasons } = outcome else {
        panic!("expected rejection, got {outcome:?}");
    };
    assert!(reasons.iter().any(|r| r.contains("EXPIRED_PRESCRIPTION")));
    assert_eq!(
        state.pharmacist_decision,
        Some(PharmacistDecision::Rejected)
    );

    assert_eq!(stack.bus.history(Some(EventKind::OrderRejected), 10).len(), 1);
    assert_eq!(stack.store.order_count().await.unwrap(), 0);
}

#[tokio::test]
async fn severe_interaction_rejects_before_the_gate() {
    let stack = stack().await;

    let state = purchase_state(
        "interaction",
        vec![
            OrderItem::new("Warfarin 5mg", 1),
            OrderItem::new("Aspirin 100mg", 1),
        ],
    );

    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Rejected { .. }));

    assert_eq!(stack.bus.history(Some(EventKind::OrderRejected), 10).len(), 1);
    assert!(!stack.confirmations.is_pending("interaction"));
    assert_eq!(stack.store.order_count().await.unwrap(), 0);
}

#[tokio::test]
async fn confirmation_token_is_single_use() {
    let stack = stack().await;

    let state = purchase_state("single-use", vec![OrderItem::new("Paracetamol 500mg", 1)]);
    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::AwaitingConfirmation { token, .. } = outcome else {
        panic!("expected gate");
    };

    let first = stack
        .orchestrator
        .resume("single-use", "YES", Some(token.as_str()), None)
        .await
        .unwrap();
    assert!(matches!(first, ConfirmOutcome::Confirmed { .. }));

    let second = stack
        .orchestrator
        .resume("single-use", "YES", Some(token.as_str()), None)
        .await
        .unwrap();
    assert!(matches!(second, ConfirmOutcome::Expired));

    // Exactly one order despite two YES replies.
    assert_eq!(stack.store.order_count().await.unwrap(), 1);
}

#[tokio::test]
async fn wrong_token_is_invalid_and_no_reply_reprompts() {
    let stack = stack().await;

    let state = purchase_state("replies", vec![OrderItem::new("Paracetamol 500mg", 1)]);
    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingConfirmation { .. }));

    let invalid = stack
        .orchestrator
        .resume("replies", "YES", Some("not-the-token"), None)
        .await
        .unwrap();
    assert!(matches!(invalid, ConfirmOutcome::Invalid));

    let reprompt = stack
        .orchestrator
        .resume("replies", "maybe?", None, None)
        .await
        .unwrap();
    assert!(matches!(reprompt, ConfirmOutcome::Reprompt));

    let cancelled = stack.orchestrator.resume("replies", "no", None, None).await.unwrap();
    assert!(matches!(cancelled, ConfirmOutcome::Cancelled));
    assert!(!stack.confirmations.is_pending("replies"));
}

#[tokio::test]
async fn repeated_confirm_with_idempotency_key_returns_same_order() {
    let stack = stack().await;

    let state = purchase_state("idem", vec![OrderItem::new("Paracetamol 500mg", 2)]);
    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::AwaitingConfirmation { token, .. } = outcome else {
        panic!("expected gate");
    };

    let first = stack
        .orchestrator
        .resume("idem", "YES", Some(token.as_str()), Some("retry-key"))
        .await
        .unwrap();
    let ConfirmOutcome::Confirmed { order_id: id1, .. } = first else {
        panic!("expected confirmed");
    };

    let second = stack
        .orchestrator
        .resume("idem", "YES", Some(token.as_str()), Some("retry-key"))
        .await
        .unwrap();
    let ConfirmOutcome::Confirmed { order_id: id2, .. } = second else {
        panic!("expected cached confirmation");
    };

    assert_eq!(id1, id2);
    assert_eq!(stack.store.order_count().await.unwrap(), 1);
    let med = stack
        .store
        .get_medicine("Paracetamol 500mg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(med.medicine.stock, 98);
}

#[tokio::test]
async fn otc_summary_round_trips_the_item_set() {
    let stack = stack().await;

    let items = vec![
        OrderItem::new("Paracetamol 500mg", 1),
        OrderItem::new("Cetirizine 10mg", 2),
    ];
    let state = purchase_state("summary", items.clone());

    let (outcome, state) = stack.orchestrator.run_turn(state).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingConfirmation { .. }));

    let record = state.trace_metadata.medical_validator.unwrap();
    let summary = record.otc_summary.unwrap();
    assert_eq!(summary.recommendations.len(), items.len());
    for (recommendation, item) in summary.recommendations.iter().zip(&items) {
        assert_eq!(recommendation.medicine, item.medicine_name);
    }
}

#[tokio::test]
async fn risk_score_is_monotonic_across_turns() {
    let stack = stack().await;
    let phone = "9000000001";
    let (patient, _) = stack.store.resolve_patient(phone, None).await.unwrap();
    assert_eq!(patient.risk_score, 0);

    let mut last = 0;
    for turn in 0..3 {
        let mut state = purchase_state(
            &format!("risk-{turn}"),
            vec![OrderItem::new("Tramadol 50mg", 1)],
        );
        state.phone = Some(phone.to_string());
        stack.orchestrator.run_turn(state).await.unwrap();

        let current = stack
            .store
            .patient_by_pid(&patient.pid)
            .await
            .unwrap()
            .unwrap()
            .risk_score;
        assert!(current >= last, "risk score decreased: {last} -> {current}");
        last = current;
    }
    assert!(last > 0);
    assert!(last <= 100);
}

#[tokio::test]
async fn order_ids_do_not_collide() {
    let mut seen = HashSet::new();
    for _ in 0..100_000 {
        let id = format!("ORD-{}", ulid::Ulid::new());
        assert!(seen.insert(id), "order id collision");
    }
}

#[tokio::test]
async fn fusion_state_completes_after_fulfillment() {
    let stack = stack().await;

    let state = purchase_state("fusion", vec![OrderItem::new("Paracetamol 500mg", 1)]);
    let (outcome, _) = stack.orchestrator.run_turn(state).await.unwrap();
    let TurnOutcome::AwaitingConfirmation { token, .. } = outcome else {
        panic!("expected gate");
    };

    // The confirmation prompt (a front-desk response) was the last trace of
    // the turn; the derived phase must still reflect the inventory stage.
    let mid_turn = stack.traces.fusion_state("fusion").unwrap();
    assert_eq!(
        mid_turn.pipeline_phase,
        rxflow::fusion::PipelinePhase::Inventory
    );

    stack
        .orchestrator
        .resume("fusion", "YES", Some(token.as_str()), None)
        .await
        .unwrap();

    let fusion = stack.traces.fusion_state("fusion").unwrap();
    assert_eq!(fusion.pipeline_phase, rxflow::fusion::PipelinePhase::Complete);
    assert!(fusion.fulfillment_confidence > 0.0);
}
