//! Transactional store properties
//!
//! Rollback/commit semantics of the inventory transaction, lock-guarded
//! decrements, and persistence across reopen for a file-backed store.

use rust_decimal::Decimal;
use rxflow::domain::{OrderItem, PharmacistDecision};
use rxflow::money::Paise;
use rxflow::store::{NewMedicine, Store, StoreError};

fn med(name: &str, price: i64, stock: i64) -> NewMedicine {
    NewMedicine {
        name: name.to_string(),
        category: Some("General".to_string()),
        price: Paise::from_rupees(Decimal::from(price)).unwrap(),
        stock,
        requires_prescription: false,
        active_ingredients: None,
        generic_equivalent: None,
        contraindications: None,
        strength: None,
        dosage_form: None,
    }
}

async fn stock_of(store: &Store, name: &str) -> i64 {
    store
        .get_medicine(name)
        .await
        .unwrap()
        .unwrap()
        .medicine
        .stock
}

#[tokio::test]
async fn failed_decrement_rolls_back_earlier_lines() {
    let store = Store::in_memory().await.unwrap();
    store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();
    store.add_medicine(&med("Beta", 10, 3)).await.unwrap();

    let result = async {
        let mut tx = store.begin().await?;
        tx.decrement_stock("Alpha", 5).await?;
        // Beta cannot cover the request; the whole region must roll back.
        tx.decrement_stock("Beta", 10).await?;
        tx.commit().await
    }
    .await;

    match result {
        Err(StoreError::OutOfStock {
            medicine,
            requested,
            available,
        }) => {
            assert_eq!(medicine, "Beta");
            assert_eq!(requested, 10);
            assert_eq!(available, 3);
        }
        other => panic!("expected OutOfStock, got {other:?}"),
    }

    assert_eq!(stock_of(&store, "Alpha").await, 20);
    assert_eq!(stock_of(&store, "Beta").await, 3);
    assert_eq!(store.order_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dropping_a_transaction_rolls_back() {
    let store = Store::in_memory().await.unwrap();
    store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();

    {
        let mut tx = store.begin().await.unwrap();
        tx.decrement_stock("Alpha", 5).await.unwrap();
        // no commit
    }

    assert_eq!(stock_of(&store, "Alpha").await, 20);
}

#[tokio::test]
async fn committed_region_is_atomic_and_consistent() {
    let store = Store::in_memory().await.unwrap();
    store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();
    store.add_medicine(&med("Beta", 25, 8)).await.unwrap();

    let items = vec![OrderItem::new("Alpha", 2), OrderItem::new("Beta", 1)];
    let created = {
        let mut tx = store.begin().await.unwrap();
        for item in &items {
            tx.decrement_stock(&item.medicine_name, item.quantity)
                .await
                .unwrap();
        }
        let created = tx
            .create_order("PID-001001", &items, PharmacistDecision::Approved, &[])
            .await
            .unwrap();
        tx.add_audit_log(
            &created.order_id,
            "fulfillment_agent",
            "approved",
            "test order",
            Some(0.99),
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        created
    };

    // total == sum(unit_price * qty) exactly
    assert_eq!(created.total_amount, Paise::from_raw(2 * 1000 + 2500).unwrap());

    let order = store.get_order(&created.order_id).await.unwrap().unwrap();
    assert_eq!(order.lines.len(), 2);
    let line_sum = order
        .lines
        .iter()
        .fold(Paise::ZERO, |acc, l| acc.checked_add(l.line_total).unwrap());
    assert_eq!(line_sum, order.total_amount);

    assert_eq!(stock_of(&store, "Alpha").await, 18);
    assert_eq!(stock_of(&store, "Beta").await, 7);

    let audit = store.audit_for_order(&created.order_id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].decision, "approved");
}

#[tokio::test]
async fn unknown_medicine_fails_the_region() {
    let store = Store::in_memory().await.unwrap();
    store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();

    let result = async {
        let mut tx = store.begin().await?;
        tx.decrement_stock("Alpha", 1).await?;
        tx.decrement_stock("DoesNotExist", 1).await?;
        tx.commit().await
    }
    .await;

    assert!(matches!(result, Err(StoreError::MedicineNotFound(_))));
    assert_eq!(stock_of(&store, "Alpha").await, 20);
}

#[tokio::test]
async fn medicine_for_update_reads_current_row() {
    let store = Store::in_memory().await.unwrap();
    store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let locked = tx.medicine_for_update("alpha").await.unwrap();
    assert_eq!(locked.name, "Alpha");
    assert_eq!(locked.stock, 20);
    tx.decrement_stock("Alpha", 20).await.unwrap();
    // A second decrement in the same region sees the updated row.
    let err = tx.decrement_stock("Alpha", 1).await.unwrap_err();
    assert!(matches!(err, StoreError::OutOfStock { available: 0, .. }));
    drop(tx);

    assert_eq!(stock_of(&store, "Alpha").await, 20);
}

#[tokio::test]
async fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rxflow-test.db");
    let url = format!("sqlite:{}", path.display());

    {
        let store = Store::connect(&url).await.unwrap();
        store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.decrement_stock("Alpha", 4).await.unwrap();
        tx.commit().await.unwrap();
    }

    let reopened = Store::connect(&url).await.unwrap();
    assert_eq!(stock_of(&reopened, "Alpha").await, 16);
}

#[tokio::test]
async fn admin_path_updates_and_deletes() {
    let store = Store::in_memory().await.unwrap();
    let id = store.add_medicine(&med("Alpha", 10, 20)).await.unwrap();

    let mut updated = med("Alpha", 12, 35);
    updated.category = Some("Painkiller".to_string());
    assert!(store.update_medicine(id, &updated).await.unwrap());

    let found = store.get_medicine("Alpha").await.unwrap().unwrap();
    assert_eq!(found.medicine.stock, 35);
    assert_eq!(found.medicine.price, Paise::from_raw(1200).unwrap());

    assert!(store.delete_medicine(id).await.unwrap());
    assert!(store.get_medicine("Alpha").await.unwrap().is_none());
    assert!(!store.delete_medicine(id).await.unwrap());
}
