//! Inventory agent
//!
//! Advisory only: classifies each requested item against the catalog,
//! proposes alternatives for unavailable items, and may suggest a single
//! equivalent replacement for the request with an explicit confidence tier.
//! It never mutates stock; the `in_stock` hints it leaves on items are
//! re-verified by fulfillment under the transaction lock.

use crate::domain::{Medicine, PipelineState};
use crate::errors::AgentError;
use crate::money::Paise;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAX_ALTERNATIVES: usize = 5;
const CANDIDATE_POOL: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Available,
    Partial,
    OutOfStock,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityResult {
    pub medicine: String,
    pub status: StockStatus,
    pub stock: i64,
    pub requested: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub price: Paise,
    pub stock: i64,
    pub match_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeGroup {
    pub original: String,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementConfidence {
    High,
    Medium,
    Low,
}

/// A suggested substitute for an unavailable medicine. Only a `high`
/// confidence match (same active ingredient, no allergy conflict) dispenses
/// without a pharmacist override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementSuggestion {
    pub original: String,
    pub replacement: String,
    pub confidence: ReplacementConfidence,
    pub requires_pharmacist_override: bool,
    pub price: Paise,
    pub stock: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    AllAvailable,
    PartialAvailable,
    NoneAvailable,
    NoItems,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub status: InventoryStatus,
    pub availability_score: f64,
    pub available_items: usize,
    pub total_items: usize,
    pub results: Vec<AvailabilityResult>,
    pub alternatives: Vec<AlternativeGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<ReplacementSuggestion>,
    pub reasoning_trace: Vec<String>,
    pub check_timestamp: DateTime<Utc>,
}

pub async fn run(state: &mut PipelineState, store: &Store) -> Result<(), AgentError> {
    let mut trace = Vec::new();

    if state.extracted_items.is_empty() {
        trace.push("No items to check".to_string());
        state.trace_metadata.inventory = Some(InventoryRecord {
            status: InventoryStatus::NoItems,
            availability_score: 0.0,
            available_items: 0,
            total_items: 0,
            results: Vec::new(),
            alternatives: Vec::new(),
            replacement: None,
            reasoning_trace: trace,
            check_timestamp: Utc::now(),
        });
        return Ok(());
    }

    trace.push(format!(
        "Checking inventory for {} item(s)",
        state.extracted_items.len()
    ));

    let mut results = Vec::new();
    let mut unavailable: Vec<String> = Vec::new();

    for i in 0..state.extracted_items.len() {
        let name = state.extracted_items[i].medicine_name.clone();
        let requested = state.extracted_items[i].quantity;

        let found = store.get_medicine(&name).await?;
        let result = match found {
            None => {
                state.extracted_items[i].in_stock = Some(false);
                unavailable.push(name.clone());
                trace.push(format!("{name}: not found in inventory"));
                AvailabilityResult {
                    medicine: name,
                    status: StockStatus::NotFound,
                    stock: 0,
                    requested,
                    message: "Medicine not found in inventory".to_string(),
                }
            }
            Some(m) if m.medicine.stock < i64::from(requested) => {
                state.extracted_items[i].in_stock = Some(false);
                unavailable.push(name.clone());
                let stock = m.medicine.stock;
                if stock > 0 {
                    trace.push(format!("{name}: partial stock ({stock}/{requested})"));
                    AvailabilityResult {
                        medicine: name,
                        status: StockStatus::Partial,
                        stock,
                        requested,
                        message: format!("Only {stock} available, {requested} requested"),
                    }
                } else {
                    trace.push(format!("{name}: out of stock"));
                    AvailabilityResult {
                        medicine: name,
                        status: StockStatus::OutOfStock,
                        stock: 0,
                        requested,
                        message: "Out of stock".to_string(),
                    }
                }
            }
            Some(m) => {
                state.extracted_items[i].in_stock = Some(true);
                let stock = m.medicine.stock;
                trace.push(format!("{name}: in stock ({stock} available)"));
                AvailabilityResult {
                    medicine: name,
                    status: StockStatus::Available,
                    stock,
                    requested,
                    message: "In stock".to_string(),
                }
            }
        };
        results.push(result);
    }

    let mut alternatives = Vec::new();
    for name in &unavailable {
        let found = find_alternatives(name, store).await?;
        if found.is_empty() {
            trace.push(format!("{name}: no alternatives found"));
        } else {
            let names: Vec<&str> = found.iter().map(|a| a.name.as_str()).take(3).collect();
            trace.push(format!("{name} -> {}", names.join(", ")));
            alternatives.push(AlternativeGroup {
                original: name.clone(),
                alternatives: found,
            });
        }
    }

    let replacement = match unavailable.first() {
        Some(name) => {
            find_equivalent_replacement(name, store, &state.patient_context.allergies).await?
        }
        None => None,
    };
    if let Some(r) = &replacement {
        trace.push(format!(
            "Replacement suggested: {} ({:?} confidence)",
            r.replacement, r.confidence
        ));
    }

    let total_items = state.extracted_items.len();
    let available_items = state
        .extracted_items
        .iter()
        .filter(|i| i.in_stock == Some(true))
        .count();
    let availability_score = available_items as f64 / total_items as f64;
    trace.push(format!(
        "Availability: {available_items}/{total_items} items"
    ));

    let status = if available_items == total_items {
        InventoryStatus::AllAvailable
    } else if available_items > 0 {
        InventoryStatus::PartialAvailable
    } else {
        InventoryStatus::NoneAvailable
    };

    state.replacement_pending = replacement.clone();
    state.trace_metadata.inventory = Some(InventoryRecord {
        status,
        availability_score,
        available_items,
        total_items,
        results,
        alternatives,
        replacement,
        reasoning_trace: trace,
        check_timestamp: Utc::now(),
    });

    Ok(())
}

/// Up to five in-stock alternatives drawn from the same category and from a
/// base-name substring search, deduplicated and sorted by (-stock, price).
pub async fn find_alternatives(
    medicine_name: &str,
    store: &Store,
) -> Result<Vec<Alternative>, AgentError> {
    let original = store.get_medicine(medicine_name).await?;
    let mut candidates: Vec<Alternative> = Vec::new();

    if let Some(found) = &original {
        if let Some(category) = &found.medicine.category {
            for m in store
                .alternatives_by_category(category, &found.medicine.name, CANDIDATE_POOL)
                .await?
            {
                candidates.push(to_alternative(m, "category"));
            }
        }
    }

    let base = extract_base_name(medicine_name);
    if !base.is_empty() && base.to_lowercase() != medicine_name.to_lowercase() {
        for m in store.medicines_matching(&base, CANDIDATE_POOL).await? {
            candidates.push(to_alternative(m, "similar_name"));
        }
    }

    let original_name = original
        .map(|f| f.medicine.name.to_lowercase())
        .unwrap_or_else(|| medicine_name.to_lowercase());
    let mut seen = HashSet::new();
    let mut unique: Vec<Alternative> = candidates
        .into_iter()
        .filter(|a| a.stock > 0 && a.name.to_lowercase() != original_name)
        .filter(|a| seen.insert(a.name.to_lowercase()))
        .collect();

    unique.sort_by(|a, b| b.stock.cmp(&a.stock).then(a.price.cmp(&b.price)));
    unique.truncate(MAX_ALTERNATIVES);
    Ok(unique)
}

fn to_alternative(m: Medicine, match_type: &str) -> Alternative {
    Alternative {
        name: m.name,
        category: m.category,
        price: m.price,
        stock: m.stock,
        match_type: match_type.to_string(),
    }
}

/// Suggest one equivalent replacement for an unavailable medicine.
///
/// Confidence tiers: same active ingredient (high, no override needed), same
/// generic equivalent (medium), same category only (low). A candidate whose
/// contraindications mention any of the patient's allergies is refused.
pub async fn find_equivalent_replacement(
    medicine_name: &str,
    store: &Store,
    allergies: &[String],
) -> Result<Option<ReplacementSuggestion>, AgentError> {
    let Some(found) = store.get_medicine(medicine_name).await? else {
        return Ok(None);
    };
    let original = found.medicine;
    let Some(category) = original.category.clone() else {
        return Ok(None);
    };

    let mut candidates = store
        .alternatives_by_category(&category, &original.name, 25)
        .await?;
    candidates.sort_by(|a, b| b.stock.cmp(&a.stock).then(a.price.cmp(&b.price)));

    let allowed = |candidate: &Medicine| {
        let contraindications = candidate
            .contraindications
            .as_deref()
            .unwrap_or("")
            .to_lowercase();
        !allergies
            .iter()
            .any(|a| !a.trim().is_empty() && contraindications.contains(&a.trim().to_lowercase()))
    };

    let same = |a: Option<&str>, b: Option<&str>| match (a, b) {
        (Some(a), Some(b)) => {
            !a.trim().is_empty() && a.trim().eq_ignore_ascii_case(b.trim())
        }
        _ => false,
    };

    // High: same active ingredient
    for candidate in &candidates {
        if same(
            original.active_ingredients.as_deref(),
            candidate.active_ingredients.as_deref(),
        ) && allowed(candidate)
        {
            return Ok(Some(suggestion(
                &original,
                candidate,
                ReplacementConfidence::High,
                "same active ingredient",
            )));
        }
    }
    // Medium: same generic equivalent
    for candidate in &candidates {
        if same(
            original.generic_equivalent.as_deref(),
            candidate.generic_equivalent.as_deref(),
        ) && allowed(candidate)
        {
            return Ok(Some(suggestion(
                &original,
                candidate,
                ReplacementConfidence::Medium,
                "same generic equivalent",
            )));
        }
    }
    // Low: same category only
    for candidate in &candidates {
        if allowed(candidate) {
            return Ok(Some(suggestion(
                &original,
                candidate,
                ReplacementConfidence::Low,
                "same category",
            )));
        }
    }

    Ok(None)
}

fn suggestion(
    original: &Medicine,
    candidate: &Medicine,
    confidence: ReplacementConfidence,
    reason: &str,
) -> ReplacementSuggestion {
    ReplacementSuggestion {
        original: original.name.clone(),
        replacement: candidate.name.clone(),
        confidence,
        requires_pharmacist_override: confidence != ReplacementConfidence::High,
        price: candidate.price,
        stock: candidate.stock,
        reason: reason.to_string(),
    }
}

/// Strip trailing dosage tokens (500mg, 10 ml), dose-form words and
/// parenthesized qualifiers to get the base medicine name.
pub fn extract_base_name(medicine_name: &str) -> String {
    // Drop parenthesized qualifiers first
    let mut cleaned = String::with_capacity(medicine_name.len());
    let mut depth = 0usize;
    for c in medicine_name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => cleaned.push(c),
            _ => {}
        }
    }

    const FORMS: &[&str] = &[
        "tablet",
        "tablets",
        "capsule",
        "capsules",
        "syrup",
        "syrups",
        "injection",
        "injections",
        "cream",
        "creams",
        "ointment",
        "ointments",
    ];
    const UNITS: &[&str] = &["mg", "ml", "g", "mcg", "iu"];

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let mut kept: Vec<&str> = Vec::new();
    let mut skip_next_unit = false;
    for token in tokens {
        let lower = token.to_lowercase();
        if skip_next_unit {
            skip_next_unit = false;
            if UNITS.contains(&lower.as_str()) {
                continue;
            }
        }
        if FORMS.contains(&lower.as_str()) {
            continue;
        }
        if is_dosage_token(&lower, UNITS) {
            continue;
        }
        if lower.chars().all(|c| c.is_ascii_digit()) {
            // "500 mg" split across tokens
            skip_next_unit = true;
            continue;
        }
        kept.push(token);
    }
    kept.join(" ")
}

fn is_dosage_token(token: &str, units: &[&str]) -> bool {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    units.contains(&&token[digits.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderItem;
    use crate::store::NewMedicine;
    use rust_decimal::Decimal;

    fn med(name: &str, category: &str, price: i64, stock: i64) -> NewMedicine {
        NewMedicine {
            name: name.to_string(),
            category: Some(category.to_string()),
            price: Paise::from_rupees(Decimal::from(price)).unwrap(),
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
    fn base_name_extraction() {
        assert_eq!(extract_base_name("Paracetamol 500mg"), "Paracetamol");
        assert_eq!(extract_base_name("Crocin (Paracetamol)"), "Crocin");
        assert_eq!(
            extract_base_name("Amoxicillin 250mg Capsules"),
            "Amoxicillin"
        );
        assert_eq!(extract_base_name("Ibuprofen 400 mg tablets"), "Ibuprofen");
    }

    #[tokio::test]
    async fn classifies_availability_and_scores() {
        let store = Store::in_memory().await.unwrap();
        store.add_medicine(&med("Paracetamol 500mg", "Analgesic", 10, 100)).await.unwrap();
        store.add_medicine(&med("Ibuprofen 400mg", "Analgesic", 15, 0)).await.unwrap();

        let mut state = PipelineState::new("s1");
        state.extracted_items = vec![
            OrderItem::new("Paracetamol 500mg", 2),
            OrderItem::new("Ibuprofen 400mg", 1),
            OrderItem::new("Nonexistium", 1),
        ];

        run(&mut state, &store).await.unwrap();

        let record = state.trace_metadata.inventory.clone().unwrap();
        assert_eq!(record.status, InventoryStatus::PartialAvailable);
        assert!((record.availability_score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.results[0].status, StockStatus::Available);
        assert_eq!(record.results[1].status, StockStatus::OutOfStock);
        assert_eq!(record.results[2].status, StockStatus::NotFound);
        assert_eq!(state.extracted_items[0].in_stock, Some(true));
        assert_eq!(state.extracted_items[1].in_stock, Some(false));
    }

    #[tokio::test]
    async fn alternatives_sorted_by_stock_then_price() {
        let store = Store::in_memory().await.unwrap();
        store.add_medicine(&med("Paracetamol 500mg", "Analgesic", 10, 0)).await.unwrap();
        store.add_medicine(&med("Crocin 500", "Analgesic", 20, 50)).await.unwrap();
        store.add_medicine(&med("Dolo 650", "Analgesic", 15, 80)).await.unwrap();
        store.add_medicine(&med("Calpol 500", "Analgesic", 12, 50)).await.unwrap();

        let alternatives = find_alternatives("Paracetamol 500mg", &store).await.unwrap();
        assert_eq!(alternatives[0].name, "Dolo 650");
        // stock tie broken by lower price
        assert_eq!(alternatives[1].name, "Calpol 500");
        assert_eq!(alternatives[2].name, "Crocin 500");
    }

    #[tokio::test]
    async fn replacement_tiers() {
        let store = Store::in_memory().await.unwrap();
        let mut original = med("Crocin 500mg", "Analgesic", 10, 0);
        original.active_ingredients = Some("Paracetamol".to_string());
        original.generic_equivalent = Some("paracetamol".to_string());
        store.add_medicine(&original).await.unwrap();

        let mut high = med("Dolo 650", "Analgesic", 9, 40);
        high.active_ingredients = Some("Paracetamol".to_string());
        store.add_medicine(&high).await.unwrap();

        let r = find_equivalent_replacement("Crocin 500mg", &store, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.replacement, "Dolo 650");
        assert_eq!(r.confidence, ReplacementConfidence::High);
        assert!(!r.requires_pharmacist_override);
    }

    #[tokio::test]
    async fn allergy_conflict_refuses_replacement() {
        let store = Store::in_memory().await.unwrap();
        let mut original = med("BrandX", "Antibiotic", 10, 0);
        original.active_ingredients = Some("Amoxicillin".to_string());
        store.add_medicine(&original).await.unwrap();

        let mut candidate = med("BrandY", "Antibiotic", 8, 30);
        candidate.active_ingredients = Some("Amoxicillin".to_string());
        candidate.contraindications = Some("Penicillin allergy".to_string());
        store.add_medicine(&candidate).await.unwrap();

        let refused =
            find_equivalent_replacement("BrandX", &store, &["Penicillin".to_string()])
                .await
                .unwrap();
        assert!(refused.is_none());

        let allowed = find_equivalent_replacement("BrandX", &store, &[]).await.unwrap();
        assert!(allowed.is_some());
    }

    #[tokio::test]
    async fn low_confidence_requires_override() {
        let store = Store::in_memory().await.unwrap();
        store.add_medicine(&med("MedA", "Antacid", 10, 0)).await.unwrap();
        store.add_medicine(&med("MedB", "Antacid", 8, 25)).await.unwrap();

        let r = find_equivalent_replacement("MedA", &store, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.confidence, ReplacementConfidence::Low);
        assert!(r.requires_pharmacist_override);
    }
}
