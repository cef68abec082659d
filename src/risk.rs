//! Behavioral risk scoring
//!
//! Every request updates a cumulative per-patient risk profile. The request
//! assessment itself is pure; persistence accumulates a monotone score
//! (capped at 100) and the pipeline action can downgrade or block the
//! pharmacist decision before validation even runs.

use crate::domain::{PharmacistDecision, PipelineState, RiskLevel};
use crate::errors::AgentError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// Medicines with known abuse potential
const CONTROLLED_SUBSTANCES: &[&str] = &[
    "diazepam", "alprazolam", "clonazepam", "lorazepam", "midazolam", // benzodiazepines
    "morphine", "codeine", "tramadol", "oxycodone", "fentanyl", // opioids
    "methylphenidate", "amphetamine", "modafinil", // stimulants
    "zolpidem", "nitrazepam", "phenobarbital", // sedatives
    "buprenorphine", "methadone", // opioid substitutes
];

const ABUSE_POTENTIAL: &[&str] = &[
    "promethazine",
    "pregabalin",
    "gabapentin",
    "carisoprodol",
    "pseudoephedrine",
    "dextromethorphan",
];

const WEIGHT_CONTROLLED_SUBSTANCE: u32 = 40;
const WEIGHT_ABUSE_POTENTIAL: u32 = 35;
const WEIGHT_LARGE_QUANTITY: u32 = 25;
const WEIGHT_PRESCRIPTION_MISSING: u32 = 30;
const WEIGHT_MULTIPLE_CONTROLLED: u32 = 50;
const WEIGHT_VALIDATION_FAILURE: u32 = 15;

const LARGE_QUANTITY_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    Normal,
    Monitor,
    Review,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRecord {
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub score_delta: u32,
    pub factors_triggered: Vec<String>,
    pub escalated: bool,
    pub pipeline_action: RiskAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub factors_triggered: Vec<String>,
    pub score_delta: u32,
}

/// Pure assessment of the current request; touches neither state nor store.
pub fn assess_request(state: &PipelineState) -> RiskAssessment {
    let mut factors = Vec::new();
    let mut delta = 0u32;
    let mut controlled_count = 0usize;

    for item in &state.extracted_items {
        let name = item.medicine_name.to_lowercase();

        if CONTROLLED_SUBSTANCES.iter().any(|cs| name.contains(cs)) {
            factors.push(format!("controlled_substance:{}", item.medicine_name));
            delta += WEIGHT_CONTROLLED_SUBSTANCE;
            controlled_count += 1;
        } else if ABUSE_POTENTIAL.iter().any(|ap| name.contains(ap)) {
            factors.push(format!("abuse_potential:{}", item.medicine_name));
            delta += WEIGHT_ABUSE_POTENTIAL;
        }

        if item.quantity > LARGE_QUANTITY_THRESHOLD {
            factors.push(format!(
                "large_quantity:{}:{}",
                item.medicine_name, item.quantity
            ));
            delta += WEIGHT_LARGE_QUANTITY;
        }

        if item.requires_prescription.unwrap_or(false) && !state.prescription_uploaded {
            factors.push(format!("prescription_missing:{}", item.medicine_name));
            delta += WEIGHT_PRESCRIPTION_MISSING;
        }
    }

    if controlled_count >= 2 {
        factors.push("multiple_controlled_substances".to_string());
        delta += WEIGHT_MULTIPLE_CONTROLLED;
    }

    if state.pharmacist_decision == Some(PharmacistDecision::Rejected) {
        factors.push("validation_failure".to_string());
        delta += WEIGHT_VALIDATION_FAILURE;
    }

    RiskAssessment {
        factors_triggered: factors,
        score_delta: delta,
    }
}

/// Assess, persist the accumulated profile, and apply the pipeline action.
pub async fn run(state: &mut PipelineState, store: &Store) -> Result<(), AgentError> {
    let Some(user_id) = state.user_id.clone() else {
        tracing::warn!(session_id = %state.session_id, "risk scoring skipped, no user id");
        return Ok(());
    };

    let assessment = assess_request(state);

    let Some(patient) = store.patient_by_pid(&user_id).await? else {
        tracing::warn!(%user_id, "patient not found for risk scoring");
        return Ok(());
    };

    let old_score = patient.risk_score;
    let new_score = (old_score + assessment.score_delta).min(100);
    let old_level = RiskLevel::from_score(old_score);
    let new_level = RiskLevel::from_score(new_score);
    let escalated = new_level >= RiskLevel::High && old_level < RiskLevel::High;

    let all_flags: Vec<String> = patient
        .risk_flags
        .iter()
        .cloned()
        .chain(assessment.factors_triggered.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let flagged = new_level >= RiskLevel::High;

    store
        .update_patient_risk(&user_id, new_score, new_level, &all_flags, flagged)
        .await?;

    state.risk_score = new_score;
    state.risk_level = new_level;
    state.risk_factors_triggered = assessment.factors_triggered.clone();
    state.risk_escalated = escalated;

    let action = match new_level {
        RiskLevel::Critical => {
            state.pharmacist_decision = Some(PharmacistDecision::Rejected);
            state.safety_issues.push(format!(
                "CRITICAL RISK: Order blocked. Score: {new_score}/100. Factors: {}",
                assessment.factors_triggered.join(", ")
            ));
            RiskAction::Blocked
        }
        RiskLevel::High => {
            if state.pharmacist_decision == Some(PharmacistDecision::Approved)
                || state.pharmacist_decision.is_none()
            {
                state.pharmacist_decision = Some(PharmacistDecision::NeedsReview);
            }
            state.safety_issues.push(format!(
                "HIGH RISK: Pharmacist review required. Score: {new_score}/100"
            ));
            RiskAction::Review
        }
        RiskLevel::Elevated => {
            state
                .safety_issues
                .push(format!("ELEVATED RISK: Monitoring. Score: {new_score}/100"));
            RiskAction::Monitor
        }
        RiskLevel::Normal => RiskAction::Normal,
    };

    tracing::info!(
        %user_id,
        old_score,
        new_score,
        level = new_level.as_str(),
        escalated,
        "risk profile updated"
    );

    state.trace_metadata.risk_scoring = Some(RiskRecord {
        risk_score: new_score,
        risk_level: new_level,
        score_delta: assessment.score_delta,
        factors_triggered: assessment.factors_triggered,
        escalated,
        pipeline_action: action,
        timestamp: Utc::now(),
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderItem;

    fn state_with(items: Vec<OrderItem>) -> PipelineState {
        let mut s = PipelineState::new("s1");
        s.extracted_items = items;
        s
    }

    #[test]
    fn controlled_substance_scores_forty() {
        let s = state_with(vec![OrderItem::new("Diazepam 5mg", 1)]);
        let a = assess_request(&s);
        assert_eq!(a.score_delta, 40);
        assert_eq!(a.factors_triggered.len(), 1);
    }

    #[test]
    fn two_controlled_substances_add_bundle_weight() {
        let s = state_with(vec![
            OrderItem::new("Diazepam 5mg", 1),
            OrderItem::new("Tramadol 50mg", 1),
        ]);
        let a = assess_request(&s);
        // 40 + 40 + 50
        assert_eq!(a.score_delta, 130);
        assert!(
            a.factors_triggered
                .iter()
                .any(|f| f == "multiple_controlled_substances")
        );
    }

    #[test]
    fn large_quantity_and_missing_prescription() {
        let mut item = OrderItem::new("Amoxicillin 500mg", 12);
        item.requires_prescription = Some(true);
        let s = state_with(vec![item]);
        let a = assess_request(&s);
        assert_eq!(a.score_delta, 25 + 30);
    }

    #[test]
    fn abuse_potential_is_exclusive_with_controlled() {
        let s = state_with(vec![OrderItem::new("Pregabalin 75mg", 1)]);
        let a = assess_request(&s);
        assert_eq!(a.score_delta, 35);
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Normal);
        assert_eq!(RiskLevel::from_score(31), RiskLevel::Elevated);
        assert_eq!(RiskLevel::from_score(61), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(81), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }
}
