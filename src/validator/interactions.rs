//! Drug interaction checking
//!
//! The checker is an external contract (LLM adapter in production). The
//! rule-based table below is the always-available fallback; its combinations
//! and response shape are what the tests assume.

use crate::domain::OrderItem;
use crate::errors::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum InteractionSeverity {
    #[default]
    None,
    Minor,
    Moderate,
    Severe,
}

impl InteractionSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionSeverity::None => "none",
            InteractionSeverity::Minor => "minor",
            InteractionSeverity::Moderate => "moderate",
            InteractionSeverity::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub medicines: Vec<String>,
    pub severity: InteractionSeverity,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionReport {
    pub has_interactions: bool,
    pub severity: InteractionSeverity,
    pub interactions: Vec<Interaction>,
    pub warnings: Vec<String>,
    pub safe_to_dispense: bool,
}

#[async_trait]
pub trait InteractionChecker: Send + Sync {
    async fn check_interactions(&self, items: &[OrderItem])
    -> Result<InteractionReport, AgentError>;
}

struct Combination {
    medicines: &'static [&'static str],
    severity: InteractionSeverity,
    description: &'static str,
    recommendation: &'static str,
}

const DANGEROUS_COMBINATIONS: &[Combination] = &[
    // NSAIDs + anticoagulants
    Combination {
        medicines: &["aspirin", "warfarin"],
        severity: InteractionSeverity::Severe,
        description: "NSAIDs with anticoagulants increase bleeding risk",
        recommendation: "Avoid combination or use with extreme caution and monitoring",
    },
    Combination {
        medicines: &["ibuprofen", "warfarin"],
        severity: InteractionSeverity::Severe,
        description: "NSAIDs with anticoagulants increase bleeding risk",
        recommendation: "Avoid combination or use with extreme caution and monitoring",
    },
    // Multiple NSAIDs
    Combination {
        medicines: &["aspirin", "ibuprofen"],
        severity: InteractionSeverity::Moderate,
        description: "Multiple NSAIDs increase GI bleeding and kidney damage risk",
        recommendation: "Use only one NSAID at a time",
    },
    Combination {
        medicines: &["ibuprofen", "diclofenac"],
        severity: InteractionSeverity::Moderate,
        description: "Multiple NSAIDs increase GI bleeding and kidney damage risk",
        recommendation: "Use only one NSAID at a time",
    },
    // Benzodiazepines + opioids
    Combination {
        medicines: &["alprazolam", "tramadol"],
        severity: InteractionSeverity::Severe,
        description: "Benzodiazepines with opioids can cause severe respiratory depression",
        recommendation: "Avoid combination, high risk of overdose",
    },
    Combination {
        medicines: &["diazepam", "codeine"],
        severity: InteractionSeverity::Severe,
        description: "Benzodiazepines with opioids can cause severe respiratory depression",
        recommendation: "Avoid combination, high risk of overdose",
    },
    // Same-class antibiotics
    Combination {
        medicines: &["amoxicillin", "ampicillin"],
        severity: InteractionSeverity::Moderate,
        description: "Multiple antibiotics from same class (penicillins)",
        recommendation: "Use only one antibiotic unless specifically prescribed",
    },
    // ACE inhibitors + potassium
    Combination {
        medicines: &["lisinopril", "potassium"],
        severity: InteractionSeverity::Moderate,
        description: "ACE inhibitors with potassium can cause hyperkalemia",
        recommendation: "Monitor potassium levels, may need dose adjustment",
    },
];

const NSAIDS: &[&str] = &["aspirin", "ibuprofen", "diclofenac", "naproxen", "indomethacin"];
const ANTIBIOTICS: &[&str] = &[
    "amoxicillin",
    "azithromycin",
    "ciprofloxacin",
    "doxycycline",
    "cephalexin",
];
const CONTROLLED: &[&str] = &["alprazolam", "diazepam", "tramadol", "codeine", "morphine"];
const STEROIDS: &[&str] = &["prednisolone", "dexamethasone", "hydrocortisone"];

/// Fixed-table interaction check with the same response shape as the LLM
/// adapter.
pub fn rule_based_check(items: &[OrderItem]) -> InteractionReport {
    let names: Vec<String> = items
        .iter()
        .map(|i| i.medicine_name.trim().to_lowercase())
        .collect();

    let mut report = InteractionReport {
        safe_to_dispense: true,
        ..Default::default()
    };

    // Duplicates
    let mut seen = std::collections::HashSet::new();
    for name in &names {
        if !seen.insert(name.clone()) {
            report.interactions.push(Interaction {
                medicines: vec![name.clone(), name.clone()],
                severity: InteractionSeverity::Moderate,
                description: format!("Duplicate medicine detected: {name}"),
                recommendation: "Verify if intentional, may indicate prescription error"
                    .to_string(),
            });
            report.has_interactions = true;
            report.severity = report.severity.max(InteractionSeverity::Moderate);
        }
    }

    // Known dangerous combinations
    for combo in DANGEROUS_COMBINATIONS {
        let all_present = combo
            .medicines
            .iter()
            .all(|med| names.iter().any(|name| name.contains(med)));
        if all_present {
            report.interactions.push(Interaction {
                medicines: combo.medicines.iter().map(|m| m.to_string()).collect(),
                severity: combo.severity,
                description: combo.description.to_string(),
                recommendation: combo.recommendation.to_string(),
            });
            report.has_interactions = true;
            report.severity = report.severity.max(combo.severity);
            if combo.severity == InteractionSeverity::Severe {
                report.safe_to_dispense = false;
            }
        }
    }

    // Class warnings
    let class_present =
        |class: &[&str]| class.iter().any(|c| names.iter().any(|n| n.contains(c)));
    if class_present(NSAIDS) {
        report
            .warnings
            .push("NSAIDs present: Take with food to reduce GI irritation".to_string());
    }
    if class_present(ANTIBIOTICS) {
        report.warnings.push(
            "Antibiotics present: Complete full course even if symptoms improve".to_string(),
        );
    }
    if class_present(CONTROLLED) {
        report.warnings.push(
            "Controlled substances present: Risk of dependence, use exactly as prescribed"
                .to_string(),
        );
    }
    if class_present(STEROIDS) {
        report
            .warnings
            .push("Steroids present: Do not stop abruptly, taper as directed".to_string());
    }

    report
}

/// The fallback checker, usable wherever the adapter contract is expected.
pub struct RuleBasedInteractionChecker;

#[async_trait]
impl InteractionChecker for RuleBasedInteractionChecker {
    async fn check_interactions(
        &self,
        items: &[OrderItem],
    ) -> Result<InteractionReport, AgentError> {
        Ok(rule_based_check(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(names: &[&str]) -> Vec<OrderItem> {
        names.iter().map(|n| OrderItem::new(*n, 1)).collect()
    }

    #[test]
    fn warfarin_aspirin_is_severe_and_unsafe() {
        let report = rule_based_check(&items(&["Warfarin 5mg", "Aspirin 100mg"]));
        assert!(report.has_interactions);
        assert_eq!(report.severity, InteractionSeverity::Severe);
        assert!(!report.safe_to_dispense);
    }

    #[test]
    fn multiple_nsaids_are_moderate() {
        let report = rule_based_check(&items(&["Aspirin 100mg", "Ibuprofen 400mg"]));
        assert_eq!(report.severity, InteractionSeverity::Moderate);
        assert!(report.safe_to_dispense);
    }

    #[test]
    fn duplicates_are_flagged() {
        let report = rule_based_check(&items(&["Cetirizine", "Cetirizine"]));
        assert!(report.has_interactions);
        assert_eq!(report.severity, InteractionSeverity::Moderate);
    }

    #[test]
    fn single_otc_medicine_is_clean() {
        let report = rule_based_check(&items(&["Cetirizine 10mg"]));
        assert!(!report.has_interactions);
        assert_eq!(report.severity, InteractionSeverity::None);
        assert!(report.safe_to_dispense);
    }

    #[test]
    fn class_warnings_are_additive() {
        let report = rule_based_check(&items(&["Ibuprofen 400mg", "Amoxicillin 500mg"]));
        assert_eq!(report.warnings.len(), 2);
    }
}
