//! Medical validator
//!
//! Two modes, auto-detected from whether a prescription was uploaded. OTC
//! mode validates symptom-based recommendations (prescription requirements,
//! patient context, interactions, clinical severity) and produces an
//! AI-assisted recommendation summary. Prescription mode runs the rules
//! engine over the extracted prescription and produces a digitally
//! reconstructed prescription that renders unknown fields as
//! "[Not clearly visible]" and never invents data.
//!
//! The validator only ever escalates the pharmacist decision
//! (approved → needs_review → rejected); an earlier rejection (e.g. from the
//! risk scorer) is never weakened.

pub mod interactions;
pub mod rules;
pub mod severity;

pub use interactions::{
    Interaction, InteractionChecker, InteractionReport, InteractionSeverity,
    RuleBasedInteractionChecker, rule_based_check,
};
pub use rules::{IssueSeverity, RuleStatus, ValidationIssue};
pub use severity::{
    HeuristicSeverityModel, ModelSeverity, RecommendedAction, SeverityAssessment, SeverityModel,
};

use crate::domain::{OrderItem, PatientContext, PharmacistDecision, PipelineState};
use crate::errors::AgentError;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rules::{PrescriptionDetails, RuleMedicine};
use serde::{Deserialize, Serialize};

const NOT_VISIBLE: &str = "[Not clearly visible]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Otc,
    Prescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtcRecommendation {
    pub medicine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    pub quantity: u32,
    pub reason: String,
}

/// AI-Assisted OTC Recommendation Summary. Carries no doctor fields at all:
/// there is nothing to fabricate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtcSummary {
    pub title: String,
    pub disclaimer: String,
    pub patient_context: PatientContext,
    pub recommendations: Vec<OtcRecommendation>,
    pub safety_notes: Vec<String>,
    pub validation_status: PharmacistDecision,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedHeader {
    pub patient_name: String,
    pub doctor_name: String,
    pub date: String,
    pub signature_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedMedicine {
    pub medicine: String,
    pub dosage: String,
    pub quantity: u32,
    pub as_prescribed: bool,
}

/// Digitally Reconstructed Prescription: only fields actually extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedPrescription {
    pub title: String,
    pub disclaimer: String,
    pub prescription_details: ReconstructedHeader,
    pub medicines: Vec<ReconstructedMedicine>,
    pub reconstruction_confidence: f64,
    pub reconstructed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub mode: ValidationMode,
    pub status: PharmacistDecision,
    pub risk_score: f64,
    pub requires_pharmacist: bool,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drug_interactions: Option<InteractionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_assessment: Option<SeverityAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otc_summary: Option<OtcSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconstructed_prescription: Option<ReconstructedPrescription>,
    pub dosage_inferred: bool,
    pub reasoning_trace: Vec<String>,
    pub validation_timestamp: DateTime<Utc>,
}

/// Strengthen a decision; never weaken one already made.
fn escalate(current: &mut Option<PharmacistDecision>, to: PharmacistDecision) {
    let rank = |d: Option<PharmacistDecision>| match d {
        Some(PharmacistDecision::Rejected) => 3,
        Some(PharmacistDecision::NeedsReview) => 2,
        Some(PharmacistDecision::Approved) => 1,
        None => 0,
    };
    if rank(Some(to)) > rank(*current) {
        *current = Some(to);
    }
}

pub async fn run(
    state: &mut PipelineState,
    store: &Store,
    checker: &dyn InteractionChecker,
    severity_model: &dyn SeverityModel,
) -> Result<(), AgentError> {
    if state.prescription_uploaded {
        validate_prescription_mode(state, store, checker).await
    } else {
        validate_otc_mode(state, store, checker, severity_model).await
    }
}

/// Interaction check with the rule-table fallback when the adapter fails.
async fn check_with_fallback(
    checker: &dyn InteractionChecker,
    items: &[OrderItem],
) -> InteractionReport {
    match checker.check_interactions(items).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "interaction adapter unavailable, using rule table");
            rule_based_check(items)
        }
    }
}

async fn validate_otc_mode(
    state: &mut PipelineState,
    store: &Store,
    checker: &dyn InteractionChecker,
    severity_model: &dyn SeverityModel,
) -> Result<(), AgentError> {
    let mut trace = vec!["Mode: OTC recommendation validation".to_string()];
    let mut dosage_inferred = false;
    let mut prescription_required: Vec<String> = Vec::new();

    for i in 0..state.extracted_items.len() {
        let name = state.extracted_items[i].medicine_name.clone();
        let Some(found) = store.get_medicine(&name).await? else {
            // Unknown substance: flag for pharmacist review.
            prescription_required.push(name.clone());
            trace.push(format!("{name}: not in catalog, requires pharmacist review"));
            continue;
        };
        let medicine = found.medicine;

        if state.extracted_items[i].dosage.is_none() {
            if let Some(strength) = medicine.strength.clone() {
                trace.push(format!("Inferred dosage for {name}: {strength} from catalog"));
                state.extracted_items[i].dosage = Some(strength);
                dosage_inferred = true;
            } else {
                escalate(
                    &mut state.pharmacist_decision,
                    PharmacistDecision::NeedsReview,
                );
                state.safety_issues.push(format!(
                    "Dosage unspecified — pharmacist confirmation required. ({name})"
                ));
                trace.push(format!("{name}: dosage unspecified, pharmacist confirmation"));
            }
        }

        state.extracted_items[i].requires_prescription = Some(medicine.requires_prescription);
        if medicine.requires_prescription {
            prescription_required.push(name.clone());
            trace.push(format!("{name}: requires prescription"));
        } else {
            trace.push(format!("{name}: OTC"));
        }
    }

    if !prescription_required.is_empty() {
        escalate(
            &mut state.pharmacist_decision,
            PharmacistDecision::NeedsReview,
        );
        state.prescription_verified = false;
        for name in &prescription_required {
            state.safety_issues.push(format!(
                "[PRESCRIPTION REQUIRED] {name} requires a valid prescription"
            ));
        }
        trace.push(format!(
            "{} medicine(s) require prescription upload",
            prescription_required.len()
        ));

        state.trace_metadata.medical_validator = Some(ValidationRecord {
            mode: ValidationMode::Otc,
            status: state
                .pharmacist_decision
                .unwrap_or(PharmacistDecision::NeedsReview),
            risk_score: 0.0,
            requires_pharmacist: true,
            issues: Vec::new(),
            drug_interactions: None,
            severity_assessment: None,
            otc_summary: None,
            reconstructed_prescription: None,
            dosage_inferred,
            reasoning_trace: trace,
            validation_timestamp: Utc::now(),
        });
        return Ok(());
    }

    // Patient context warnings
    if let Some(age) = state.patient_context.age {
        if age < 12 {
            state
                .safety_issues
                .push("[WARNING] Pediatric patient - verify dosages".to_string());
            trace.push("Pediatric patient, extra caution".to_string());
        } else if age > 65 {
            state
                .safety_issues
                .push("[WARNING] Elderly patient - monitor for side effects".to_string());
            trace.push("Elderly patient, monitoring advised".to_string());
        }
    }
    if !state.patient_context.allergies.is_empty() {
        let allergies = state.patient_context.allergies.join(", ");
        state
            .safety_issues
            .push(format!("[ALERT] Patient allergies: {allergies}"));
        trace.push(format!("Known allergies: {allergies}"));
    }

    // Drug interactions
    let mut interaction_report = None;
    if state.extracted_items.len() > 1 {
        let report = check_with_fallback(checker, &state.extracted_items).await;
        trace.push("Drug interaction check completed".to_string());

        if report.has_interactions {
            for interaction in &report.interactions {
                let meds = interaction.medicines.join(" + ");
                state.safety_issues.push(format!(
                    "[{}] Drug Interaction: {meds} - {}",
                    interaction.severity.as_str().to_uppercase(),
                    interaction.description
                ));
                trace.push(format!("{meds}: {}", interaction.description));
            }
            if report.severity == InteractionSeverity::Severe && !report.safe_to_dispense {
                escalate(&mut state.pharmacist_decision, PharmacistDecision::Rejected);
                trace.push("Severe interaction, not safe to dispense".to_string());
            } else if report.severity == InteractionSeverity::Severe {
                escalate(
                    &mut state.pharmacist_decision,
                    PharmacistDecision::NeedsReview,
                );
                trace.push("Severe interaction, pharmacist review required".to_string());
            } else {
                escalate(&mut state.pharmacist_decision, PharmacistDecision::Approved);
                trace.push("Approved with interaction warnings".to_string());
            }
        } else {
            escalate(&mut state.pharmacist_decision, PharmacistDecision::Approved);
            trace.push("No drug interactions detected".to_string());
        }
        interaction_report = Some(report);
    } else {
        escalate(&mut state.pharmacist_decision, PharmacistDecision::Approved);
        trace.push("Single medicine, approved".to_string());
    }

    // Clinical severity
    let symptoms = if state.patient_context.symptoms.is_empty() {
        let names: Vec<&str> = state
            .extracted_items
            .iter()
            .map(|i| i.medicine_name.as_str())
            .collect();
        format!("Requesting: {}", names.join(", "))
    } else {
        state.patient_context.symptoms.join(", ")
    };
    let assessment =
        severity::assess_severity(severity_model, &symptoms, &state.patient_context).await;
    trace.push(format!(
        "Severity assessment: {}/10 ({:?})",
        assessment.severity_score, assessment.risk_level
    ));

    if assessment.emergency_override {
        escalate(&mut state.pharmacist_decision, PharmacistDecision::Rejected);
        state
            .safety_issues
            .push("[CRITICAL] EMERGENCY SYMPTOMS DETECTED - SEEK IMMEDIATE CARE".to_string());
        trace.push("Emergency override triggered".to_string());
    } else if assessment.severity_score >= 7 {
        escalate(
            &mut state.pharmacist_decision,
            PharmacistDecision::NeedsReview,
        );
        state.safety_issues.push(format!(
            "[HIGH SEVERITY] Clinical score {}/10 requires doctor",
            assessment.severity_score
        ));
    }

    let status = state
        .pharmacist_decision
        .unwrap_or(PharmacistDecision::Approved);

    let summary = OtcSummary {
        title: "AI-Assisted OTC Recommendation Summary".to_string(),
        disclaimer:
            "This is an AI-generated recommendation based on reported symptoms. Not a prescription."
                .to_string(),
        patient_context: state.patient_context.clone(),
        recommendations: state
            .extracted_items
            .iter()
            .map(|item| OtcRecommendation {
                medicine: item.medicine_name.clone(),
                dosage: item.dosage.clone(),
                quantity: item.quantity,
                reason: "Symptom-based recommendation".to_string(),
            })
            .collect(),
        safety_notes: state.safety_issues.clone(),
        validation_status: status,
        generated_at: Utc::now(),
    };

    state.trace_metadata.medical_validator = Some(ValidationRecord {
        mode: ValidationMode::Otc,
        status,
        risk_score: 0.0,
        requires_pharmacist: status != PharmacistDecision::Approved,
        issues: Vec::new(),
        drug_interactions: interaction_report,
        severity_assessment: Some(assessment),
        otc_summary: Some(summary),
        reconstructed_prescription: None,
        dosage_inferred,
        reasoning_trace: trace,
        validation_timestamp: Utc::now(),
    });

    Ok(())
}

async fn validate_prescription_mode(
    state: &mut PipelineState,
    store: &Store,
    checker: &dyn InteractionChecker,
) -> Result<(), AgentError> {
    let mut trace = vec!["Mode: prescription validation".to_string()];

    if !state.prescription_uploaded || state.prescription.is_none() {
        escalate(&mut state.pharmacist_decision, PharmacistDecision::Rejected);
        state
            .safety_issues
            .push("No prescription uploaded".to_string());
        trace.push("No prescription data available".to_string());
        state.trace_metadata.medical_validator = Some(ValidationRecord {
            mode: ValidationMode::Prescription,
            status: PharmacistDecision::Rejected,
            risk_score: 1.0,
            requires_pharmacist: true,
            issues: Vec::new(),
            drug_interactions: None,
            severity_assessment: None,
            otc_summary: None,
            reconstructed_prescription: None,
            dosage_inferred: false,
            reasoning_trace: trace,
            validation_timestamp: Utc::now(),
        });
        return Ok(());
    }
    let prescription = state.prescription.clone().unwrap_or_default();
    trace.push("Prescription data available".to_string());

    // Fill missing dosages from the catalog where the strength is known.
    let mut dosage_inferred = false;
    for i in 0..state.extracted_items.len() {
        if state.extracted_items[i].dosage.is_some() {
            continue;
        }
        let name = state.extracted_items[i].medicine_name.clone();
        if let Some(found) = store.get_medicine(&name).await? {
            if let Some(strength) = found.medicine.strength {
                trace.push(format!("Inferred dosage for {name}: {strength} from catalog"));
                state.extracted_items[i].dosage = Some(strength);
                dosage_inferred = true;
            }
        }
    }

    let details = PrescriptionDetails {
        patient_name: prescription.patient_name.clone(),
        doctor_name: prescription.doctor_name.clone(),
        date: prescription.date.clone(),
        signature_present: prescription.signature_present,
        medicines: state
            .extracted_items
            .iter()
            .map(|item| RuleMedicine {
                name: item.medicine_name.clone(),
                dosage: item.dosage.clone(),
                frequency: item.frequency.clone(),
            })
            .collect(),
    };
    trace.push(format!("Extracted {} medicine(s)", details.medicines.len()));

    let report = rules::validate_prescription(&details);
    trace.push("Rules engine executed".to_string());

    let interaction_report = check_with_fallback(checker, &state.extracted_items).await;
    trace.push("Drug interaction check completed".to_string());

    let mut status = report.status;
    let mut requires_pharmacist = report.requires_pharmacist;

    if interaction_report.severity == InteractionSeverity::Severe
        && !interaction_report.safe_to_dispense
    {
        status = RuleStatus::Rejected;
        requires_pharmacist = true;
        trace.push("Status changed to rejected: severe drug interaction".to_string());
        for interaction in &interaction_report.interactions {
            let meds = interaction.medicines.join(" + ");
            state.safety_issues.push(format!(
                "[CRITICAL] Drug Interaction: {meds} - {}",
                interaction.description
            ));
        }
    } else if interaction_report.has_interactions
        && interaction_report.severity >= InteractionSeverity::Moderate
    {
        if status == RuleStatus::Approved {
            status = RuleStatus::NeedsReview;
            requires_pharmacist = true;
            trace.push("Status changed to needs review: drug interactions".to_string());
        }
        for interaction in &interaction_report.interactions {
            let meds = interaction.medicines.join(" + ");
            state.safety_issues.push(format!(
                "[{}] Drug Interaction: {meds} - {}",
                interaction.severity.as_str().to_uppercase(),
                interaction.description
            ));
        }
    }

    let interaction_bonus = match interaction_report.severity {
        InteractionSeverity::Severe => 0.4,
        InteractionSeverity::Moderate => 0.2,
        InteractionSeverity::Minor => 0.1,
        InteractionSeverity::None => 0.0,
    };
    let risk_score = (report.risk_score + interaction_bonus).min(1.0);
    trace.extend(report.reasoning_trace.iter().cloned());

    if status != RuleStatus::Approved {
        for issue in &report.issues {
            state.safety_issues.push(issue.to_safety_issue());
        }
    }

    let decision = match status {
        RuleStatus::Approved => {
            state.prescription_verified = true;
            trace.push("Prescription approved".to_string());
            PharmacistDecision::Approved
        }
        RuleStatus::NeedsReview => {
            state.prescription_verified = false;
            trace.push("Prescription needs review".to_string());
            PharmacistDecision::NeedsReview
        }
        RuleStatus::Rejected => {
            state.prescription_verified = false;
            trace.push("Prescription rejected".to_string());
            PharmacistDecision::Rejected
        }
    };
    escalate(&mut state.pharmacist_decision, decision);

    let reconstructed = ReconstructedPrescription {
        title: "Digitally Reconstructed Prescription".to_string(),
        disclaimer: "Reconstructed from uploaded prescription image. Original prescription \
                     required for dispensing."
            .to_string(),
        prescription_details: ReconstructedHeader {
            patient_name: prescription
                .patient_name
                .unwrap_or_else(|| NOT_VISIBLE.to_string()),
            doctor_name: prescription
                .doctor_name
                .unwrap_or_else(|| NOT_VISIBLE.to_string()),
            date: prescription.date.unwrap_or_else(|| NOT_VISIBLE.to_string()),
            signature_present: prescription.signature_present,
        },
        medicines: state
            .extracted_items
            .iter()
            .map(|item| ReconstructedMedicine {
                medicine: item.medicine_name.clone(),
                dosage: item
                    .dosage
                    .clone()
                    .unwrap_or_else(|| "[Not specified]".to_string()),
                quantity: item.quantity,
                as_prescribed: true,
            })
            .collect(),
        reconstruction_confidence: prescription.confidence,
        reconstructed_at: Utc::now(),
    };

    state.trace_metadata.medical_validator = Some(ValidationRecord {
        mode: ValidationMode::Prescription,
        status: state
            .pharmacist_decision
            .unwrap_or(PharmacistDecision::NeedsReview),
        risk_score,
        requires_pharmacist,
        issues: report.issues,
        drug_interactions: Some(interaction_report),
        severity_assessment: None,
        otc_summary: None,
        reconstructed_prescription: Some(reconstructed),
        dosage_inferred,
        reasoning_trace: trace,
        validation_timestamp: Utc::now(),
    });

    Ok(())
}
