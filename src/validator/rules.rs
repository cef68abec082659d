//! Prescription rules engine
//!
//! Deterministic safety and compliance rules: expiry, signature, per-medicine
//! fields, controlled-substance schedules, daily dose limits, duplicates.
//! The engine returns issues plus an aggregate risk score; the status mapping
//! is: any critical issue rejects, any warning (or risk above 0.5) requires a
//! pharmacist, otherwise approved.

use chrono::{Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Prescriptions are valid for six months.
pub const PRESCRIPTION_VALIDITY_DAYS: i64 = 180;

// Schedule H (prescription-only)
const SCHEDULE_H: &[&str] = &[
    "amoxicillin",
    "azithromycin",
    "ciprofloxacin",
    "doxycycline",
    "cephalexin",
    "metronidazole",
    "levofloxacin",
    "clarithromycin",
];

// Schedule H1 (restricted antibiotics)
const SCHEDULE_H1: &[&str] = &[
    "cefixime",
    "cefpodoxime",
    "linezolid",
    "meropenem",
    "tigecycline",
    "colistin",
];

// Schedule X (habit-forming)
const SCHEDULE_X: &[&str] = &[
    "alprazolam",
    "diazepam",
    "lorazepam",
    "clonazepam",
    "tramadol",
    "codeine",
    "morphine",
    "fentanyl",
    "zolpidem",
    "zopiclone",
];

const STEROIDS: &[&str] = &[
    "prednisolone",
    "dexamethasone",
    "hydrocortisone",
    "betamethasone",
    "methylprednisolone",
];

const HIGH_RISK_DRUGS: &[&str] = &[
    "warfarin",
    "insulin",
    "digoxin",
    "lithium",
    "methotrexate",
    "phenytoin",
    "carbamazepine",
    "theophylline",
];

/// Maximum daily dose in mg for a fixed set of common drugs.
const MAX_DAILY_DOSE_MG: &[(&str, u32)] = &[
    ("paracetamol", 4000),
    ("ibuprofen", 2400),
    ("aspirin", 4000),
    ("diclofenac", 150),
    ("tramadol", 400),
    ("codeine", 240),
];

static ALL_CONTROLLED: Lazy<Vec<&'static str>> = Lazy::new(|| {
    SCHEDULE_H
        .iter()
        .chain(SCHEDULE_H1)
        .chain(SCHEDULE_X)
        .chain(STEROIDS)
        .copied()
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Warning,
    Info,
}

impl IssueSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Approved,
    NeedsReview,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub field: String,
    pub message: String,
    pub rule_violated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl ValidationIssue {
    fn new(
        severity: IssueSeverity,
        field: &str,
        message: impl Into<String>,
        rule: &str,
        recommendation: &str,
    ) -> Self {
        Self {
            severity,
            field: field.to_string(),
            message: message.into(),
            rule_violated: rule.to_string(),
            recommendation: Some(recommendation.to_string()),
        }
    }

    /// Rendering used on the pipeline's safety issue list.
    pub fn to_safety_issue(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.severity.as_str().to_uppercase(),
            self.rule_violated,
            self.message
        )
    }
}

/// One prescribed medicine as seen by the rules engine.
#[derive(Debug, Clone, Default)]
pub struct RuleMedicine {
    pub name: String,
    pub dosage: Option<String>,
    pub frequency: Option<String>,
}

/// Prescription fields fed to the engine (vision extraction plus items).
#[derive(Debug, Clone, Default)]
pub struct PrescriptionDetails {
    pub patient_name: Option<String>,
    pub doctor_name: Option<String>,
    pub date: Option<String>,
    pub signature_present: bool,
    pub medicines: Vec<RuleMedicine>,
}

#[derive(Debug, Clone)]
pub struct RuleReport {
    pub status: RuleStatus,
    pub issues: Vec<ValidationIssue>,
    pub requires_pharmacist: bool,
    pub risk_score: f64,
    pub reasoning_trace: Vec<String>,
}

pub fn validate_prescription(details: &PrescriptionDetails) -> RuleReport {
    let mut issues = Vec::new();
    let mut trace = Vec::new();

    let date_issues = validate_date(details.date.as_deref());
    trace.push(if date_issues.is_empty() {
        "Date validation: passed".to_string()
    } else {
        format!("Date validation: {} issue(s)", date_issues.len())
    });
    issues.extend(date_issues);

    let signature_issues =
        validate_signature(details.signature_present, details.doctor_name.as_deref());
    trace.push(if signature_issues.is_empty() {
        "Signature validation: passed".to_string()
    } else {
        format!("Signature validation: {} issue(s)", signature_issues.len())
    });
    issues.extend(signature_issues);

    if details.medicines.is_empty() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "medicines",
            "No medicines found in prescription",
            "NO_MEDICINES",
            "Verify prescription is complete",
        ));
        trace.push("Medicine validation: no medicines found".to_string());
    } else {
        trace.push(format!("Validating {} medicine(s)", details.medicines.len()));
        for medicine in &details.medicines {
            issues.extend(validate_medicine_details(medicine));
        }

        let controlled = validate_controlled_substances(&details.medicines);
        if !controlled.is_empty() {
            trace.push(format!("Controlled substances: {} flag(s)", controlled.len()));
        }
        issues.extend(controlled);

        let dosage = validate_dose_limits(&details.medicines);
        if !dosage.is_empty() {
            trace.push(format!("Dosage validation: {} issue(s)", dosage.len()));
        }
        issues.extend(dosage);

        let duplicates = validate_duplicates(&details.medicines);
        if !duplicates.is_empty() {
            trace.push(format!("Duplicate check: {} issue(s)", duplicates.len()));
        }
        issues.extend(duplicates);
    }

    let risk_score = risk_score_for(&issues);
    trace.push(format!("Risk score calculated: {risk_score:.2}"));

    let (status, requires_pharmacist) = determine_status(&issues, risk_score);
    trace.push(format!("Final status: {status:?}"));

    RuleReport {
        status,
        issues,
        requires_pharmacist,
        risk_score,
        reasoning_trace: trace,
    }
}

fn validate_date(date: Option<&str>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Some(date_str) = date else {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "date",
            "Prescription date is missing",
            "REQUIRED_DATE",
            "Request patient to provide prescription with date",
        ));
        return issues;
    };

    let parsed = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_str, fmt).ok());

    let Some(prescription_date) = parsed else {
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "date",
            format!("Could not parse date: {date_str}"),
            "DATE_FORMAT",
            "Verify date format with patient",
        ));
        return issues;
    };

    let today = Utc::now().date_naive();
    if prescription_date > today {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "date",
            format!("Prescription date is in the future: {date_str}"),
            "FUTURE_DATE",
            "Verify date with patient",
        ));
    }

    let expiry = prescription_date + Duration::days(PRESCRIPTION_VALIDITY_DAYS);
    if today > expiry {
        let days_expired = (today - expiry).num_days();
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "date",
            format!(
                "Prescription expired {days_expired} days ago (valid until {})",
                expiry.format("%d/%m/%Y")
            ),
            "EXPIRED_PRESCRIPTION",
            "Request new prescription from doctor",
        ));
    } else if (expiry - today).num_days() < 30 && prescription_date <= today {
        issues.push(ValidationIssue::new(
            IssueSeverity::Info,
            "date",
            format!("Prescription expires in {} days", (expiry - today).num_days()),
            "NEAR_EXPIRY",
            "Inform patient about upcoming expiry",
        ));
    }

    issues
}

fn validate_signature(signature_present: bool, doctor_name: Option<&str>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if !signature_present {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "signature",
            "Doctor signature is missing",
            "MISSING_SIGNATURE",
            "Request signed prescription from doctor",
        ));
    }
    if doctor_name.map(str::trim).filter(|d| !d.is_empty()).is_none() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "doctor_name",
            "Doctor name is missing",
            "MISSING_DOCTOR_NAME",
            "Verify doctor details",
        ));
    }
    issues
}

fn validate_medicine_details(medicine: &RuleMedicine) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let name = medicine.name.trim().to_lowercase();

    if name.is_empty() || name == "unknown" {
        issues.push(ValidationIssue::new(
            IssueSeverity::Critical,
            "medicine_name",
            "Medicine name is missing or unclear",
            "MISSING_MEDICINE_NAME",
            "Request clearer prescription or verify with doctor",
        ));
        return issues;
    }

    if medicine.dosage.is_none() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "dosage",
            format!("Dosage not specified for {name}"),
            "MISSING_DOSAGE",
            "Verify dosage with pharmacist or doctor",
        ));
    }
    if medicine.frequency.is_none() {
        issues.push(ValidationIssue::new(
            IssueSeverity::Warning,
            "frequency",
            format!("Frequency not specified for {name}"),
            "MISSING_FREQUENCY",
            "Verify frequency with pharmacist or doctor",
        ));
    }
    issues
}

fn validate_controlled_substances(medicines: &[RuleMedicine]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for medicine in medicines {
        let name = medicine.name.trim().to_lowercase();
        if !ALL_CONTROLLED.iter().any(|c| name.contains(c)) {
            if HIGH_RISK_DRUGS.iter().any(|d| name.contains(d)) {
                issues.push(high_risk_issue(&name));
            }
            continue;
        }

        if SCHEDULE_X.iter().any(|d| name.contains(d)) {
            issues.push(ValidationIssue::new(
                IssueSeverity::Critical,
                "medicine",
                format!("{name} is a Schedule X (habit-forming) drug"),
                "SCHEDULE_X_DRUG",
                "Verify prescription, maintain records, pharmacist approval required",
            ));
        } else if SCHEDULE_H1.iter().any(|d| name.contains(d)) {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                "medicine",
                format!("{name} is a Schedule H1 (restricted) antibiotic"),
                "SCHEDULE_H1_DRUG",
                "Verify prescription, pharmacist approval recommended",
            ));
        } else {
            issues.push(ValidationIssue::new(
                IssueSeverity::Info,
                "medicine",
                format!("{name} is a prescription-only drug"),
                "PRESCRIPTION_REQUIRED",
                "Verify valid prescription present",
            ));
        }

        if HIGH_RISK_DRUGS.iter().any(|d| name.contains(d)) {
            issues.push(high_risk_issue(&name));
        }
    }

    issues
}

fn high_risk_issue(name: &str) -> ValidationIssue {
    ValidationIssue::new(
        IssueSeverity::Warning,
        "medicine",
        format!("{name} is a high-risk drug requiring careful monitoring"),
        "HIGH_RISK_DRUG",
        "Counsel patient on proper usage and side effects",
    )
}

fn validate_dose_limits(medicines: &[RuleMedicine]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for medicine in medicines {
        let name = medicine.name.trim().to_lowercase();
        for (drug, max_daily) in MAX_DAILY_DOSE_MG {
            if !name.contains(drug) {
                continue;
            }
            let Some(single_dose) = medicine.dosage.as_deref().and_then(parse_mg) else {
                continue;
            };
            let times_per_day = medicine
                .frequency
                .as_deref()
                .and_then(parse_times_per_day)
                .unwrap_or(1);
            let daily = single_dose * times_per_day;

            if daily > *max_daily {
                issues.push(ValidationIssue::new(
                    IssueSeverity::Critical,
                    "dosage",
                    format!(
                        "{name} daily dosage ({daily}mg) exceeds maximum safe limit ({max_daily}mg)"
                    ),
                    "DOSAGE_EXCEEDS_LIMIT",
                    "Verify dosage with doctor, do not dispense",
                ));
            } else if f64::from(daily) > f64::from(*max_daily) * 0.8 {
                issues.push(ValidationIssue::new(
                    IssueSeverity::Warning,
                    "dosage",
                    format!(
                        "{name} daily dosage ({daily}mg) is close to maximum limit ({max_daily}mg)"
                    ),
                    "DOSAGE_NEAR_LIMIT",
                    "Counsel patient on proper usage",
                ));
            }
        }
    }

    issues
}

fn validate_duplicates(medicines: &[RuleMedicine]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for medicine in medicines {
        let name = medicine.name.trim().to_lowercase();
        if !seen.insert(name.clone()) && name != "unknown" {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                "medicines",
                format!("Duplicate medicine detected: {name}"),
                "DUPLICATE_MEDICINE",
                "Verify with doctor if intentional",
            ));
        }
    }
    issues
}

/// Dose in mg parsed out of strings like "500mg" or "500 mg".
fn parse_mg(dosage: &str) -> Option<u32> {
    let lower = dosage.to_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let value: u32 = lower[start..i].parse().ok()?;
            let rest = lower[i..].trim_start();
            if rest.starts_with("mg") {
                return Some(value);
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Frequency like "3 times daily" or "2x daily"; defaults elsewhere to once.
fn parse_times_per_day(frequency: &str) -> Option<u32> {
    let lower = frequency.to_lowercase();
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let value: u32 = lower[start..i].parse().ok()?;
            let rest = lower[i..].trim_start();
            if rest.starts_with("time") || rest.starts_with('x') {
                return Some(value);
            }
        } else {
            i += 1;
        }
    }
    None
}

fn risk_score_for(issues: &[ValidationIssue]) -> f64 {
    let score: f64 = issues
        .iter()
        .map(|i| match i.severity {
            IssueSeverity::Critical => 0.3,
            IssueSeverity::Warning => 0.15,
            IssueSeverity::Info => 0.05,
        })
        .sum();
    score.min(1.0)
}

fn determine_status(issues: &[ValidationIssue], risk_score: f64) -> (RuleStatus, bool) {
    let has_critical = issues.iter().any(|i| i.severity == IssueSeverity::Critical);
    let has_warning = issues.iter().any(|i| i.severity == IssueSeverity::Warning);

    if has_critical {
        (RuleStatus::Rejected, true)
    } else if risk_score > 0.5 || has_warning {
        (RuleStatus::NeedsReview, true)
    } else {
        (RuleStatus::Approved, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_details() -> PrescriptionDetails {
        PrescriptionDetails {
            patient_name: Some("Asha".to_string()),
            doctor_name: Some("Dr. Rao".to_string()),
            date: Some(Utc::now().date_naive().format("%d/%m/%Y").to_string()),
            signature_present: true,
            medicines: vec![RuleMedicine {
                name: "Cetirizine".to_string(),
                dosage: Some("10mg".to_string()),
                frequency: Some("1 time daily".to_string()),
            }],
        }
    }

    #[test]
    fn clean_prescription_is_approved() {
        let report = validate_prescription(&base_details());
        assert_eq!(report.status, RuleStatus::Approved);
        assert!(!report.requires_pharmacist);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn expired_prescription_is_rejected() {
        let mut details = base_details();
        let old = Utc::now().date_naive() - Duration::days(200);
        details.date = Some(old.format("%d/%m/%Y").to_string());
        let report = validate_prescription(&details);
        assert_eq!(report.status, RuleStatus::Rejected);
        assert!(
            report
                .issues
                .iter()
                .any(|i| i.rule_violated == "EXPIRED_PRESCRIPTION")
        );
    }

    #[test]
    fn future_date_is_rejected() {
        let mut details = base_details();
        let future = Utc::now().date_naive() + Duration::days(10);
        details.date = Some(future.format("%Y-%m-%d").to_string());
        let report = validate_prescription(&details);
        assert_eq!(report.status, RuleStatus::Rejected);
        assert!(report.issues.iter().any(|i| i.rule_violated == "FUTURE_DATE"));
    }

    #[test]
    fn missing_signature_and_doctor_reject() {
        let mut details = base_details();
        details.signature_present = false;
        details.doctor_name = None;
        let report = validate_prescription(&details);
        assert_eq!(report.status, RuleStatus::Rejected);
        assert_eq!(
            report
                .issues
                .iter()
                .filter(|i| i.severity == IssueSeverity::Critical)
                .count(),
            2
        );
    }

    #[test]
    fn schedule_x_drug_flags_critical() {
        let mut details = base_details();
        details.medicines.push(RuleMedicine {
            name: "Alprazolam 0.5mg".to_string(),
            dosage: Some("0.5mg".to_string()),
            frequency: Some("1 time daily".to_string()),
        });
        let report = validate_prescription(&details);
        assert_eq!(report.status, RuleStatus::Rejected);
        assert!(
            report
                .issues
                .iter()
                .any(|i| i.rule_violated == "SCHEDULE_X_DRUG")
        );
    }

    #[test]
    fn dose_over_daily_limit_is_critical() {
        let mut details = base_details();
        details.medicines = vec![RuleMedicine {
            name: "Paracetamol 650".to_string(),
            dosage: Some("1000mg".to_string()),
            frequency: Some("5 times daily".to_string()),
        }];
        let report = validate_prescription(&details);
        assert!(
            report
                .issues
                .iter()
                .any(|i| i.rule_violated == "DOSAGE_EXCEEDS_LIMIT")
        );
        assert_eq!(report.status, RuleStatus::Rejected);
    }

    #[test]
    fn missing_dosage_needs_review() {
        let mut details = base_details();
        details.medicines = vec![RuleMedicine {
            name: "Cetirizine".to_string(),
            dosage: None,
            frequency: Some("1 time daily".to_string()),
        }];
        let report = validate_prescription(&details);
        assert_eq!(report.status, RuleStatus::NeedsReview);
        assert!(report.requires_pharmacist);
    }

    #[test]
    fn duplicate_medicine_warns() {
        let mut details = base_details();
        let duplicate = details.medicines[0].clone();
        details.medicines.push(duplicate);
        let report = validate_prescription(&details);
        assert!(
            report
                .issues
                .iter()
                .any(|i| i.rule_violated == "DUPLICATE_MEDICINE")
        );
    }

    #[test]
    fn dosage_parsers() {
        assert_eq!(parse_mg("500mg"), Some(500));
        assert_eq!(parse_mg("500 mg twice"), Some(500));
        assert_eq!(parse_mg("two tablets"), None);
        assert_eq!(parse_times_per_day("3 times daily"), Some(3));
        assert_eq!(parse_times_per_day("2x daily"), Some(2));
        assert_eq!(parse_times_per_day("morning"), None);
    }
}
