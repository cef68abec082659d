//! Clinical severity assessment
//!
//! A model (external contract) provides an advisory 1-10 score; routing is
//! deterministic by threshold, and a fixed red-flag keyword list forces an
//! emergency regardless of what the model said. Emergency handling therefore
//! never depends on model availability.

use crate::domain::PatientContext;
use crate::errors::AgentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Symptoms that trigger immediate escalation.
pub const EMERGENCY_RED_FLAGS: &[&str] = &[
    "chest pain",
    "difficulty breathing",
    "unconscious",
    "seizure",
    "severe bleeding",
    "heavy bleeding",
    "stroke",
    "anaphylaxis",
    "severe allergic reaction",
    "heart attack",
    "can't breathe",
    "choking",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Otc,
    Pharmacist,
    Doctor,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityRisk {
    Low,
    Moderate,
    High,
    Critical,
}

/// Raw model output (§6 severity contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSeverity {
    pub severity_score: u8,
    pub risk_level: SeverityRisk,
    pub red_flags_detected: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub confidence: f64,
    pub reasoning: String,
}

#[async_trait]
pub trait SeverityModel: Send + Sync {
    async fn assess(
        &self,
        symptoms: &str,
        context: &PatientContext,
    ) -> Result<ModelSeverity, AgentError>;
}

/// Conservative stand-in when no model adapter is wired up. Returns a mild
/// advisory score; the deterministic red-flag override still applies on top.
pub struct HeuristicSeverityModel;

#[async_trait]
impl SeverityModel for HeuristicSeverityModel {
    async fn assess(
        &self,
        _symptoms: &str,
        _context: &PatientContext,
    ) -> Result<ModelSeverity, AgentError> {
        Ok(ModelSeverity {
            severity_score: 2,
            risk_level: SeverityRisk::Low,
            red_flags_detected: Vec::new(),
            recommended_action: RecommendedAction::Otc,
            confidence: 0.5,
            reasoning: "Heuristic advisory score (no model adapter)".to_string(),
        })
    }
}

/// Final assessment: model output combined with the deterministic override
/// and threshold routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityAssessment {
    pub severity_score: u8,
    pub risk_level: SeverityRisk,
    pub red_flags_detected: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub confidence: f64,
    pub reasoning: String,
    pub emergency_override: bool,
    /// Deterministic threshold route, independent of the model's suggestion.
    pub route: RecommendedAction,
}

pub async fn assess_severity(
    model: &dyn SeverityModel,
    symptoms: &str,
    context: &PatientContext,
) -> SeverityAssessment {
    let mut assessment = match model.assess(symptoms, context).await {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "severity model unavailable, using conservative default");
            ModelSeverity {
                severity_score: 2,
                risk_level: SeverityRisk::Low,
                red_flags_detected: Vec::new(),
                recommended_action: RecommendedAction::Otc,
                confidence: 0.5,
                reasoning: "Default assessment (model unavailable)".to_string(),
            }
        }
    };

    let triggered = detect_red_flags(symptoms, &assessment.red_flags_detected);
    let emergency_override = !triggered.is_empty();
    if emergency_override {
        assessment.severity_score = assessment.severity_score.max(9);
        assessment.risk_level = SeverityRisk::Critical;
        assessment.recommended_action = RecommendedAction::Emergency;
        for flag in &triggered {
            if !assessment.red_flags_detected.contains(flag) {
                assessment.red_flags_detected.push(flag.clone());
            }
        }
        tracing::warn!(?triggered, "emergency red flag override triggered");
    }

    let route = route_for(assessment.severity_score);

    SeverityAssessment {
        severity_score: assessment.severity_score,
        risk_level: assessment.risk_level,
        red_flags_detected: assessment.red_flags_detected,
        recommended_action: assessment.recommended_action,
        confidence: assessment.confidence,
        reasoning: assessment.reasoning,
        emergency_override,
        route,
    }
}

fn detect_red_flags(symptoms: &str, model_flags: &[String]) -> Vec<String> {
    let haystack = symptoms.to_lowercase();
    EMERGENCY_RED_FLAGS
        .iter()
        .filter(|flag| {
            haystack.contains(*flag)
                || model_flags
                    .iter()
                    .any(|m| m.to_lowercase().contains(*flag))
        })
        .map(|f| f.to_string())
        .collect()
}

/// 1-3 OTC, 4-6 pharmacist, 7-8 doctor, 9-10 emergency.
fn route_for(score: u8) -> RecommendedAction {
    match score {
        0..=3 => RecommendedAction::Otc,
        4..=6 => RecommendedAction::Pharmacist,
        7..=8 => RecommendedAction::Doctor,
        _ => RecommendedAction::Emergency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn red_flag_forces_emergency() {
        let ctx = PatientContext::default();
        let a = assess_severity(&HeuristicSeverityModel, "sudden chest pain", &ctx).await;
        assert!(a.emergency_override);
        assert!(a.severity_score >= 9);
        assert_eq!(a.route, RecommendedAction::Emergency);
        assert_eq!(a.risk_level, SeverityRisk::Critical);
    }

    #[tokio::test]
    async fn mild_symptoms_route_otc() {
        let ctx = PatientContext::default();
        let a = assess_severity(&HeuristicSeverityModel, "mild headache", &ctx).await;
        assert!(!a.emergency_override);
        assert_eq!(a.route, RecommendedAction::Otc);
    }

    #[test]
    fn routing_thresholds() {
        assert_eq!(route_for(3), RecommendedAction::Otc);
        assert_eq!(route_for(4), RecommendedAction::Pharmacist);
        assert_eq!(route_for(7), RecommendedAction::Doctor);
        assert_eq!(route_for(9), RecommendedAction::Emergency);
    }
}
