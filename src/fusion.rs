//! Fusion calculator
//!
//! Stateful per-session reducer over trace events. Produces two scalar
//! confidences (safety, fulfillment) as weighted averages over the signals
//! collected so far, an alert level, and a coarse pipeline phase. A new
//! `FusionState` is emitted to trace subscribers only when a scalar changed.

use crate::trace::{TraceEvent, TraceStatus, agents};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Intake,
    Validation,
    Inventory,
    Fulfillment,
    Halted,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DominantMode {
    Safety,
    Fulfillment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Nominal,
    Warn,
    Critical,
}

/// Derived scalar view of pipeline health; streamed alongside traces, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FusionState {
    pub session_id: String,
    pub safety_confidence: f64,
    pub fulfillment_confidence: f64,
    pub dominant_mode: DominantMode,
    pub pipeline_phase: PipelinePhase,
    pub contributing_scores: FxHashMap<&'static str, Option<f64>>,
    pub alert_level: AlertLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    pub last_event_agent: String,
    pub last_event_type: String,
}

fn weighted_average(components: &[(Option<f64>, f64)]) -> f64 {
    let mut total_weight = 0.0;
    let mut sum = 0.0;
    for (score, weight) in components {
        if let Some(s) = score {
            total_weight += weight;
            sum += s * weight;
        }
    }
    if total_weight == 0.0 { 0.0 } else { sum / total_weight }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
struct Scores {
    intent_classification: Option<f64>,
    ocr_confidence: Option<f64>,
    /// 1 - severity/10
    severity_inverted: Option<f64>,
    /// 1.0 until proven otherwise
    contraindication_clear: Option<f64>,
    inventory_match_score: Option<f64>,
    identity_resolution: Option<f64>,
    intent_extraction: Option<f64>,
    pipeline_completion: Option<f64>,
}

impl Default for Scores {
    fn default() -> Self {
        Self {
            intent_classification: None,
            ocr_confidence: None,
            severity_inverted: None,
            contraindication_clear: Some(1.0),
            inventory_match_score: None,
            identity_resolution: None,
            intent_extraction: None,
            pipeline_completion: Some(0.0),
        }
    }
}

pub struct FusionCalculator {
    session_id: String,
    scores: Scores,
    total_agents_expected: usize,
    agents_completed: HashSet<String>,
    pipeline_phase: PipelinePhase,
    halt_reason: Option<String>,
    last_event_agent: String,
    last_event_type: String,
}

/// Position of a phase along the pipeline; halted is terminal.
fn phase_rank(phase: PipelinePhase) -> u8 {
    match phase {
        PipelinePhase::Intake => 0,
        PipelinePhase::Validation => 1,
        PipelinePhase::Inventory => 2,
        PipelinePhase::Fulfillment => 3,
        PipelinePhase::Complete => 4,
        PipelinePhase::Halted => 5,
    }
}

impl FusionCalculator {
    pub fn new(session_id: impl Into<String>, total_agents_expected: usize) -> Self {
        Self {
            session_id: session_id.into(),
            scores: Scores::default(),
            total_agents_expected: total_agents_expected.max(1),
            agents_completed: HashSet::new(),
            pipeline_phase: PipelinePhase::Intake,
            halt_reason: None,
            last_event_agent: "SYSTEM".to_string(),
            last_event_type: "init".to_string(),
        }
    }

    /// Move the phase forward, never backward. Halting wins from any live
    /// phase; a halted session stays halted.
    fn advance_phase(&mut self, to: PipelinePhase) -> bool {
        if self.pipeline_phase == PipelinePhase::Halted {
            return false;
        }
        if phase_rank(to) > phase_rank(self.pipeline_phase) {
            self.pipeline_phase = to;
            return true;
        }
        false
    }

    /// Fold one trace event into the fusion scores. Returns true when any
    /// scoreable signal or the phase changed.
    pub fn process_event(&mut self, event: &TraceEvent) -> bool {
        let mut changed = false;
        let agent = event.agent.as_str();
        let details = &event.details;

        self.last_event_agent = event.agent.clone();
        self.last_event_type = event.kind.as_str().to_string();

        // Completion tracking
        if event.status == TraceStatus::Completed && !self.agents_completed.contains(agent) {
            self.agents_completed.insert(agent.to_string());
            let completion =
                (self.agents_completed.len() as f64 / self.total_agents_expected as f64).min(1.0);
            if self.scores.pipeline_completion != Some(completion) {
                self.scores.pipeline_completion = Some(completion);
                changed = true;
            }
        }

        // Phase tracking. Forward-only ratchet: a front-desk or identity
        // event arriving after the pipeline moved on (e.g. the confirmation
        // prompt) must not snap the phase backward. The only exception is
        // halting, which is reachable from anywhere.
        let mapped = match agent {
            agents::IDENTITY | agents::FRONT_DESK => Some(PipelinePhase::Intake),
            agents::VISION | agents::VALIDATOR => Some(PipelinePhase::Validation),
            agents::INVENTORY => Some(PipelinePhase::Inventory),
            agents::FULFILLMENT => Some(PipelinePhase::Fulfillment),
            _ => None,
        };
        if let Some(phase) = mapped {
            changed |= self.advance_phase(phase);
        }
        if event.status == TraceStatus::Failed && self.advance_phase(PipelinePhase::Halted) {
            self.halt_reason = details
                .get("reason")
                .or_else(|| details.get("error"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| Some(format!("{agent} failed")));
            changed = true;
        }
        if event.status == TraceStatus::Completed && agent == agents::FULFILLMENT {
            changed |= self.advance_phase(PipelinePhase::Complete);
        }

        // Signal extraction
        let num = |key: &str| details.get(key).and_then(|v| v.as_f64());

        if agent == agents::IDENTITY {
            if let Some(c) = num("confidence") {
                self.scores.identity_resolution = Some(c);
                changed = true;
            }
        }
        if agent == agents::FRONT_DESK {
            if let Some(c) = num("confidence") {
                self.scores.intent_classification = Some(c);
                self.scores.intent_extraction = Some(c);
                changed = true;
            }
        }
        if agent == agents::VISION {
            if let Some(c) = num("confidence_score") {
                self.scores.ocr_confidence = Some(c);
                changed = true;
            }
        }
        if agent == agents::VALIDATOR {
            if let Some(c) = num("reconstruction_confidence") {
                self.scores.ocr_confidence = Some(c);
                changed = true;
            }
            if let Some(safe) = details.get("safe_to_dispense").and_then(|v| v.as_bool()) {
                self.scores.contraindication_clear = Some(if safe { 1.0 } else { 0.0 });
                changed = true;
            }
            if details
                .get("safety_issues")
                .and_then(|v| v.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false)
            {
                self.scores.contraindication_clear = Some(0.0);
                changed = true;
            }
        }
        if let Some(score) = num("severity_score") {
            self.scores.severity_inverted = Some((1.0 - score / 10.0).max(0.0));
            changed = true;
        }
        if agent == agents::INVENTORY {
            if let Some(m) = num("match_score") {
                self.scores.inventory_match_score = Some(m);
                changed = true;
            } else if let Some(status) = details.get("stock_status").and_then(|v| v.as_str()) {
                let m = match status {
                    "in_stock" => Some(1.0),
                    "substitute" => Some(0.6),
                    "out_of_stock" => Some(0.0),
                    _ => None,
                };
                if let Some(m) = m {
                    self.scores.inventory_match_score = Some(m);
                    changed = true;
                }
            }
        }

        changed
    }

    pub fn fusion_state(&self) -> FusionState {
        let s = &self.scores;

        let safety_confidence = weighted_average(&[
            (s.intent_classification, 0.20),
            (s.ocr_confidence, 0.15),
            (s.severity_inverted, 0.40),
            (s.contraindication_clear, 0.25),
        ]);
        let fulfillment_confidence = weighted_average(&[
            (s.inventory_match_score, 0.45),
            (s.identity_resolution, 0.20),
            (s.intent_extraction, 0.20),
            (s.pipeline_completion, 0.15),
        ]);

        let safe = s.contraindication_clear == Some(1.0);
        let severity_score = s.severity_inverted.map(|inv| (1.0 - inv) * 10.0).unwrap_or(0.0);

        let alert_level = if safety_confidence < 0.30 || !safe {
            AlertLevel::Critical
        } else if safety_confidence < 0.60 || severity_score > 7.0 {
            AlertLevel::Warn
        } else {
            AlertLevel::Nominal
        };

        let dominant_mode = match self.pipeline_phase {
            PipelinePhase::Intake | PipelinePhase::Validation => DominantMode::Safety,
            _ => DominantMode::Fulfillment,
        };

        let mut contributing_scores = FxHashMap::default();
        contributing_scores.insert("intent_classification", s.intent_classification.map(round2));
        contributing_scores.insert("ocr_confidence", s.ocr_confidence.map(round2));
        contributing_scores.insert("severity_inverted", s.severity_inverted.map(round2));
        contributing_scores.insert(
            "contraindication_clear",
            s.contraindication_clear.map(round2),
        );
        contributing_scores.insert("inventory_match_score", s.inventory_match_score.map(round2));
        contributing_scores.insert("identity_resolution", s.identity_resolution.map(round2));
        contributing_scores.insert("intent_extraction", s.intent_extraction.map(round2));
        contributing_scores.insert("pipeline_completion", s.pipeline_completion.map(round2));

        FusionState {
            session_id: self.session_id.clone(),
            safety_confidence: round2(safety_confidence),
            fulfillment_confidence: round2(fulfillment_confidence),
            dominant_mode,
            pipeline_phase: self.pipeline_phase,
            contributing_scores,
            alert_level,
            halt_reason: self.halt_reason.clone(),
            last_event_agent: self.last_event_agent.clone(),
            last_event_type: self.last_event_type.clone(),
        }
    }
}
