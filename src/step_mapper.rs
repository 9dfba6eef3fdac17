//! Turns classification and alignment into one committed step per page.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aligner::PageAlignment;
use crate::classifier::Classification;
use crate::config::PipelineConfig;
use crate::error::FallbackError;
use crate::fallback::{AiVerdict, CandidateHint, EscalationRequest, StepClassifier};
use crate::logging::STEP;
use crate::page::Page;
use crate::patterns::{PageType, PatternTable, StepId};
use crate::template::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    Regex,
    Ai,
}

/// The per-page artifact handed to extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLabel {
    pub page_number: u32,
    /// Primary step, or `unmapped`.
    pub step_id: StepId,
    pub additional_steps: Vec<StepId>,
    pub confidence: f64,
    pub via: Via,
    /// Committed below the threshold because the fallback could not help.
    pub low_confidence: bool,
}

/// Which local signal decided the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    None,
    Classifier,
    Slot,
    Agreement,
    Conflict,
    /// Top-priority candidates disagree on the step and no slot settles it.
    Tie,
}

/// Best local answer before gating.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalEstimate {
    pub page_type: PageType,
    pub step: Option<StepId>,
    pub confidence: f64,
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    Commit(StepLabel),
    /// Ask the fallback; commit `provisional` (flagged) if it cannot answer.
    Escalate {
        request: EscalationRequest,
        provisional: StepLabel,
    },
}

/// A committed label plus the fallback failure that forced it, if any.
/// `escalated` is false when no fallback classifier is configured.
#[derive(Debug)]
pub struct Resolution {
    pub label: StepLabel,
    pub escalated: bool,
    pub fallback_error: Option<FallbackError>,
}

#[derive(Debug, Clone)]
pub struct StepMapper {
    table: Arc<PatternTable>,
    threshold: f64,
    slot_only_weight: f64,
    secondary_confidence: f64,
    known_steps: BTreeSet<StepId>,
}

impl StepMapper {
    pub fn new(table: Arc<PatternTable>, template: &Template, config: &PipelineConfig) -> Self {
        let mut known_steps = table.known_steps();
        known_steps.extend(template.slots().iter().filter_map(|s| s.step.clone()));
        Self {
            table,
            threshold: config.escalation_threshold,
            slot_only_weight: config.slot_only_weight,
            secondary_confidence: config.secondary_step_confidence,
            known_steps,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Commit side is inclusive.
    pub fn commits(&self, confidence: f64) -> bool {
        confidence >= self.threshold
    }

    fn step_of(&self, page_type: &PageType) -> Option<StepId> {
        self.table.get(page_type).and_then(|set| set.step.clone())
    }

    /// Combine the classifier's answer with the slot's static step.
    ///
    /// `slot` is the assigned slot's page type and step, `slot_similarity`
    /// how well the page matched it. Equal-priority candidates on different
    /// steps are only settled by a slot naming one of their steps; otherwise
    /// the estimate carries no confidence and the page escalates.
    pub fn estimate(
        &self,
        classification: &Classification,
        slot: Option<(&PageType, Option<&StepId>)>,
        slot_similarity: f64,
    ) -> LocalEstimate {
        let slot_step = slot.and_then(|(_, step)| step);
        let mut chosen = classification.best();
        if classification.is_ambiguous(&self.table) {
            let settled = classification
                .top_tier()
                .iter()
                .find(|c| {
                    slot_step.is_some() && self.step_of(&c.page_type).as_ref() == slot_step
                });
            match (settled, chosen) {
                (Some(candidate), _) => chosen = Some(candidate),
                (None, Some(best)) => {
                    return LocalEstimate {
                        page_type: best.page_type.clone(),
                        step: self.step_of(&best.page_type),
                        confidence: 0.0,
                        signal: Signal::Tie,
                    }
                }
                (None, None) => {}
            }
        }
        let classified =
            chosen.map(|c| (c.page_type.clone(), self.step_of(&c.page_type), c.confidence));

        match (classified, slot) {
            (None, None) => LocalEstimate {
                page_type: PageType::unknown(),
                step: None,
                confidence: 0.0,
                signal: Signal::None,
            },
            (Some((page_type, step, confidence)), None) => LocalEstimate {
                page_type,
                step,
                confidence,
                signal: Signal::Classifier,
            },
            (None, Some((page_type, step))) => LocalEstimate {
                page_type: page_type.clone(),
                step: step.cloned(),
                confidence: slot_similarity * self.slot_only_weight,
                signal: Signal::Slot,
            },
            (Some((page_type, step, class_conf)), Some((slot_type, slot_step))) => {
                if step.as_ref() == slot_step {
                    LocalEstimate {
                        page_type,
                        step,
                        confidence: class_conf.max(slot_similarity),
                        signal: Signal::Agreement,
                    }
                } else if class_conf >= slot_similarity {
                    LocalEstimate {
                        page_type,
                        step,
                        confidence: class_conf - slot_similarity,
                        signal: Signal::Conflict,
                    }
                } else {
                    LocalEstimate {
                        page_type: slot_type.clone(),
                        step: slot_step.cloned(),
                        confidence: slot_similarity - class_conf,
                        signal: Signal::Conflict,
                    }
                }
            }
        }
    }

    fn additional_steps(&self, page_type: &PageType, step: &StepId) -> Vec<StepId> {
        self.table
            .get(page_type)
            .filter(|set| set.step.as_ref() == Some(step))
            .map(|set| set.additional_steps.clone())
            .unwrap_or_default()
    }

    /// Steps, additional ones included, of every surviving candidate type
    /// confident enough to also read the page. `label`'s own steps are left
    /// out.
    pub fn secondary_steps(
        &self,
        classification: &Classification,
        label: &StepLabel,
    ) -> Vec<StepId> {
        let mut steps: Vec<StepId> = Vec::new();
        for set in classification
            .candidates
            .iter()
            .filter(|c| c.confidence >= self.secondary_confidence)
            .filter_map(|c| self.table.get(&c.page_type))
        {
            for step in set.steps() {
                if *step != label.step_id
                    && !label.additional_steps.contains(step)
                    && !steps.contains(step)
                {
                    steps.push(step.clone());
                }
            }
        }
        steps
    }

    fn label(&self, page_number: u32, estimate: &LocalEstimate) -> StepLabel {
        let step_id = estimate.step.clone().unwrap_or_else(StepId::unmapped);
        StepLabel {
            page_number,
            additional_steps: self.additional_steps(&estimate.page_type, &step_id),
            step_id,
            confidence: estimate.confidence.clamp(0.0, 1.0),
            via: Via::Regex,
            low_confidence: false,
        }
    }

    /// Ignored pages are settled without looking at them.
    pub fn ignored_label(page_number: u32) -> StepLabel {
        StepLabel {
            page_number,
            step_id: StepId::unmapped(),
            additional_steps: Vec::new(),
            confidence: 1.0,
            via: Via::Regex,
            low_confidence: false,
        }
    }

    pub fn map_to_step(
        &self,
        page: &Page,
        alignment: &PageAlignment,
        classification: &Classification,
        template: &Template,
    ) -> (LocalEstimate, StepDecision) {
        if page.ignored {
            let estimate = LocalEstimate {
                page_type: PageType::unknown(),
                step: None,
                confidence: 1.0,
                signal: Signal::None,
            };
            return (estimate, StepDecision::Commit(Self::ignored_label(page.page_number)));
        }

        let slot = alignment.slot.and_then(|n| template.slot(n));
        let estimate = self.estimate(
            classification,
            slot.map(|s| (&s.page_type, s.step.as_ref())),
            alignment.similarity,
        );
        let label = self.label(page.page_number, &estimate);

        debug!(
            target: STEP,
            page = page.page_number,
            step = %label.step_id,
            confidence = label.confidence,
            signal = ?estimate.signal,
            "local step estimate"
        );

        if self.commits(estimate.confidence) {
            return (estimate, StepDecision::Commit(label));
        }
        // nothing to show the fallback
        if page.is_blank() {
            let label = StepLabel {
                low_confidence: true,
                ..label
            };
            return (estimate, StepDecision::Commit(label));
        }

        let request = EscalationRequest {
            document_id: page.document_id.to_string(),
            page_number: page.page_number,
            text: EscalationRequest::truncate_text(&page.normalized_text()),
            candidates: classification
                .candidates
                .iter()
                .map(|c| CandidateHint {
                    page_type: c.page_type.clone(),
                    step: self.table.get(&c.page_type).and_then(|s| s.step.clone()),
                    confidence: c.confidence,
                })
                .collect(),
            slot: alignment.slot,
            slot_step: slot.and_then(|s| s.step.clone()),
            allowed_steps: self.known_steps.iter().cloned().collect(),
        };
        let provisional = StepLabel {
            low_confidence: true,
            ..label
        };
        (estimate, StepDecision::Escalate { request, provisional })
    }

    /// Accept a verdict naming a known step; anything else is an error. A
    /// verdict no more confident than `provisional` leaves it in place.
    pub fn merge_verdict(
        &self,
        verdict: AiVerdict,
        request: &EscalationRequest,
        provisional: &StepLabel,
    ) -> Result<StepLabel, FallbackError> {
        if !(verdict.step.is_unmapped() || self.known_steps.contains(&verdict.step)) {
            return Err(FallbackError::UnknownStep(verdict.step.to_string()));
        }
        if !verdict.confidence.is_finite() {
            return Err(FallbackError::Malformed("non-numeric confidence".to_string()));
        }
        let confidence = verdict.confidence.clamp(0.0, 1.0);
        // the local answer stands unless the verdict is surer than it
        if confidence <= provisional.confidence {
            return Ok(provisional.clone());
        }

        let additional_steps = request
            .candidates
            .iter()
            .find(|c| c.step.as_ref() == Some(&verdict.step))
            .map(|c| self.additional_steps(&c.page_type, &verdict.step))
            .unwrap_or_default();

        Ok(StepLabel {
            page_number: provisional.page_number,
            step_id: verdict.step,
            additional_steps,
            confidence,
            via: Via::Ai,
            low_confidence: false,
        })
    }

    /// Run the fallback for an escalated page. Never fails: without a usable
    /// verdict the provisional label is committed.
    pub async fn resolve(&self, decision: StepDecision, fallback: &dyn StepClassifier) -> Resolution {
        let (request, provisional) = match decision {
            StepDecision::Commit(label) => {
                return Resolution {
                    label,
                    escalated: false,
                    fallback_error: None,
                }
            }
            StepDecision::Escalate {
                request,
                provisional,
            } => (request, provisional),
        };

        let outcome = match fallback.classify(&request).await {
            Ok(verdict) => self.merge_verdict(verdict, &request, &provisional),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(label) => {
                debug!(
                    target: STEP,
                    page = label.page_number,
                    step = %label.step_id,
                    confidence = label.confidence,
                    via = ?label.via,
                    classifier = fallback.name(),
                    "fallback verdict merged"
                );
                Resolution {
                    label,
                    escalated: true,
                    fallback_error: None,
                }
            }
            // regex-only run: nothing was asked, so nothing failed
            Err(FallbackError::Unavailable) => {
                debug!(
                    target: STEP,
                    page = provisional.page_number,
                    "no fallback configured, committing local estimate"
                );
                Resolution {
                    label: provisional,
                    escalated: false,
                    fallback_error: None,
                }
            }
            Err(err) => {
                warn!(
                    target: STEP,
                    page = provisional.page_number,
                    error = %err,
                    "fallback unavailable, committing local estimate"
                );
                Resolution {
                    label: provisional,
                    escalated: true,
                    fallback_error: Some(err),
                }
            }
        }
    }
}
