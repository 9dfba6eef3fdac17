use pretty_assertions::assert_eq;
use scanx_pagemap::aligner::{AlignmentKind, PageAlignment};
use scanx_pagemap::error::FallbackError;
use scanx_pagemap::fallback::NoFallback;
use scanx_pagemap::step_mapper::{Signal, StepDecision, StepMapper};
use scanx_pagemap::{
    Classification, ClassificationCandidate, DocumentId, Line, Page, PageType, PatternClassifier,
    PipelineConfig, Polygon, Source, StepId, Via,
};

mod common;

fn mapper() -> StepMapper {
    StepMapper::new(
        common::patterns(),
        &common::template(),
        &PipelineConfig::default(),
    )
}

fn candidate(page_type: &str, priority: u32) -> ClassificationCandidate {
    ClassificationCandidate {
        page_type: PageType::new(page_type),
        confidence: priority as f64 / 10.0,
        priority,
        source: Source::Regex,
    }
}

fn classified(page_number: u32, candidates: Vec<ClassificationCandidate>) -> Classification {
    Classification {
        page_number,
        candidates,
        continuation_marker: false,
        inherited_from: None,
    }
}

fn unaligned(page_number: u32) -> PageAlignment {
    PageAlignment {
        page_number,
        slot: None,
        similarity: 0.0,
        continuation_of: None,
        kind: AlignmentKind::Unassigned,
    }
}

fn aligned(page_number: u32, slot: u32, similarity: f64) -> PageAlignment {
    PageAlignment {
        page_number,
        slot: Some(slot),
        similarity,
        continuation_of: None,
        kind: AlignmentKind::Matched,
    }
}

fn text_page(page_number: u32) -> Page {
    common::slot_page(&DocumentId::new("doc"), page_number, 13)
}

#[test]
fn threshold_is_inclusive() {
    common::setup();
    let mapper = mapper();
    let template = common::template();
    let page = text_page(3);

    // priority 4 of 10 lands exactly on the threshold
    let at = classified(3, vec![candidate("cash", 4)]);
    let (estimate, decision) = mapper.map_to_step(&page, &unaligned(3), &at, &template);
    assert_eq!(estimate.signal, Signal::Classifier);
    assert_eq!(estimate.confidence, 0.4);
    match decision {
        StepDecision::Commit(label) => {
            assert_eq!(label.step_id, StepId::new("step_6"));
            assert!(!label.low_confidence);
        }
        other => panic!("expected commit, got {:?}", other),
    }

    let mut below = classified(3, vec![candidate("cash", 4)]);
    below.candidates[0].confidence = 0.399;
    let (_, decision) = mapper.map_to_step(&page, &unaligned(3), &below, &template);
    assert!(matches!(decision, StepDecision::Escalate { .. }));
    assert!(!mapper.commits(0.399));
    assert!(mapper.commits(0.4));
}

#[test]
fn agreement_takes_the_stronger_signal() {
    let mapper = mapper();
    let template = common::template();
    let slot = template.slot(13).unwrap();

    let estimate = mapper.estimate(
        &classified(1, vec![candidate("deposits", 6)]),
        Some((&slot.page_type, slot.step.as_ref())),
        0.9,
    );
    assert_eq!(estimate.signal, Signal::Agreement);
    assert_eq!(estimate.step, Some(StepId::new("step_6")));
    assert_eq!(estimate.confidence, 0.9);
}

#[test]
fn conflict_keeps_only_the_margin() {
    let mapper = mapper();
    let template = common::template();
    let slot = template.slot(13).unwrap();

    let estimate = mapper.estimate(
        &classified(1, vec![candidate("personal_info", 8)]),
        Some((&slot.page_type, slot.step.as_ref())),
        0.95,
    );
    assert_eq!(estimate.signal, Signal::Conflict);
    assert_eq!(estimate.page_type, PageType::new("cash"));
    assert_eq!(estimate.step, Some(StepId::new("step_6")));
    assert!((estimate.confidence - 0.15).abs() < 1e-9);
    assert!(!mapper.commits(estimate.confidence));
}

#[test]
fn slot_alone_is_discounted() {
    let mapper = mapper();
    let template = common::template();
    let slot = template.slot(21).unwrap();

    let estimate = mapper.estimate(
        &classified(1, Vec::new()),
        Some((&slot.page_type, slot.step.as_ref())),
        0.9,
    );
    assert_eq!(estimate.signal, Signal::Slot);
    assert_eq!(estimate.step, Some(StepId::new("step_7")));
    assert!((estimate.confidence - 0.45).abs() < 1e-9);
}

/// Page 9 and page 13 headings: cash and land tie at priority 9.
fn tied_page(page_number: u32) -> (Page, Classification) {
    let page = Page::new(
        DocumentId::new("doc"),
        page_number,
        vec![
            Line::new("หน้า 9", Polygon::rect(1.0, 0.5, 7.0, 0.8)),
            Line::new("หน้า 13", Polygon::rect(1.0, 0.9, 7.0, 1.2)),
        ],
    );
    let classifier = PatternClassifier::new(common::patterns(), &PipelineConfig::default());
    let classification = classifier.classify_page(&page);
    (page, classification)
}

#[test]
fn unsettled_tie_escalates() {
    let mapper = mapper();
    let template = common::template();
    let (page, classification) = tied_page(8);
    assert_eq!(classification.top_tier().len(), 2);

    let (estimate, decision) = mapper.map_to_step(&page, &unaligned(8), &classification, &template);
    assert_eq!(estimate.signal, Signal::Tie);
    assert_eq!(estimate.confidence, 0.0);
    let StepDecision::Escalate { request, provisional } = decision else {
        panic!("a tie must not be committed");
    };
    let hinted: Vec<Option<StepId>> = request.candidates.iter().map(|c| c.step.clone()).collect();
    assert!(hinted.contains(&Some(StepId::new("step_6"))));
    assert!(hinted.contains(&Some(StepId::new("step_7"))));
    assert!(provisional.low_confidence);
}

#[test]
fn tie_outside_the_slot_step_still_escalates() {
    let mapper = mapper();
    let template = common::template();
    let (page, classification) = tied_page(23);

    // slot 23 reads buildings (step_8), neither of the tied steps
    let (estimate, decision) =
        mapper.map_to_step(&page, &aligned(23, 23, 0.95), &classification, &template);
    assert_eq!(estimate.signal, Signal::Tie);
    assert!(matches!(decision, StepDecision::Escalate { .. }));
}

#[test]
fn slot_settles_a_tie_it_names() {
    let mapper = mapper();
    let template = common::template();
    let (page, classification) = tied_page(21);

    let (estimate, decision) =
        mapper.map_to_step(&page, &aligned(21, 21, 0.8), &classification, &template);
    assert_eq!(estimate.signal, Signal::Agreement);
    assert_eq!(estimate.page_type, PageType::new("land"));
    assert!((estimate.confidence - 0.9).abs() < 1e-9);
    let StepDecision::Commit(label) = decision else {
        panic!("expected commit");
    };
    assert_eq!(label.step_id, StepId::new("step_7"));
}

#[test]
fn additional_steps_follow_the_page_type() {
    let mapper = mapper();
    let template = common::template();
    let page = text_page(21);
    let classification = classified(21, vec![candidate("land", 10)]);

    let (_, decision) = mapper.map_to_step(&page, &aligned(21, 21, 1.0), &classification, &template);
    let StepDecision::Commit(label) = decision else {
        panic!("expected commit");
    };
    assert_eq!(label.step_id, StepId::new("step_7"));
    assert_eq!(label.additional_steps, vec![StepId::new("step_6")]);
    assert_eq!(label.via, Via::Regex);
}

#[test]
fn ignored_page_is_committed_unmapped() {
    let mapper = mapper();
    let template = common::template();
    let page = Page::ignored(DocumentId::new("doc"), 12);

    let (_, decision) =
        mapper.map_to_step(&page, &unaligned(12), &classified(12, Vec::new()), &template);
    let StepDecision::Commit(label) = decision else {
        panic!("ignored pages never escalate");
    };
    assert!(label.step_id.is_unmapped());
    assert_eq!(label.confidence, 1.0);
}

#[test]
fn blank_page_below_threshold_is_flagged_not_escalated() {
    let mapper = mapper();
    let template = common::template();
    let page = Page::new(DocumentId::new("doc"), 5, Vec::new());

    let (_, decision) =
        mapper.map_to_step(&page, &unaligned(5), &classified(5, Vec::new()), &template);
    let StepDecision::Commit(label) = decision else {
        panic!("blank pages have nothing to escalate");
    };
    assert!(label.step_id.is_unmapped());
    assert!(label.low_confidence);
}

fn escalated(mapper: &StepMapper) -> StepDecision {
    let template = common::template();
    let page = text_page(7);
    let (_, decision) = mapper.map_to_step(
        &page,
        &unaligned(7),
        &classified(7, vec![candidate("cash", 2)]),
        &template,
    );
    decision
}

#[tokio::test]
async fn fallback_verdict_is_merged() {
    let mapper = mapper();
    let decision = escalated(&mapper);
    let StepDecision::Escalate { request, .. } = &decision else {
        panic!("expected escalation");
    };
    assert_eq!(request.page_number, 7);
    assert!(request.allows(&StepId::new("step_10")));
    assert!(request.text.chars().count() <= scanx_pagemap::fallback::MAX_PROMPT_CHARS);

    let stub = common::CountingClassifier::answering("step_6", 0.85);
    let resolution = mapper.resolve(decision, &stub).await;
    assert_eq!(stub.calls(), 1);
    assert!(resolution.escalated);
    assert!(resolution.fallback_error.is_none());
    assert_eq!(resolution.label.step_id, StepId::new("step_6"));
    assert_eq!(resolution.label.via, Via::Ai);
    assert_eq!(resolution.label.confidence, 0.85);
    assert!(!resolution.label.low_confidence);
}

#[tokio::test]
async fn failed_fallback_commits_provisional_label() {
    let mapper = mapper();
    let stub = common::CountingClassifier::failing();
    let resolution = mapper.resolve(escalated(&mapper), &stub).await;

    assert_eq!(stub.calls(), 1);
    assert!(matches!(
        resolution.fallback_error,
        Some(FallbackError::Status(503))
    ));
    assert!(resolution.escalated);
    assert_eq!(resolution.label.step_id, StepId::new("step_6"));
    assert_eq!(resolution.label.via, Via::Regex);
    assert!(resolution.label.low_confidence);
}

#[tokio::test]
async fn regex_only_mode_is_not_an_escalation() {
    let mapper = mapper();
    let resolution = mapper.resolve(escalated(&mapper), &NoFallback).await;

    assert!(!resolution.escalated);
    assert!(resolution.fallback_error.is_none());
    assert_eq!(resolution.label.step_id, StepId::new("step_6"));
    assert!(resolution.label.low_confidence);
}

#[tokio::test]
async fn less_certain_verdict_keeps_the_local_answer() {
    let mapper = mapper();
    for confidence in [0.1, 0.2] {
        let stub = common::CountingClassifier::answering("step_10", confidence);
        let resolution = mapper.resolve(escalated(&mapper), &stub).await;

        assert_eq!(stub.calls(), 1);
        assert!(resolution.escalated);
        assert!(resolution.fallback_error.is_none());
        assert_eq!(resolution.label.step_id, StepId::new("step_6"));
        assert_eq!(resolution.label.via, Via::Regex);
        assert!(resolution.label.low_confidence);
    }
}

#[tokio::test]
async fn verdict_with_unknown_step_is_rejected() {
    let mapper = mapper();
    let stub = common::CountingClassifier::answering("step_99", 0.9);
    let resolution = mapper.resolve(escalated(&mapper), &stub).await;

    assert!(matches!(
        resolution.fallback_error,
        Some(FallbackError::UnknownStep(_))
    ));
    assert!(resolution.label.low_confidence);
}

#[tokio::test]
async fn committed_decision_skips_the_fallback() {
    let mapper = mapper();
    let stub = common::CountingClassifier::answering("step_1", 1.0);
    let decision = StepDecision::Commit(StepMapper::ignored_label(4));
    let resolution = mapper.resolve(decision, &stub).await;

    assert_eq!(stub.calls(), 0);
    assert!(!resolution.escalated);
    assert!(resolution.label.step_id.is_unmapped());
}
