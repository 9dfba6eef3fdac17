//! Per-document orchestration: ignore filter, classification, alignment,
//! then step mapping with the fallback.
//!
//! Each stage waits for the previous one to finish on the whole document:
//! the aligner needs every page scored, and step confidence needs the slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::aligner::{Alignment, AlignmentReport, TemplateAligner};
use crate::classifier::{Classification, PatternClassifier};
use crate::config::PipelineConfig;
use crate::fallback::{NoFallback, StepClassifier};
use crate::ignore::IgnoreConfig;
use crate::logging::PIPELINE;
use crate::page::{Document, DocumentId};
use crate::patterns::{PageType, PatternTable, StepId};
use crate::similarity::PageProfile;
use crate::step_mapper::{StepDecision, StepLabel, StepMapper};
use crate::template::Template;

/// Recoverable per-document anomaly, reported alongside the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    PageCountMismatch { pages: usize, slots: usize },
    BlankDocument,
    DegenerateCostMatrix,
    AmbiguousClassification {
        page_number: u32,
        candidates: Vec<PageType>,
    },
    FallbackFailed { page_number: u32, reason: String },
    IgnoredPageOutOfRange { page_number: u32, total_pages: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledPage {
    pub page_number: u32,
    pub page_type: PageType,
    pub label: StepLabel,
    /// Steps of other matching page types that also read this page.
    pub secondary_steps: Vec<StepId>,
    pub slot: Option<u32>,
    pub slot_similarity: f64,
    pub continuation_of: Option<u32>,
    pub ignored: bool,
}

/// Pages grouped by the steps that will read them. A page goes to its
/// label's steps and to its secondary steps; `unmapped` holds pages no step
/// reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepSummary {
    pub steps: BTreeMap<StepId, Vec<u32>>,
    pub unmapped: Vec<u32>,
    pub low_confidence: Vec<u32>,
    pub escalated: usize,
}

impl StepSummary {
    fn build(pages: &[LabeledPage], escalated: usize) -> Self {
        let mut summary = Self {
            escalated,
            ..Self::default()
        };
        for page in pages {
            let routed: Vec<&StepId> = std::iter::once(&page.label.step_id)
                .filter(|step| !step.is_unmapped())
                .chain(&page.label.additional_steps)
                .chain(&page.secondary_steps)
                .collect();
            if routed.is_empty() {
                summary.unmapped.push(page.page_number);
            }
            for step in routed {
                summary
                    .steps
                    .entry(step.clone())
                    .or_default()
                    .push(page.page_number);
            }
            if page.label.low_confidence {
                summary.low_confidence.push(page.page_number);
            }
        }
        for pages in summary.steps.values_mut() {
            pages.sort_unstable();
            pages.dedup();
        }
        summary
    }

    pub fn pages_for(&self, step: &str) -> &[u32] {
        self.steps
            .get(&StepId::new(step))
            .map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentResult {
    pub document_id: DocumentId,
    pub run_id: Uuid,
    pub template_version: String,
    pub pages: Vec<LabeledPage>,
    pub alignment: AlignmentReport,
    pub summary: StepSummary,
    pub warnings: Vec<Warning>,
}

impl DocumentResult {
    pub fn page(&self, page_number: u32) -> Option<&LabeledPage> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }
}

/// Local work for one document, finished up to the fallback calls.
#[derive(Debug)]
pub struct Analysis {
    pub document: Document,
    pub classifications: Vec<Classification>,
    pub alignment: Alignment,
    decisions: Vec<(PageType, StepDecision)>,
    warnings: Vec<Warning>,
}

/// Shared, immutable pipeline. Clone the `Arc` to use it from many tasks.
pub struct DocumentPipeline {
    template: Arc<Template>,
    classifier: PatternClassifier,
    aligner: TemplateAligner,
    mapper: StepMapper,
    fallback: Arc<dyn StepClassifier>,
    config: PipelineConfig,
}

impl DocumentPipeline {
    pub fn new(
        template: Arc<Template>,
        patterns: Arc<PatternTable>,
        config: PipelineConfig,
        fallback: Arc<dyn StepClassifier>,
    ) -> Self {
        Self {
            classifier: PatternClassifier::new(Arc::clone(&patterns), &config),
            aligner: TemplateAligner::new(&config),
            mapper: StepMapper::new(patterns, &template, &config),
            template,
            fallback,
            config,
        }
    }

    /// Regex-only pipeline.
    pub fn without_fallback(
        template: Arc<Template>,
        patterns: Arc<PatternTable>,
        config: PipelineConfig,
    ) -> Self {
        Self::new(template, patterns, config, Arc::new(NoFallback))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Everything up to escalation. CPU-bound; parallel inside.
    pub fn analyze(&self, mut document: Document, ignore: Option<&IgnoreConfig>) -> Analysis {
        let mut warnings = Vec::new();

        if let Some(ignore) = ignore {
            let outcome = ignore.apply(&mut document);
            let total_pages = ignore.total_pages.unwrap_or(document.page_count() as u32);
            warnings.extend(outcome.out_of_range.into_iter().map(|page_number| {
                Warning::IgnoredPageOutOfRange {
                    page_number,
                    total_pages,
                }
            }));
        }

        let pages = &document.pages;
        let slots = self.template.len();
        if pages.len() != slots {
            warnings.push(Warning::PageCountMismatch {
                pages: pages.len(),
                slots,
            });
        }
        if pages.iter().all(|p| p.ignored || p.is_blank()) {
            warn!(target: PIPELINE, document_id = %document.id, "document has no readable page");
            warnings.push(Warning::BlankDocument);
        }

        let classifications = self.classifier.classify_document(pages);
        for classification in &classifications {
            if classification.is_ambiguous(self.classifier.table()) {
                warnings.push(Warning::AmbiguousClassification {
                    page_number: classification.page_number,
                    candidates: classification
                        .top_tier()
                        .iter()
                        .map(|c| c.page_type.clone())
                        .collect(),
                });
            }
        }

        let profiles: Vec<PageProfile> = pages.par_iter().map(PageProfile::from_page).collect();
        let marks: Vec<bool> = classifications
            .iter()
            .map(|c| c.continuation_marker)
            .collect();
        let alignment = self
            .aligner
            .align_profiles(&profiles, &self.template, &marks);
        if alignment.report.degenerate {
            warnings.push(Warning::DegenerateCostMatrix);
        }

        let decisions = pages
            .iter()
            .zip(&classifications)
            .zip(&alignment.pages)
            .map(|((page, classification), aligned)| {
                let (estimate, decision) =
                    self.mapper
                        .map_to_step(page, aligned, classification, &self.template);
                (estimate.page_type, decision)
            })
            .collect();

        Analysis {
            document,
            classifications,
            alignment,
            decisions,
            warnings,
        }
    }

    /// Escalate what needs it and assemble the result.
    pub async fn finish(&self, analysis: Analysis, run_id: Uuid) -> DocumentResult {
        let Analysis {
            document,
            classifications,
            alignment,
            decisions,
            mut warnings,
        } = analysis;

        let mut pages = Vec::with_capacity(document.pages.len());
        let mut escalated = 0;
        for (((page, aligned), classification), (page_type, decision)) in document
            .pages
            .iter()
            .zip(&alignment.pages)
            .zip(&classifications)
            .zip(decisions)
        {
            let resolution = self.mapper.resolve(decision, self.fallback.as_ref()).await;
            if resolution.escalated {
                escalated += 1;
            }
            if let Some(err) = resolution.fallback_error {
                warnings.push(Warning::FallbackFailed {
                    page_number: page.page_number,
                    reason: err.to_string(),
                });
            }
            let secondary_steps = self
                .mapper
                .secondary_steps(classification, &resolution.label);
            pages.push(LabeledPage {
                page_number: page.page_number,
                page_type,
                secondary_steps,
                label: resolution.label,
                slot: aligned.slot,
                slot_similarity: aligned.similarity,
                continuation_of: aligned.continuation_of,
                ignored: page.ignored,
            });
        }

        let summary = StepSummary::build(&pages, escalated);
        info!(
            target: PIPELINE,
            document_id = %document.id,
            pages = pages.len(),
            escalated,
            low_confidence = summary.low_confidence.len(),
            warnings = warnings.len(),
            "document labeled"
        );

        DocumentResult {
            document_id: document.id,
            run_id,
            template_version: self.template.version.clone(),
            pages,
            alignment: alignment.report,
            summary,
            warnings,
        }
    }

    pub async fn process(&self, document: Document) -> DocumentResult {
        self.process_with_ignore(document, None).await
    }

    #[instrument(
        name = "document",
        skip_all,
        fields(document_id = %document.id, run_id = tracing::field::Empty)
    )]
    pub async fn process_with_ignore(
        &self,
        document: Document,
        ignore: Option<&IgnoreConfig>,
    ) -> DocumentResult {
        let run_id = Uuid::new_v4();
        Span::current().record("run_id", tracing::field::display(run_id));
        let analysis = self.analyze(document, ignore);
        self.finish(analysis, run_id).await
    }

    /// Process documents concurrently, at most `max_concurrent_documents`
    /// at a time. Results come back in input order.
    pub async fn process_batch(
        self: &Arc<Self>,
        documents: Vec<(Document, Option<IgnoreConfig>)>,
    ) -> Vec<DocumentResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_documents));
        let mut tasks = JoinSet::new();
        let total = documents.len();

        for (index, (document, ignore)) in documents.into_iter().enumerate() {
            let pipeline = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let run_id = Uuid::new_v4();
                let document_id = document.id.clone();

                let worker = Arc::clone(&pipeline);
                let analysis = tokio::task::spawn_blocking(move || {
                    worker.analyze(document, ignore.as_ref())
                })
                .await;
                match analysis {
                    Ok(analysis) => Some((index, pipeline.finish(analysis, run_id).await)),
                    Err(err) => {
                        error!(target: PIPELINE, document_id = %document_id, error = %err, "analysis task failed");
                        None
                    }
                }
            });
        }

        let mut results: Vec<(usize, DocumentResult)> = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(err) => error!(target: PIPELINE, error = %err, "document task failed"),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        info!(target: PIPELINE, documents = total, completed = results.len(), "batch complete");
        results.into_iter().map(|(_, r)| r).collect()
    }
}
