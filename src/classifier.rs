use std::collections::BTreeSet;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::logging::CLASSIFY;
use crate::page::Page;
use crate::patterns::{PageType, PatternTable, RuleOutcome, StepId};

/// Lines at the top of a page searched for "continued" markers.
pub const HEADER_LINES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Regex,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCandidate {
    pub page_type: PageType,
    pub confidence: f64,
    /// Priority of the rule that produced this candidate; 0 when inherited.
    pub priority: u32,
    pub source: Source,
}

/// Everything the classifier learned about one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub page_number: u32,
    /// Sorted by priority descending, then table order.
    pub candidates: Vec<ClassificationCandidate>,
    pub continuation_marker: bool,
    /// Page whose type this page inherited through a continuation marker.
    pub inherited_from: Option<u32>,
}

impl Classification {
    fn empty(page_number: u32) -> Self {
        Self {
            page_number,
            candidates: Vec::new(),
            continuation_marker: false,
            inherited_from: None,
        }
    }

    pub fn best(&self) -> Option<&ClassificationCandidate> {
        self.candidates.first()
    }

    pub fn resolved_type(&self) -> PageType {
        self.best()
            .map(|c| c.page_type.clone())
            .unwrap_or_else(PageType::unknown)
    }

    /// Candidates sharing the top priority.
    pub fn top_tier(&self) -> &[ClassificationCandidate] {
        match self.candidates.first() {
            Some(first) => {
                let n = self
                    .candidates
                    .iter()
                    .take_while(|c| c.priority == first.priority)
                    .count();
                &self.candidates[..n]
            }
            None => &[],
        }
    }

    /// Number of distinct steps the top-priority candidates point at. Zero
    /// for an unclassified page, one when the classification is clear.
    pub fn ambiguity(&self, table: &PatternTable) -> usize {
        self.top_tier()
            .iter()
            .map(|c| table.get(&c.page_type).and_then(|set| set.step.clone()))
            .collect::<BTreeSet<Option<StepId>>>()
            .len()
    }

    pub fn is_ambiguous(&self, table: &PatternTable) -> bool {
        self.ambiguity(table) > 1
    }
}

/// Data-driven page-type classifier over a shared [`PatternTable`].
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    table: Arc<PatternTable>,
    continuation_confidence: f64,
}

impl PatternClassifier {
    pub fn new(table: Arc<PatternTable>, config: &PipelineConfig) -> Self {
        Self {
            table,
            continuation_confidence: config.continuation_confidence,
        }
    }

    pub fn table(&self) -> &PatternTable {
        &self.table
    }

    /// Candidate page types for one page, best first. Empty means "unknown".
    pub fn classify(&self, page: &Page) -> Vec<ClassificationCandidate> {
        if page.ignored {
            return Vec::new();
        }
        let text = page.normalized_text();
        if text.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, ClassificationCandidate)> = self
            .table
            .iter()
            .filter_map(|set| match set.evaluate(&text) {
                RuleOutcome::Matched { priority } => Some((
                    set.order,
                    ClassificationCandidate {
                        page_type: set.page_type.clone(),
                        confidence: self.table.confidence(priority),
                        priority,
                        source: Source::Regex,
                    },
                )),
                RuleOutcome::Vetoed => {
                    debug!(target: CLASSIFY, page = page.page_number, page_type = %set.page_type, "vetoed");
                    None
                }
                RuleOutcome::MissingRequired | RuleOutcome::NoMatch => None,
            })
            .collect();

        scored.sort_by(|(order_a, a), (order_b, b)| {
            b.priority.cmp(&a.priority).then(order_a.cmp(order_b))
        });
        scored.into_iter().map(|(_, c)| c).collect()
    }

    pub fn classify_page(&self, page: &Page) -> Classification {
        if page.ignored {
            return Classification::empty(page.page_number);
        }
        Classification {
            page_number: page.page_number,
            candidates: self.classify(page),
            continuation_marker: self
                .table
                .is_continuation(&page.normalized_header(HEADER_LINES)),
            inherited_from: None,
        }
    }

    /// Classify every page in parallel, then let marked continuation pages
    /// inherit the type of the page before them.
    pub fn classify_document(&self, pages: &[Page]) -> Vec<Classification> {
        let mut classifications: Vec<Classification> =
            pages.par_iter().map(|p| self.classify_page(p)).collect();
        self.inherit_continuations(pages, &mut classifications);
        classifications
    }

    fn inherit_continuations(&self, pages: &[Page], classifications: &mut [Classification]) {
        let mut previous: Option<(u32, PageType)> = None;

        for (page, classification) in pages.iter().zip(classifications.iter_mut()) {
            if page.ignored {
                continue;
            }

            let own_confidence = classification.best().map_or(0.0, |c| c.confidence);
            if classification.continuation_marker && own_confidence < self.continuation_confidence
            {
                if let Some((from, page_type)) = previous.as_ref() {
                    let continues = self
                        .table
                        .get(page_type)
                        .is_some_and(|set| set.can_continue);
                    if continues {
                        debug!(
                            target: CLASSIFY,
                            page = page.page_number,
                            from = *from,
                            page_type = %page_type,
                            "continuation inherits type"
                        );
                        classification.candidates = vec![ClassificationCandidate {
                            page_type: page_type.clone(),
                            confidence: self.continuation_confidence,
                            priority: 0,
                            source: Source::Regex,
                        }];
                        classification.inherited_from = Some(*from);
                    }
                }
            }

            if let Some(best) = classification.best() {
                previous = Some((page.page_number, best.page_type.clone()));
            }
        }
    }
}
