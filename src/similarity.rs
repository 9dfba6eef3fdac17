use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::trace;

use crate::config::PipelineConfig;
use crate::layout::PageLayout;
use crate::logging::SCORE;
use crate::normalize::{compact, token_set};
use crate::page::Page;
use crate::template::TemplateSlot;

/// Precomputed comparison keys for one document page.
#[derive(Debug, Clone)]
pub struct PageProfile {
    pub page_number: u32,
    /// Ignored, or OCR produced no readable line.
    pub blank: bool,
    pub tokens: BTreeSet<String>,
    pub line_keys: Vec<String>,
    pub layout: PageLayout,
}

impl PageProfile {
    pub fn from_page(page: &Page) -> Self {
        if page.ignored || page.is_blank() {
            return Self {
                page_number: page.page_number,
                blank: true,
                tokens: BTreeSet::new(),
                line_keys: Vec::new(),
                layout: PageLayout::from_lines(&[], page.width, page.height),
            };
        }
        Self {
            page_number: page.page_number,
            blank: false,
            tokens: token_set(&page.text()),
            line_keys: page
                .lines
                .iter()
                .map(|l| compact(&l.text))
                .filter(|k| !k.is_empty())
                .collect(),
            layout: PageLayout::from_page(page),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityBreakdown {
    pub layout: f64,
    pub text: f64,
    /// Layout weight actually applied after the sparse-page adjustment.
    pub layout_weight: f64,
    pub cost: f64,
}

impl SimilarityBreakdown {
    pub fn similarity(&self) -> f64 {
        1.0 - self.cost
    }
}

/// Page-vs-slot cost: `1 - (w_layout * layout + w_text * text)`.
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    layout_weight: f64,
    dense_line_count: usize,
    layout_max_distance: f64,
    line_match_threshold: f64,
}

impl SimilarityScorer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            layout_weight: config.layout_weight,
            dense_line_count: config.dense_line_count,
            layout_max_distance: config.layout_max_distance,
            line_match_threshold: config.line_match_threshold,
        }
    }

    /// Cost in [0, 1], lower is more similar.
    pub fn score(&self, page: &Page, slot: &TemplateSlot) -> f64 {
        self.score_profile(&PageProfile::from_page(page), slot).cost
    }

    pub fn score_profile(&self, profile: &PageProfile, slot: &TemplateSlot) -> SimilarityBreakdown {
        if profile.blank {
            return SimilarityBreakdown {
                layout: 0.0,
                text: 0.0,
                layout_weight: 0.0,
                cost: 1.0,
            };
        }

        let layout = profile.layout.similarity(&slot.layout, self.layout_max_distance);
        let text = self.text_similarity(profile, slot);

        // Sparse pages carry little layout evidence; hand its weight to text.
        let density = (profile.layout.len() as f64 / self.dense_line_count as f64).min(1.0);
        let layout_weight = self.layout_weight * density;
        let text_weight = 1.0 - layout_weight;

        let cost = (1.0 - (layout_weight * layout + text_weight * text)).clamp(0.0, 1.0);
        trace!(
            target: SCORE,
            page = profile.page_number,
            slot = slot.number,
            layout,
            text,
            cost,
            "slot scored"
        );
        SimilarityBreakdown {
            layout,
            text,
            layout_weight,
            cost,
        }
    }

    /// Cost against the blank pseudo-slot that absorbs blank pages.
    pub fn score_blank(&self, profile: &PageProfile) -> f64 {
        if profile.blank {
            0.0
        } else {
            1.0
        }
    }

    /// Mean of token Jaccard and fuzzy line overlap.
    pub fn text_similarity(&self, profile: &PageProfile, slot: &TemplateSlot) -> f64 {
        0.5 * jaccard(&profile.tokens, &slot.tokens)
            + 0.5 * line_overlap(&profile.line_keys, &slot.line_keys, self.line_match_threshold)
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Slot lines found on the page (exactly or within `threshold`), divided by
/// the larger line count.
fn line_overlap(page: &[String], slot: &[String], threshold: f64) -> f64 {
    let denominator = page.len().max(slot.len());
    if denominator == 0 {
        return 0.0;
    }
    let exact: HashSet<&str> = page.iter().map(String::as_str).collect();
    let page_lens: Vec<usize> = page.iter().map(|k| k.chars().count()).collect();

    let matched = slot
        .iter()
        .filter(|key| {
            if exact.contains(key.as_str()) {
                return true;
            }
            let len = key.chars().count();
            page.iter().zip(&page_lens).any(|(candidate, &candidate_len)| {
                // edit distance is at least the length difference
                let longest = len.max(candidate_len).max(1) as f64;
                let bound = 1.0 - len.abs_diff(candidate_len) as f64 / longest;
                bound >= threshold && normalized_levenshtein(key, candidate) >= threshold
            })
        })
        .count();
    matched as f64 / denominator as f64
}
