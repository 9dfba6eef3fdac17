//! Page-to-slot alignment as a min-cost bipartite matching.

use ordered_float::OrderedFloat;
use pathfinding::kuhn_munkres::{kuhn_munkres_min, Weights};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::logging::ALIGN;
use crate::page::Page;
use crate::similarity::{PageProfile, SimilarityScorer};
use crate::template::Template;

/// Fixed-point scale applied to costs before solving.
const COST_SCALE: f64 = 1e6;

/// Cost spread below which every slot looks the same to the solver.
const DEGENERATE_SPREAD: f64 = 1e-9;

/// Dense row-major matrix of costs, lower is better.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl CostMatrix {
    pub fn new(rows: usize, cols: usize, fill: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![fill; rows * cols],
        }
    }

    /// Rows must all have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let n = rows.len();
        let data: Vec<f64> = rows.into_iter().flatten().collect();
        debug_assert_eq!(data.len(), n * cols);
        Self {
            rows: n,
            cols,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Square integer matrix handed to the solver: quantized cost first, then
/// row/column displacement, so equal costs resolve toward document order.
struct LexicographicWeights {
    size: usize,
    data: Vec<i64>,
}

impl Weights<i64> for LexicographicWeights {
    fn rows(&self) -> usize {
        self.size
    }

    fn columns(&self) -> usize {
        self.size
    }

    fn at(&self, row: usize, col: usize) -> i64 {
        self.data[row * self.size + col]
    }

    fn neg(&self) -> Self {
        Self {
            size: self.size,
            data: self.data.iter().map(|v| -v).collect(),
        }
    }
}

fn quantize(cost: f64, fallback: f64) -> i64 {
    let cost = if cost.is_finite() { cost } else { fallback };
    (cost.max(0.0) * COST_SCALE).round() as i64
}

/// Optimal assignment of rows to columns for a rectangular matrix.
///
/// Rows that cannot or should not take a column come back as `None`; every
/// such row is charged `unassigned_cost`. Deterministic for a given matrix.
pub fn solve_assignment(costs: &CostMatrix, unassigned_cost: f64) -> Vec<Option<usize>> {
    let (rows, cols) = (costs.rows(), costs.cols());
    let n = rows.max(cols);
    if rows == 0 {
        return Vec::new();
    }
    if cols == 0 {
        return vec![None; rows];
    }

    // total displacement never reaches n^2, so it cannot outweigh one cost unit
    let tie_scale = (n * n + 1) as i64;
    let mut data = vec![0i64; n * n];
    for i in 0..n {
        for j in 0..n {
            let (cost, displacement) = if i < rows && j < cols {
                (quantize(costs.get(i, j), unassigned_cost), i.abs_diff(j))
            } else if i < rows {
                (quantize(unassigned_cost, 1.0), 0)
            } else {
                (0, 0)
            };
            data[i * n + j] = cost * tie_scale + displacement as i64;
        }
    }

    let (_, assignment) = kuhn_munkres_min(&LexicographicWeights { size: n, data });
    assignment
        .into_iter()
        .take(rows)
        .map(|j| (j < cols).then_some(j))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentKind {
    /// Owns its slot.
    Matched,
    /// Shares the slot of a neighbouring matched page.
    Continuation,
    /// Blank or ignored page parked on a pseudo-slot.
    Blank,
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageAlignment {
    pub page_number: u32,
    pub slot: Option<u32>,
    /// `1 - cost` against `slot`; 0 without one, and 0 for every page when
    /// the cost matrix is degenerate.
    pub similarity: f64,
    pub continuation_of: Option<u32>,
    pub kind: AlignmentKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub matched: usize,
    pub continuations: usize,
    pub unmatched_slots: Vec<u32>,
    /// Pages that found no slot of their own.
    pub excess_pages: Vec<u32>,
    /// Pages whose best slot was too weak to keep.
    pub dropped_pages: Vec<u32>,
    pub total_cost: f64,
    /// Every content page saw the same cost for every slot.
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alignment {
    pub pages: Vec<PageAlignment>,
    pub report: AlignmentReport,
}

impl Alignment {
    pub fn slot_of(&self, page_number: u32) -> Option<u32> {
        self.pages
            .iter()
            .find(|p| p.page_number == page_number)
            .and_then(|p| p.slot)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateAligner {
    scorer: SimilarityScorer,
    order_penalty_weight: f64,
    min_slot_similarity: f64,
}

impl TemplateAligner {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            scorer: SimilarityScorer::new(config),
            order_penalty_weight: config.order_penalty_weight,
            min_slot_similarity: config.min_slot_similarity,
        }
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    pub fn align(&self, pages: &[Page], template: &Template) -> Alignment {
        let profiles: Vec<PageProfile> = pages.par_iter().map(PageProfile::from_page).collect();
        self.align_profiles(&profiles, template, &[])
    }

    /// `continuation_marks[i]` says page `i` announced itself as continued;
    /// such a page keeps a neighbour's slot rather than being left without
    /// one. Missing entries count as `false`.
    pub fn align_profiles(
        &self,
        profiles: &[PageProfile],
        template: &Template,
        continuation_marks: &[bool],
    ) -> Alignment {
        let n_pages = profiles.len();
        let n_slots = template.len();
        let blank_rows: Vec<usize> = (0..n_pages).filter(|&i| profiles[i].blank).collect();
        let n_cols = n_slots + blank_rows.len();

        // scorer cost per page and real slot, rows in parallel
        let scores = CostMatrix::from_rows(
            profiles
                .par_iter()
                .map(|profile| {
                    template
                        .slots()
                        .iter()
                        .map(|slot| self.scorer.score_profile(profile, slot).cost)
                        .collect()
                })
                .collect(),
        );

        let mut costs = CostMatrix::new(n_pages, n_cols, 1.0);
        for i in 0..n_pages {
            // position prior: slot a page would take if pages were spread evenly
            let expected = i * n_slots / n_pages;
            for j in 0..n_slots {
                let penalty = if profiles[i].blank {
                    0.0
                } else {
                    self.order_penalty_weight * expected.abs_diff(j) as f64 / n_slots as f64
                };
                costs.set(i, j, scores.get(i, j) + penalty);
            }
            for j in n_slots..n_cols {
                costs.set(i, j, self.scorer.score_blank(&profiles[i]));
            }
        }

        let solution = solve_assignment(&costs, 1.0);

        let mut report = AlignmentReport {
            degenerate: is_degenerate(&scores, profiles),
            ..AlignmentReport::default()
        };
        if report.degenerate {
            warn!(target: ALIGN, pages = n_pages, "cost matrix is degenerate, alignment is arbitrary");
        }

        let mut pages: Vec<PageAlignment> = Vec::with_capacity(n_pages);
        let mut slot_taken = vec![false; n_slots];
        for (i, profile) in profiles.iter().enumerate() {
            let mut alignment = PageAlignment {
                page_number: profile.page_number,
                slot: None,
                similarity: 0.0,
                continuation_of: None,
                kind: AlignmentKind::Unassigned,
            };

            match solution[i] {
                _ if profile.blank => alignment.kind = AlignmentKind::Blank,
                Some(j) if j < n_slots => {
                    let similarity = 1.0 - scores.get(i, j);
                    if similarity >= self.min_slot_similarity {
                        alignment.slot = Some(template.slots()[j].number);
                        alignment.similarity = similarity;
                        alignment.kind = AlignmentKind::Matched;
                        slot_taken[j] = true;
                        report.total_cost += scores.get(i, j);
                    } else {
                        debug!(target: ALIGN, page = profile.page_number, slot = j + 1, similarity, "assignment dropped");
                        report.dropped_pages.push(profile.page_number);
                    }
                }
                _ => report.excess_pages.push(profile.page_number),
            }
            pages.push(alignment);
        }

        self.link_continuations(&mut pages, profiles, &scores, continuation_marks, &report);

        // an arbitrary assignment says nothing about the page
        if report.degenerate {
            for page in &mut pages {
                page.similarity = 0.0;
            }
        }

        report.matched = pages
            .iter()
            .filter(|p| p.kind == AlignmentKind::Matched)
            .count();
        report.continuations = pages
            .iter()
            .filter(|p| p.kind == AlignmentKind::Continuation)
            .count();
        report.unmatched_slots = template
            .slots()
            .iter()
            .zip(&slot_taken)
            .filter(|(_, taken)| !**taken)
            .map(|(slot, _)| slot.number)
            .collect();

        info!(
            target: ALIGN,
            pages = n_pages,
            matched = report.matched,
            continuations = report.continuations,
            unmatched_slots = report.unmatched_slots.len(),
            excess = report.excess_pages.len(),
            "alignment complete"
        );

        Alignment { pages, report }
    }

    /// Excess pages, and marked continuation pages that lost their slot,
    /// share the slot of the nearest matched page (the earlier one on a tie).
    fn link_continuations(
        &self,
        pages: &mut [PageAlignment],
        profiles: &[PageProfile],
        scores: &CostMatrix,
        continuation_marks: &[bool],
        report: &AlignmentReport,
    ) {
        let matched: Vec<usize> = pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == AlignmentKind::Matched)
            .map(|(i, _)| i)
            .collect();
        if matched.is_empty() {
            return;
        }

        for i in 0..pages.len() {
            if pages[i].kind != AlignmentKind::Unassigned {
                continue;
            }
            let page_number = pages[i].page_number;
            let excess = report.excess_pages.contains(&page_number);
            let marked = continuation_marks.get(i).copied().unwrap_or(false);
            if !(excess || marked) {
                continue;
            }

            // matched is sorted, so min_by_key keeps the earlier page on ties
            let Some(&anchor) = matched.iter().min_by_key(|&&m| m.abs_diff(i)) else {
                continue;
            };
            let Some(slot) = pages[anchor].slot else {
                continue;
            };
            let slot_idx = slot as usize - 1;

            debug!(
                target: ALIGN,
                page = page_number,
                anchor = pages[anchor].page_number,
                slot,
                "linked as continuation"
            );
            pages[i].slot = Some(slot);
            pages[i].continuation_of = Some(pages[anchor].page_number);
            pages[i].similarity = if profiles[i].blank {
                0.0
            } else {
                1.0 - scores.get(i, slot_idx)
            };
            pages[i].kind = AlignmentKind::Continuation;
        }
    }
}

fn is_degenerate(scores: &CostMatrix, profiles: &[PageProfile]) -> bool {
    let mut content_rows = (0..scores.rows()).filter(|&i| !profiles[i].blank).peekable();
    if content_rows.peek().is_none() || scores.cols() < 2 {
        return false;
    }
    content_rows.all(|i| {
        let row = scores.row(i);
        let lo = row.iter().copied().map(OrderedFloat).min();
        let hi = row.iter().copied().map(OrderedFloat).max();
        match (lo, hi) {
            (Some(lo), Some(hi)) => hi.0 - lo.0 < DEGENERATE_SPREAD,
            _ => true,
        }
    })
}
