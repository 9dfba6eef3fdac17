//! The 37-page reference form.
//!
//! A [`Template`] is loaded once per process, validated up front, and shared
//! read-only between documents. Any defect in it is fatal: without every
//! slot signature there is nothing to align against.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TemplateError;
use crate::layout::PageLayout;
use crate::logging::ALIGN;
use crate::normalize::{compact, normalize, token_set};
use crate::page::{Line, Page};
use crate::patterns::{PageType, StepId};

/// Number of pages in the canonical form. Changing it breaks every consumer
/// that indexes by slot and must come with a new template version.
pub const TEMPLATE_SLOTS: usize = 37;

const BUILTIN_SLOT_STEPS: &str = include_str!("../data/slot_steps.json");

/// What the form expects on one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStep {
    pub slot: u32,
    pub page_type: PageType,
    pub step: Option<StepId>,
}

/// Static slot -> page type / step association.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStepTable {
    pub version: String,
    entries: BTreeMap<u32, SlotStep>,
}

#[derive(Debug, Deserialize)]
struct SlotStepFile {
    #[serde(default)]
    version: String,
    slots: Vec<SlotStep>,
}

impl SlotStepTable {
    pub fn builtin() -> Result<Self, TemplateError> {
        Self::from_json(BUILTIN_SLOT_STEPS)
    }

    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let file: SlotStepFile = serde_json::from_str(json)?;
        let mut entries = BTreeMap::new();
        for entry in file.slots {
            if entry.slot == 0 || entry.slot as usize > TEMPLATE_SLOTS {
                return Err(TemplateError::StepTable(format!(
                    "slot {} is outside 1..={}",
                    entry.slot, TEMPLATE_SLOTS
                )));
            }
            let slot = entry.slot;
            if entries.insert(slot, entry).is_some() {
                return Err(TemplateError::StepTable(format!(
                    "slot {} is listed twice",
                    slot
                )));
            }
        }
        for slot in 1..=TEMPLATE_SLOTS as u32 {
            if !entries.contains_key(&slot) {
                return Err(TemplateError::MissingStep { slot });
            }
        }
        Ok(Self {
            version: file.version,
            entries,
        })
    }

    pub fn get(&self, slot: u32) -> Option<&SlotStep> {
        self.entries.get(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotStep> {
        self.entries.values()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlotFile {
    slot: u32,
    #[serde(default = "default_width")]
    width: f64,
    #[serde(default = "default_height")]
    height: f64,
    lines: Vec<Line>,
}

fn default_width() -> f64 {
    crate::page::DEFAULT_PAGE_WIDTH
}

fn default_height() -> f64 {
    crate::page::DEFAULT_PAGE_HEIGHT
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    version: String,
    slots: Vec<SlotFile>,
}

/// One canonical reference page with its precomputed signatures.
#[derive(Debug, Clone)]
pub struct TemplateSlot {
    /// 1-based slot number.
    pub number: u32,
    pub page_type: PageType,
    pub step: Option<StepId>,
    pub width: f64,
    pub height: f64,
    pub lines: Vec<Line>,
    /// Normalized text of the whole slot.
    pub signature: String,
    pub tokens: BTreeSet<String>,
    /// Compact per-line keys for line-level matching.
    pub line_keys: Vec<String>,
    pub layout: PageLayout,
}

impl TemplateSlot {
    fn build(raw: SlotFile, step: &SlotStep) -> Result<Self, TemplateError> {
        if !(raw.width.is_finite() && raw.height.is_finite() && raw.width > 0.0 && raw.height > 0.0)
        {
            return Err(TemplateError::PageSize {
                slot: raw.slot,
                width: raw.width,
                height: raw.height,
            });
        }
        let text = raw
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let signature = normalize(&text);
        if signature.is_empty() {
            return Err(TemplateError::EmptySlot { slot: raw.slot });
        }
        let line_keys = raw
            .lines
            .iter()
            .map(|l| compact(&l.text))
            .filter(|k| !k.is_empty())
            .collect();

        Ok(Self {
            number: raw.slot,
            page_type: step.page_type.clone(),
            step: step.step.clone(),
            width: raw.width,
            height: raw.height,
            tokens: token_set(&signature),
            layout: PageLayout::from_lines(&raw.lines, raw.width, raw.height),
            signature,
            line_keys,
            lines: raw.lines,
        })
    }
}

/// Versioned, validated set of reference slots, ordered 1..=37.
#[derive(Debug, Clone)]
pub struct Template {
    pub version: String,
    slots: Vec<TemplateSlot>,
}

impl Template {
    pub fn from_file<P: AsRef<Path>>(path: P, steps: &SlotStepTable) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw, steps)
    }

    pub fn from_json(json: &str, steps: &SlotStepTable) -> Result<Self, TemplateError> {
        let file: TemplateFile = serde_json::from_str(json)?;
        Self::build(file.version, file.slots, steps)
    }

    /// Use an OCR'd reference document as the template, page N becoming
    /// slot N.
    pub fn from_reference_pages(
        version: impl Into<String>,
        pages: &[Page],
        steps: &SlotStepTable,
    ) -> Result<Self, TemplateError> {
        let slots = pages
            .iter()
            .enumerate()
            .map(|(idx, page)| SlotFile {
                slot: idx as u32 + 1,
                width: page.width,
                height: page.height,
                lines: page.lines.clone(),
            })
            .collect();
        Self::build(version.into(), slots, steps)
    }

    fn build(
        version: String,
        mut raw: Vec<SlotFile>,
        steps: &SlotStepTable,
    ) -> Result<Self, TemplateError> {
        if raw.len() != TEMPLATE_SLOTS {
            return Err(TemplateError::SlotCount {
                expected: TEMPLATE_SLOTS,
                found: raw.len(),
            });
        }
        raw.sort_by_key(|s| s.slot);
        for (position, slot) in raw.iter().enumerate() {
            if slot.slot as usize != position + 1 {
                return Err(TemplateError::SlotNumbering {
                    expected: TEMPLATE_SLOTS,
                    found: slot.slot,
                    position,
                });
            }
        }

        let slots = raw
            .into_iter()
            .map(|slot| {
                let step = steps
                    .get(slot.slot)
                    .ok_or(TemplateError::MissingStep { slot: slot.slot })?;
                TemplateSlot::build(slot, step)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(target: ALIGN, version = %version, slots = slots.len(), "template loaded");
        Ok(Self { version, slots })
    }

    pub fn slots(&self) -> &[TemplateSlot] {
        &self.slots
    }

    pub fn slot(&self, number: u32) -> Option<&TemplateSlot> {
        number
            .checked_sub(1)
            .and_then(|idx| self.slots.get(idx as usize))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
