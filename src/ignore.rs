//! Human-in-the-loop page skipping.
//!
//! Reviewers list pages that should not be processed (blank scans, pasted
//! receipts, duplicate covers). Those pages stay in the document as empty
//! `ignored` pages so page numbering never shifts.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::InputError;
use crate::logging::PIPELINE;
use crate::page::{Document, Page};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    pub pdf_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub ignore_pages: BTreeSet<u32>,
    #[serde(default)]
    pub notes: String,
}

/// What applying an [`IgnoreConfig`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IgnoreOutcome {
    pub ignored: Vec<u32>,
    /// Page numbers that had no OCR page and were added as placeholders.
    pub placeholders: Vec<u32>,
    /// Listed page numbers outside `1..=total_pages`; skipped.
    pub out_of_range: Vec<u32>,
}

impl IgnoreConfig {
    pub fn new(pdf_name: impl Into<String>, ignore_pages: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pdf_name: pdf_name.into(),
            doc_id: None,
            total_pages: None,
            ignore_pages: ignore_pages.into_iter().collect(),
            notes: String::new(),
        }
    }

    pub fn with_total_pages(mut self, total_pages: u32) -> Self {
        self.total_pages = Some(total_pages);
        self
    }

    /// Whether this entry is about `document_id` (a file stem).
    pub fn matches(&self, document_id: &str) -> bool {
        let stem = Path::new(&self.pdf_name)
            .file_stem()
            .map(|s| s.to_string_lossy());
        self.pdf_name == document_id
            || stem.as_deref() == Some(document_id)
            || self.doc_id.as_deref() == Some(document_id)
    }

    /// Mark listed pages ignored and fill in pages OCR never returned.
    pub fn apply(&self, document: &mut Document) -> IgnoreOutcome {
        let ocr_last = document.pages.iter().map(|p| p.page_number).max().unwrap_or(0);
        let total = self.total_pages.unwrap_or(ocr_last);
        let mut outcome = IgnoreOutcome::default();

        for &number in &self.ignore_pages {
            if number == 0 || number > total {
                warn!(
                    target: PIPELINE,
                    document_id = %document.id,
                    page = number,
                    total_pages = total,
                    "ignore entry outside the document"
                );
                outcome.out_of_range.push(number);
            }
        }

        for page in document.pages.iter_mut() {
            if self.ignore_pages.contains(&page.page_number) && page.page_number <= total {
                page.ignored = true;
                page.lines.clear();
                outcome.ignored.push(page.page_number);
            }
        }

        let present: BTreeSet<u32> = document.pages.iter().map(|p| p.page_number).collect();
        for number in 1..=total {
            if !present.contains(&number) {
                document.pages.push(Page::ignored(document.id.clone(), number));
                if self.ignore_pages.contains(&number) {
                    outcome.ignored.push(number);
                }
                outcome.placeholders.push(number);
            }
        }
        if !outcome.placeholders.is_empty() {
            document.pages.sort_by_key(|p| p.page_number);
        }
        outcome.ignored.sort_unstable();

        debug!(
            target: PIPELINE,
            document_id = %document.id,
            ignored = outcome.ignored.len(),
            placeholders = outcome.placeholders.len(),
            "ignore config applied"
        );
        outcome
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Registry { documents: Vec<IgnoreConfig> },
    Single(IgnoreConfig),
}

/// Every ignore entry from one reviewer file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreRegistry {
    entries: Vec<IgnoreConfig>,
}

impl IgnoreRegistry {
    pub fn new(entries: Vec<IgnoreConfig>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        // reviewers sometimes leave the file empty
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(match serde_json::from_str::<RegistryFile>(json)? {
            RegistryFile::Registry { documents } => Self::new(documents),
            RegistryFile::Single(entry) => Self::new(vec![entry]),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| InputError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn lookup(&self, document_id: &str) -> Option<&IgnoreConfig> {
        self.entries.iter().find(|e| e.matches(document_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
