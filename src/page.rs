use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::InputError;
use crate::normalize::normalize;

/// Default page size (inches) reported by the OCR service for these forms.
pub const DEFAULT_PAGE_WIDTH: f64 = 8.2639;
pub const DEFAULT_PAGE_HEIGHT: f64 = 11.6944;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Line outline as reported by OCR, usually four corners clockwise from
/// top-left. Serialized as a flat `[x0, y0, x1, y1, ...]` array.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Polygon(pub SmallVec<[Point; 4]>);

impl Polygon {
    pub fn from_points(points: impl IntoIterator<Item = Point>) -> Self {
        Self(points.into_iter().collect())
    }

    /// Axis-aligned rectangle as a four-point polygon.
    pub fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self::from_points([
            Point { x: x0, y: y0 },
            Point { x: x1, y: y0 },
            Point { x: x1, y: y1 },
            Point { x: x0, y: y1 },
        ])
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mean of the vertices.
    pub fn center(&self) -> Option<Point> {
        if self.0.is_empty() {
            return None;
        }
        let n = self.0.len() as f64;
        let (sx, sy) = self
            .0
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some(Point {
            x: sx / n,
            y: sy / n,
        })
    }
}

impl TryFrom<Vec<f64>> for Polygon {
    type Error = String;

    fn try_from(flat: Vec<f64>) -> Result<Self, Self::Error> {
        if flat.len() % 2 != 0 {
            return Err(format!(
                "polygon needs an even number of coordinates, got {}",
                flat.len()
            ));
        }
        Ok(Self(
            flat.chunks_exact(2)
                .map(|xy| Point { x: xy[0], y: xy[1] })
                .collect(),
        ))
    }
}

impl From<Polygon> for Vec<f64> {
    fn from(polygon: Polygon) -> Self {
        polygon.0.iter().flat_map(|p| [p.x, p.y]).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    #[serde(alias = "content")]
    pub text: String,
    #[serde(default)]
    pub polygon: Option<Polygon>,
}

impl Line {
    pub fn new(text: impl Into<String>, polygon: Polygon) -> Self {
        Self {
            text: text.into(),
            polygon: Some(polygon),
        }
    }
}

/// One OCR'd page. Ignored pages carry no lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub document_id: DocumentId,
    /// 1-indexed position in the source document.
    pub page_number: u32,
    pub width: f64,
    pub height: f64,
    pub lines: Vec<Line>,
    pub ignored: bool,
}

impl Page {
    pub fn new(document_id: DocumentId, page_number: u32, lines: Vec<Line>) -> Self {
        Self {
            document_id,
            page_number,
            width: DEFAULT_PAGE_WIDTH,
            height: DEFAULT_PAGE_HEIGHT,
            lines,
            ignored: false,
        }
    }

    /// Placeholder for a page a reviewer chose to skip.
    pub fn ignored(document_id: DocumentId, page_number: u32) -> Self {
        Self {
            ignored: true,
            ..Self::new(document_id, page_number, Vec::new())
        }
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Original line texts joined in reading order.
    pub fn text(&self) -> String {
        join_lines(self.lines.iter())
    }

    /// Normalized text of the whole page.
    pub fn normalized_text(&self) -> String {
        normalize(&self.text())
    }

    /// Normalized text of the first `n` lines.
    pub fn normalized_header(&self, n: usize) -> String {
        normalize(&join_lines(self.lines.iter().take(n)))
    }

    /// True when OCR produced nothing readable.
    pub fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.text.trim().is_empty())
    }
}

fn join_lines<'a>(lines: impl Iterator<Item = &'a Line>) -> String {
    lines
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// All pages of one OCR'd document, ordered by page number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct RawOcrDocument {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    pages: Vec<RawPage>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    page_number: Option<u32>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
    #[serde(default)]
    lines: Vec<Line>,
    #[serde(default, rename = "_ignored")]
    ignored: bool,
}

impl Document {
    pub fn new(id: DocumentId, mut pages: Vec<Page>) -> Self {
        pages.sort_by_key(|p| p.page_number);
        Self { id, pages }
    }

    /// Parse the OCR collaborator's JSON (`{"file_name", "pages": [...]}`).
    pub fn from_ocr_json(fallback_id: &str, json: &str) -> Result<Self, serde_json::Error> {
        let raw: RawOcrDocument = serde_json::from_str(json)?;
        let id = raw
            .file_name
            .as_deref()
            .map(|name| {
                Path::new(name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.to_string())
            })
            .unwrap_or_else(|| fallback_id.to_string());
        let id = DocumentId::new(id);

        let pages = raw
            .pages
            .into_iter()
            .enumerate()
            .map(|(idx, p)| {
                let number = p.page_number.unwrap_or(idx as u32 + 1);
                let mut page = Page::new(id.clone(), number, p.lines).with_size(
                    p.width.filter(|w| *w > 0.0).unwrap_or(DEFAULT_PAGE_WIDTH),
                    p.height.filter(|h| *h > 0.0).unwrap_or(DEFAULT_PAGE_HEIGHT),
                );
                if p.ignored {
                    page.ignored = true;
                    page.lines.clear();
                }
                page
            })
            .collect();

        Ok(Self::new(id, pages))
    }

    pub fn from_ocr_file<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_ocr_json(&stem, &raw).map_err(|source| InputError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}
