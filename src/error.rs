use std::path::PathBuf;

use thiserror::Error;

/// Broken template reference data. Raised while loading, never per document.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("template has {found} slots, expected {expected}")]
    SlotCount { expected: usize, found: usize },
    #[error("template slot numbers must run 1..={expected}, found {found} at position {position}")]
    SlotNumbering {
        expected: usize,
        found: u32,
        position: usize,
    },
    #[error("template slot {slot} has no reference lines")]
    EmptySlot { slot: u32 },
    #[error("template slot {slot} has invalid page size {width}x{height}")]
    PageSize { slot: u32, width: f64, height: f64 },
    #[error("slot step table does not cover slot {slot}")]
    MissingStep { slot: u32 },
    #[error("slot step table is malformed: {0}")]
    StepTable(String),
}

/// Broken pattern-set table.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("failed to read pattern table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pattern table JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pattern table defines no page types")]
    Empty,
    #[error("page type `{page_type}` has no positive pattern")]
    NoPositive { page_type: String },
    #[error("page type `{page_type}` is defined twice")]
    Duplicate { page_type: String },
    #[error("invalid pattern `{pattern}` for `{page_type}`: {source}")]
    Regex {
        page_type: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("pattern `{pattern}` for `{page_type}` puts a quantifier on a tone mark or diacritic")]
    QuantifiedMark { page_type: String, pattern: String },
    #[error("max_priority must be positive")]
    MaxPriority,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{field}` must lie in [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },
    #[error("layout_weight + text_weight must equal 1, got {0}")]
    WeightSum(f64),
    #[error("`{field}` must be positive")]
    NotPositive { field: &'static str },
}

/// OCR or ignore-config input that could not be read at all.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of the external classifier. Always recoverable.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback timed out after {0} ms")]
    Timeout(u64),
    #[error("fallback transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("fallback returned HTTP {0}")]
    Status(u16),
    #[error("fallback quota exhausted")]
    QuotaExhausted,
    #[error("fallback response is malformed: {0}")]
    Malformed(String),
    #[error("fallback chose unknown step `{0}`")]
    UnknownStep(String),
    #[error("no fallback classifier is configured")]
    Unavailable,
}

impl FallbackError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FallbackError::Timeout(_)
                | FallbackError::Transport(_)
                | FallbackError::QuotaExhausted
                | FallbackError::Malformed(_)
        ) || matches!(self, FallbackError::Status(code) if *code >= 500)
    }
}

/// Anything that stops a pipeline from being built. Fatal at startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
