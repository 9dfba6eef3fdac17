pub mod aligner;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fallback;
pub mod ignore;
pub mod layout;
pub mod logging;
pub mod normalize;
pub mod page;
pub mod patterns;
pub mod pipeline;
pub mod similarity;
pub mod step_mapper;
pub mod template;

use std::path::Path;
use std::sync::Arc;

pub use crate::aligner::{Alignment, AlignmentReport, TemplateAligner};
pub use crate::classifier::{Classification, ClassificationCandidate, PatternClassifier, Source};
pub use crate::config::{FallbackPolicy, PipelineConfig};
pub use crate::error::{
    ConfigError, FallbackError, InputError, PatternError, SetupError, TemplateError,
};
pub use crate::fallback::{AiVerdict, EscalationRequest, StepClassifier};
pub use crate::ignore::{IgnoreConfig, IgnoreRegistry};
pub use crate::normalize::normalize;
pub use crate::page::{Document, DocumentId, Line, Page, Polygon};
pub use crate::patterns::{PageType, PatternTable, StepId};
pub use crate::pipeline::{DocumentPipeline, DocumentResult, LabeledPage, Warning};
pub use crate::step_mapper::{StepLabel, Via};
pub use crate::template::{SlotStepTable, Template, TEMPLATE_SLOTS};

use crate::fallback::{HttpStepClassifier, NoFallback, RetryingFallback};

/// Load the template and pattern table, validate the config and assemble a
/// pipeline.
///
/// `patterns` falls back to the built-in table. The external classifier is
/// taken from the environment unless `use_fallback` is false.
pub fn build_pipeline(
    template: &Path,
    patterns: Option<&Path>,
    config: PipelineConfig,
    use_fallback: bool,
) -> Result<DocumentPipeline, SetupError> {
    config.validate()?;

    let slot_steps = SlotStepTable::builtin()?;
    let template = Arc::new(Template::from_file(template, &slot_steps)?);
    let patterns = Arc::new(match patterns {
        Some(path) => PatternTable::from_file(path)?,
        None => PatternTable::builtin()?,
    });

    let client = if use_fallback {
        HttpStepClassifier::from_env()
    } else {
        None
    };
    let fallback: Arc<dyn StepClassifier> = match client {
        Some(client) => Arc::new(RetryingFallback::new(
            Arc::new(client),
            config.fallback.clone(),
        )),
        None => Arc::new(NoFallback),
    };

    Ok(DocumentPipeline::new(template, patterns, config, fallback))
}
