use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use scanx_pagemap::{build_pipeline, Document, IgnoreRegistry, PipelineConfig};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about,
    long_about = "Classify and align the pages of one OCR'd disclosure form and write the step labels as JSON.",
    arg_required_else_help = true
)]
pub struct Args {
    /// OCR output for one document (JSON with a `pages` array)
    pub ocr_path: PathBuf,

    /// Template reference data (37 slots)
    #[clap(short, long)]
    pub template: PathBuf,

    /// Reviewer ignore-page registry
    #[clap(short, long)]
    pub ignore: Option<PathBuf>,

    /// Pipeline configuration; defaults apply when omitted
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Page-type rule table replacing the built-in one
    #[clap(long)]
    pub patterns: Option<PathBuf>,

    /// Optional output file path. If omitted, writes to stdout.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[clap(short, long)]
    pub pretty: bool,

    /// Never call the external classifier
    #[clap(long)]
    pub no_llm: bool,

    /// Directory for the log file
    #[clap(long)]
    pub log_dir: Option<PathBuf>,

    /// Debug-level logs for the pipeline stages
    #[clap(short, long)]
    pub verbose: bool,
}

fn expand(path: &Path) -> anyhow::Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("cannot expand path {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // keep the guard alive so the file writer flushes on exit
    let _guard = match &args.log_dir {
        Some(dir) => scanx_pagemap::logging::init_logging_with_dir(args.verbose, expand(dir)?)
            .context("cannot open log directory")?,
        None => {
            scanx_pagemap::logging::init_logging(args.verbose);
            None
        }
    };

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(expand(path)?)
            .context("cannot load pipeline config")?,
        None => PipelineConfig::default(),
    };
    let patterns = args.patterns.as_deref().map(expand).transpose()?;
    let pipeline = build_pipeline(
        &expand(&args.template)?,
        patterns.as_deref(),
        config,
        !args.no_llm,
    )
    .context("cannot build pipeline")?;

    let ocr_path = expand(&args.ocr_path)?;
    let document = Document::from_ocr_file(&ocr_path)
        .with_context(|| format!("cannot load OCR output {}", ocr_path.display()))?;

    let registry = match &args.ignore {
        Some(path) => {
            IgnoreRegistry::from_file(expand(path)?).context("cannot load ignore registry")?
        }
        None => IgnoreRegistry::default(),
    };
    let ignore = registry.lookup(document.id.as_str()).cloned();

    let result = pipeline
        .process_with_ignore(document, ignore.as_ref())
        .await;

    let json = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };

    match args.output {
        Some(path) => {
            let path = expand(&path)?;
            fs::write(&path, json).with_context(|| format!("cannot write {}", path.display()))?;
            info!("output written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}
