use std::path::PathBuf;
use std::sync::Once;

use tracing::Level;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

// Log targets, one per pipeline stage
pub const CLASSIFY: &str = "scanx_classify";
pub const SCORE: &str = "scanx_score";
pub const ALIGN: &str = "scanx_align";
pub const STEP: &str = "scanx_step";
pub const FALLBACK: &str = "scanx_fallback";
pub const PIPELINE: &str = "scanx_pipeline";

const STAGE_TARGETS: &[&str] = &[CLASSIFY, SCORE, ALIGN, STEP, FALLBACK, PIPELINE];

const LOG_FILE_NAME: &str = "scanx-pagemap.log";

static INIT: Once = Once::new();

fn stage_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    for target in STAGE_TARGETS {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install a stderr subscriber. Safe to call more than once.
pub fn init_logging(verbose: bool) {
    INIT.call_once(|| {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(stage_filter(verbose));

        // try_init: a test harness may already own the global subscriber
        let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
    });
}

/// Install a stderr subscriber plus a file layer under `log_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging_with_dir(
    verbose: bool,
    log_dir: PathBuf,
) -> std::io::Result<Option<WorkerGuard>> {
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::NEVER, log_dir, LOG_FILE_NAME);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let mut installed = false;
    INIT.call_once(|| {
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(non_blocking_appender)
            .with_filter(stage_filter(true));

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(stage_filter(verbose));

        installed = tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
            .is_ok();
    });

    Ok(installed.then_some(guard))
}
