//! Logging initialization.

pub const DEFAULT_LOG_DIRECTIVES: &str = "quill_core=debug,info";

/// - stderr: `tracing-subscriber::fmt`, filtered by `RUST_LOG` (default
///   `default_directives`, e.g. [`DEFAULT_LOG_DIRECTIVES`])
/// - optional file fallback: `<log_dir>/quill.log`, appended, no ANSI
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(log_dir: Option<&std::path::Path>, default_directives: &str) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives.into());

    let file_layer = log_dir.and_then(|dir| {
        let _ = std::fs::create_dir_all(dir);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("quill.log"))
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}
