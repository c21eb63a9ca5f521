//! Structured logging setup, threaded explicitly through the orchestrator
//! rather than installed as a global/thread-local logger.

use slog::Drain;

pub fn run_with_logger<T>(
    level: slog::Level,
    f: impl FnOnce(&slog::Logger) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    f(&logger)
}

/// Translates the hook's single CLI verbosity integer (matching the
/// daemon's own `-v` counting convention: 0 = warnings, higher = more
/// detail) into a `slog::Level`.
pub fn level_from_verbosity(verbosity: u8) -> slog::Level {
    match verbosity {
        0 => slog::Level::Warning,
        1 => slog::Level::Info,
        2 => slog::Level::Debug,
        _ => slog::Level::Trace,
    }
}
