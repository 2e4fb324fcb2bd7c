//! Structured logging setup (§10.1), mirroring `syncserver::logging::init_logging`. The
//! JSON drain here is `slog-json` rather than `syncserver`'s Mozilla-specific
//! `slog-mozlog-json`, since there is no MozLog pipeline downstream of this proxy; the
//! field set it emits (`request_id`, `method`, `path`, `status`, `duration_ms`) still
//! mirrors the Event record so a log line and its Event are easy to correlate by eye.

use std::io;

use slog::{o, Drain};

pub fn init_logging(json: bool) -> Result<(), slog::Error> {
    let logger = if json {
        let drain = slog_json::Json::new(io::stdout())
            .add_default_keys()
            .build()
            .fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
    };

    // slog_scope's drop guard can panic during test teardown when multiple loggers
    // race to reset; reset_logging() below handles shutdown explicitly instead.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
    Ok(())
}

pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
