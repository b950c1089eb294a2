//! The `logger` module configures `env_logger` for the dBFT crates.
//!
//! The installed logger sits behind a shim so that later `setup*` calls can
//! replace the filter instead of failing because a logger is already set.

use std::sync::{Arc, LazyLock, RwLock};

static LOGGER: LazyLock<Arc<RwLock<env_logger::Logger>>> =
    LazyLock::new(|| Arc::new(RwLock::new(env_logger::Logger::from_default_env())));

/// Filter used by `setup_with_default_filter`.
pub const DEFAULT_FILTER: &str = "dbft_consensus=info,dbft_e2e_tests=info";

struct LoggerShim {}

impl log::Log for LoggerShim {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        LOGGER
            .read()
            .map(|logger| logger.enabled(metadata))
            .unwrap_or(false)
    }

    fn log(&self, record: &log::Record) {
        if let Ok(logger) = LOGGER.read() {
            logger.log(record);
        }
    }

    fn flush(&self) {}
}

fn replace_logger(logger: env_logger::Logger) {
    log::set_max_level(logger.filter());
    if let Ok(mut current) = LOGGER.write() {
        *current = logger;
    }
    // Only the first call installs the shim; later calls just swap the inner logger.
    let _ = log::set_boxed_logger(Box::new(LoggerShim {}));
}

/// Configures logging with `filter`, which `_RUST_LOG` can override.
pub fn setup_with(filter: &str) {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::new().filter_or("_RUST_LOG", filter))
            .format_timestamp_nanos()
            .build();
    replace_logger(logger);
}

/// Configures logging with `filter` as the default when `RUST_LOG` is unset.
pub fn setup_with_default(filter: &str) {
    let logger = env_logger::Builder::from_env(env_logger::Env::new().default_filter_or(filter))
        .format_timestamp_nanos()
        .build();
    replace_logger(logger);
}

/// Configures logging with [`DEFAULT_FILTER`] unless `RUST_LOG` is set.
pub fn setup_with_default_filter() {
    setup_with_default(DEFAULT_FILTER);
}

/// Configures logging at `error` unless `RUST_LOG` is set.
pub fn setup() {
    setup_with_default("error");
}
