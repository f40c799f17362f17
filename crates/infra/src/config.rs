//! Engine configuration loaded from the environment.

use std::str::FromStr;

use tracing::warn;

use raven_observability::LogConfig;

use crate::jobs::pool::{DEFAULT_MAX_ATTEMPTS, DEFAULT_POOL_SIZE};
use crate::jobs::runner::DispatchMode;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrent workers per dispatched job
    pub worker_count: usize,
    /// Pool-level attempt budget per item
    pub max_attempts: u32,
    /// Where the local runner executes dispatches
    pub dispatch: DispatchMode,
    /// Postgres connection string; in-memory store when unset
    pub database_url: Option<String>,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_POOL_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dispatch: DispatchMode::Background,
            database_url: None,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read `RAVEN_*`, `DATABASE_URL` and `RUST_LOG` from the environment.
    ///
    /// Invalid values are logged and replaced by their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let worker_count = parse_var(&lookup, "RAVEN_WORKER_COUNT", defaults.worker_count)
            .max(1);
        let max_attempts = parse_var(&lookup, "RAVEN_MAX_ATTEMPTS", defaults.max_attempts)
            .max(1);
        let dispatch = parse_var(&lookup, "RAVEN_DISPATCH", defaults.dispatch);
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let mut log = defaults.log;
        if let Some(filter) = lookup("RUST_LOG").filter(|f| !f.trim().is_empty()) {
            log = log.with_filter(filter);
        }
        match lookup("RAVEN_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") => {}
            Some(format) if format.eq_ignore_ascii_case("json") => log = log.with_json(true),
            Some(format) if format.eq_ignore_ascii_case("text") => log = log.with_json(false),
            Some(format) => warn!(value = %format, "invalid RAVEN_LOG_FORMAT, using json"),
        }

        Self {
            worker_count,
            max_attempts,
            dispatch,
            database_url,
            log,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Install the process-wide subscriber described by `log`.
    pub fn init_logging(&self) {
        raven_observability::init(&self.log);
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "invalid configuration value, using default");
            default
        }),
        _ => default,
    }
}
