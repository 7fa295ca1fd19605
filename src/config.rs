//! Process-wide configuration, built once at startup.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error_handler::{ErrorHandler, ErrorHandlerFn};
use crate::ticker::DEFAULT_TICKER_DELAY;

pub const DEFAULT_TASKS_MODULE: &str = "Maintenance";
pub const DEFAULT_JOB: &str = "maintflow::TaskJob";

/// Error raised while building configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

type LineFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;
type LineSilencer = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Rewrites and drops backtrace lines before a backtrace is stored.
///
/// Filters run first, in order; silencers then drop any line they match.
#[derive(Clone, Default)]
pub struct BacktraceCleaner {
    filters: Vec<LineFilter>,
    silencers: Vec<LineSilencer>,
}

impl std::fmt::Debug for BacktraceCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacktraceCleaner")
            .field("filters", &self.filters.len())
            .field("silencers", &self.silencers.len())
            .finish()
    }
}

impl BacktraceCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite every line, e.g. to strip a path prefix.
    pub fn add_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Drop lines for which `silencer` returns true.
    pub fn add_silencer<F>(mut self, silencer: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.silencers.push(Arc::new(silencer));
        self
    }

    pub fn clean(&self, backtrace: &str) -> String {
        backtrace
            .lines()
            .map(|line| {
                self.filters
                    .iter()
                    .fold(line.to_string(), |line, filter| filter(&line))
            })
            .filter(|line| !self.silencers.iter().any(|silence| silence(line)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Immutable engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace task names are registered under.
    pub tasks_module: String,
    /// Name of the job the scheduler runs slices with.
    pub job: String,
    /// Minimum delay between two unforced progress writes.
    pub ticker_delay: Duration,
    /// Wall-time budget of one slice. The run is interrupted when spent.
    pub max_slice_runtime: Option<Duration>,
    /// Item budget of one slice. The run is interrupted when spent.
    pub max_slice_items: Option<u64>,
    pub backtrace_cleaner: Option<BacktraceCleaner>,
    pub error_handler: ErrorHandler,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks_module: DEFAULT_TASKS_MODULE.to_string(),
            job: DEFAULT_JOB.to_string(),
            ticker_delay: DEFAULT_TICKER_DELAY,
            max_slice_runtime: None,
            max_slice_items: None,
            backtrace_cleaner: None,
            error_handler: ErrorHandler::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Serializable subset of the configuration, e.g. from a TOML file.
///
/// ```toml
/// tasks_module = "Maintenance"
/// ticker_delay_ms = 2000
/// max_slice_runtime_ms = 300000
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub tasks_module: Option<String>,
    pub job: Option<String>,
    pub ticker_delay_ms: Option<u64>,
    pub max_slice_runtime_ms: Option<u64>,
    pub max_slice_items: Option<u64>,
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from settings read from a file.
    pub fn from_settings(settings: Settings) -> Self {
        let mut builder = Self::new();
        if let Some(tasks_module) = settings.tasks_module {
            builder = builder.tasks_module(tasks_module);
        }
        if let Some(job) = settings.job {
            builder = builder.job(job);
        }
        if let Some(ms) = settings.ticker_delay_ms {
            builder = builder.ticker_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = settings.max_slice_runtime_ms {
            builder = builder.max_slice_runtime(Duration::from_millis(ms));
        }
        if let Some(items) = settings.max_slice_items {
            builder = builder.max_slice_items(items);
        }
        builder
    }

    pub fn tasks_module(mut self, tasks_module: impl Into<String>) -> Self {
        self.config.tasks_module = tasks_module.into();
        self
    }

    pub fn job(mut self, job: impl Into<String>) -> Self {
        self.config.job = job.into();
        self
    }

    pub fn ticker_delay(mut self, delay: Duration) -> Self {
        self.config.ticker_delay = delay;
        self
    }

    pub fn max_slice_runtime(mut self, budget: Duration) -> Self {
        self.config.max_slice_runtime = Some(budget);
        self
    }

    pub fn max_slice_items(mut self, budget: u64) -> Self {
        self.config.max_slice_items = Some(budget);
        self
    }

    pub fn backtrace_cleaner(mut self, cleaner: BacktraceCleaner) -> Self {
        self.config.backtrace_cleaner = Some(cleaner);
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.config.error_handler = handler;
        self
    }

    /// Set the error handler from either supported shape.
    pub fn error_handler_fn(mut self, handler: ErrorHandlerFn) -> Self {
        self.config.error_handler = ErrorHandler::from_fn(handler);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Config, ConfigError> {
        let config = self.config;
        if config.tasks_module.trim().is_empty() {
            return Err(ConfigError::Invalid("tasks_module must not be empty".into()));
        }
        if config.job.trim().is_empty() {
            return Err(ConfigError::Invalid("job must not be empty".into()));
        }
        if config.max_slice_runtime == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid(
                "max_slice_runtime must be greater than zero".into(),
            ));
        }
        if config.max_slice_items == Some(0) {
            return Err(ConfigError::Invalid(
                "max_slice_items must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}
