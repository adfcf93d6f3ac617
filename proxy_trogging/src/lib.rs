//! Log initialization and setup
//!
//! The installed filter sits behind a reload layer so that the proxy can switch verbose logging
//! on and off at runtime through a [`LogFilterHandle`].
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    reload,
};

pub mod cli;
pub mod config;

pub use config::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter '{directive}': {source}")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("Cannot set global tracing subscriber")]
    SetGlobalDefaultError(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|source| Error::InvalidFilter {
        directive: directive.to_string(),
        source,
    })
}

/// Builder for logging
#[derive(Debug, Clone)]
pub struct Builder {
    log_format: LogFormat,
    log_destination: LogDestination,
    log_filter: Option<String>,
    // used when log_filter is none.
    default_log_filter: String,
    with_target: bool,
    with_ansi: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_destination: LogDestination::Stdout,
            log_filter: None,
            default_log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            with_target: true,
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "warn";
    pub const INFO_LOG_FILTER: &'static str = "info";
    pub const VERBOSE_LOG_FILTER: &'static str = "debug,hyper::proto::h1=info,h2=info";
    pub const TRACE_LOG_FILTER: &'static str = "trace,hyper::proto::h1=info,h2=info";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some(Self::INFO_LOG_FILTER.to_string()),
            2 => Some(Self::VERBOSE_LOG_FILTER.to_string()),
            _ => Some(Self::TRACE_LOG_FILTER.to_string()),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: &Option<String>) -> Self {
        Self {
            log_filter: log_filter.clone(),
            ..self
        }
    }

    pub fn with_default_log_filter(self, default_log_filter: impl Into<String>) -> Self {
        Self {
            default_log_filter: default_log_filter.into(),
            ..self
        }
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        Self {
            log_destination,
            ..self
        }
    }

    /// Sets whether or not an event's target is displayed.
    pub fn with_target(self, with_target: bool) -> Self {
        Self {
            with_target,
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    /// The filter directive that will be installed
    pub fn filter_directive(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or(self.default_log_filter.as_str())
    }

    fn make_writer(&self) -> BoxMakeWriter {
        match self.log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(io::stderr),
        }
    }

    /// Install the subscriber as the global default
    pub fn install_global(self) -> Result<LogFilterHandle> {
        let base = self.filter_directive().to_string();
        let (filter, handle) = reload::Layer::new(parse_filter(&base)?);

        let (full, json) = match self.log_format {
            LogFormat::Full => (
                Some(
                    fmt::layer()
                        .with_writer(self.make_writer())
                        .with_target(self.with_target)
                        .with_ansi(self.with_ansi),
                ),
                None,
            ),
            LogFormat::Json => (
                None,
                Some(
                    fmt::layer()
                        .json()
                        .with_writer(self.make_writer())
                        .with_target(self.with_target),
                ),
            ),
        };

        let subscriber = Registry::default().with(filter).with(full).with(json);
        tracing::subscriber::set_global_default(subscriber)?;

        Ok(LogFilterHandle {
            inner: Some(handle),
            base,
            verbose: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Switches the installed log filter between its configured value and verbose logging
#[derive(Debug, Clone)]
pub struct LogFilterHandle {
    inner: Option<reload::Handle<EnvFilter, Registry>>,
    base: String,
    verbose: Arc<AtomicBool>,
}

impl LogFilterHandle {
    /// A handle not connected to any subscriber, which only tracks the requested state
    pub fn detached() -> Self {
        Self {
            inner: None,
            base: Builder::DEFAULT_LOG_FILTER.to_string(),
            verbose: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }

    /// Turn verbose logging on, or restore the configured filter
    pub fn set_verbose(&self, verbose: bool) -> Result<()> {
        if let Some(inner) = &self.inner {
            let directive = if verbose {
                Builder::VERBOSE_LOG_FILTER
            } else {
                self.base.as_str()
            };
            inner.reload(parse_filter(directive)?)?;
        }
        self.verbose.store(verbose, Ordering::SeqCst);
        tracing::info!(verbose, "log filter changed");
        Ok(())
    }
}
