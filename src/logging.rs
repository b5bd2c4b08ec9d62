//! Logging configuration via [`tracing`] crate.

use std::{collections::BTreeMap, fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::{
    non_blocking::{NonBlockingBuilder, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layer, Layered, SubscriberExt},
    registry::Registry,
    util::SubscriberInitExt,
};

type LoggingRegistry = Layered<Vec<Box<dyn Layer<Registry> + Send + Sync>>, Registry>;

/// Error type used in logging configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    /// Log destination I/O error.
    #[error("Log destination I/O error: {0}")]
    Io(#[from] io::Error),
    /// Error while initializing log directory writer.
    #[error("Error while initializing log directory writer: {0}")]
    Directory(#[from] tracing_appender::rolling::InitError),
    /// Global subscriber was already installed.
    #[error("Unable to install global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingConfig {
    /// List of subscribers defined in configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<LoggingSubscriberConfig>,
}

impl LoggingConfig {
    /// Configuration with a single development-friendly subscriber.
    #[must_use]
    pub fn for_dev() -> Self {
        Self {
            subscribers: vec![LoggingSubscriberConfig::default_for_dev()],
        }
    }

    /// Create registry subscriber from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized.
    pub fn make_registry(&self) -> Result<(LoggingRegistry, Vec<WorkerGuard>), LoggingError> {
        let num_subs = self.subscribers.len();
        let (subs, buf_guards) = self.subscribers.iter().try_fold(
            (Vec::with_capacity(num_subs), Vec::with_capacity(num_subs)),
            |(mut acc_s, mut acc_g), sub_cfg| {
                let (sub, guard) = sub_cfg.make_layer()?;
                acc_s.push(sub);
                acc_g.push(guard);
                Ok::<_, LoggingError>((acc_s, acc_g))
            },
        )?;
        Ok((Registry::default().with(subs), buf_guards))
    }

    /// Install configured subscribers as the global default.
    ///
    /// Returned guards flush buffered log lines when dropped, so keep them alive until the
    /// process exits.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized, or if a global subscriber
    /// is already installed.
    pub fn init(&self) -> Result<Vec<WorkerGuard>, LoggingError> {
        let (registry, guards) = self.make_registry()?;
        registry.try_init()?;
        Ok(guards)
    }
}

/// Individual logging subscriber configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingSubscriberConfig {
    /// Overall format for logging output.
    #[serde(default)]
    pub format: LoggingFormat,
    /// Minimum severity level to include in output.
    #[serde(default)]
    pub level: LoggingLevel,
    /// Custom minimum severity levels for span targets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, LoggingLevel>,
    /// Use ANSI escape sequences for output colors and formatting.
    #[serde(default)]
    pub color: bool,
    /// Print event target.
    #[serde(default)]
    pub target: bool,
    /// Print source file path and line number.
    #[serde(default)]
    pub location: bool,
    /// Print thread name.
    #[serde(default)]
    pub thread_name: bool,
    /// Maximum buffered lines to store in a non-blocking writer.
    ///
    /// After reaching this number of lines, new events are dropped.
    #[serde(default = "LoggingSubscriberConfig::default_buffer_lines")]
    pub buffer_lines: usize,
    /// Log destination configuration.
    #[serde(default)]
    pub output: LoggingDestination,
}

impl Default for LoggingSubscriberConfig {
    fn default() -> Self {
        Self {
            format: LoggingFormat::default(),
            level: LoggingLevel::default(),
            targets: BTreeMap::new(),
            color: false,
            target: false,
            location: false,
            thread_name: false,
            buffer_lines: Self::default_buffer_lines(),
            output: LoggingDestination::default(),
        }
    }
}

impl LoggingSubscriberConfig {
    /// Default value for [`Self::buffer_lines`].
    #[must_use]
    #[inline]
    fn default_buffer_lines() -> usize {
        128_000
    }

    /// Logging subscriber template for use in development.
    #[must_use]
    pub fn default_for_dev() -> Self {
        Self {
            format: LoggingFormat::Pretty,
            level: LoggingLevel::Trace,
            color: true,
            target: true,
            location: true,
            thread_name: true,
            ..Self::default()
        }
    }

    /// Make [`tracing_subscriber::Layer`] from subscriber configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if log destination cannot be opened.
    pub fn make_layer<T>(
        &self,
    ) -> Result<(Box<dyn Layer<T> + Send + Sync>, WorkerGuard), LoggingError>
    where
        T: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let buf_builder = NonBlockingBuilder::default()
            .buffered_lines_limit(self.buffer_lines)
            .lossy(true);
        let (buf_writer, buf_guard) = self.output.make_writer(buf_builder)?;
        let layer = fmt::layer()
            .with_writer(buf_writer)
            .with_ansi(self.color)
            .with_target(self.target)
            .with_file(self.location)
            .with_line_number(self.location)
            .with_thread_names(self.thread_name);
        let boxed_layer = match self.format {
            LoggingFormat::Full => layer.boxed(),
            LoggingFormat::Compact => layer.compact().boxed(),
            LoggingFormat::Pretty => layer.pretty().boxed(),
            LoggingFormat::Json => layer.json().flatten_event(true).boxed(),
        };
        let boxed_layer = if self.targets.is_empty() {
            boxed_layer
                .with_filter(LevelFilter::from(self.level))
                .boxed()
        } else {
            boxed_layer
                .with_filter(
                    Targets::new()
                        .with_targets(self.targets.clone())
                        .with_default(LevelFilter::from(self.level)),
                )
                .boxed()
        };
        Ok((boxed_layer, buf_guard))
    }
}

/// Format for logging output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Format which prints span context before log message.
    ///
    /// See [`tracing_subscriber::fmt::format::Full`].
    #[default]
    Full,
    /// More compact format, span names are hidden.
    ///
    /// See [`tracing_subscriber::fmt::format::Compact`].
    Compact,
    /// Excessively verbose and pretty multiline format.
    ///
    /// See [`tracing_subscriber::fmt::format::Pretty`].
    Pretty,
    /// Newline-delimited JSON objects, with event fields flattened.
    ///
    /// See [`tracing_subscriber::fmt::format::Json`].
    Json,
}

/// Minumum event severity for log output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    /// Disables logging altogether.
    #[serde(alias = "off", alias = "disabled", alias = "DISABLED")]
    Off,
    /// Write "error" level only.
    #[serde(alias = "error", alias = "err", alias = "ERR")]
    Error,
    /// Write "warn" and more severe levels.
    #[serde(alias = "warn", alias = "warning", alias = "WARNING")]
    Warn,
    /// Write "info" and more severe levels.
    #[serde(alias = "info")]
    #[default]
    Info,
    /// Write "debug" and more severe levels.
    #[serde(alias = "debug")]
    Debug,
    /// Write everything.
    #[serde(alias = "trace")]
    Trace,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Off => LevelFilter::OFF,
            LoggingLevel::Error => LevelFilter::ERROR,
            LoggingLevel::Warn => LevelFilter::WARN,
            LoggingLevel::Info => LevelFilter::INFO,
            LoggingLevel::Debug => LevelFilter::DEBUG,
            LoggingLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging output destination configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LoggingDestination {
    /// Output to standard output.
    #[default]
    #[serde(alias = "stdout", alias = "out")]
    StdOut,
    /// Output to standard error.
    #[serde(alias = "stderr", alias = "err")]
    StdErr,
    /// Append to a single file.
    File {
        /// Path to file.
        path: String,
    },
    /// Output to daily rotated files in a directory.
    #[serde(alias = "dir")]
    Directory {
        /// Path to directory.
        path: String,
        /// File name prefix.
        #[serde(default = "LoggingDestination::default_prefix")]
        prefix: String,
        /// Maximum amount of files to keep in directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_files: Option<usize>,
    },
}

impl LoggingDestination {
    /// Default value for directory file name prefix.
    #[must_use]
    #[inline]
    fn default_prefix() -> String {
        "crewdb".into()
    }

    /// Make [`tracing_subscriber::fmt::writer::BoxMakeWriter`] from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if destination file or directory cannot be opened.
    pub fn make_writer(
        &self,
        buf_builder: NonBlockingBuilder,
    ) -> Result<(BoxMakeWriter, WorkerGuard), LoggingError> {
        let (wr, wg) = match self {
            Self::StdOut => buf_builder.finish(io::stdout()),
            Self::StdErr => buf_builder.finish(io::stderr()),
            Self::File { path } => {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)?;
                buf_builder.finish(file)
            }
            Self::Directory {
                path,
                prefix,
                max_files,
            } => {
                let mut builder = RollingFileAppender::builder()
                    .rotation(Rotation::DAILY)
                    .filename_prefix(prefix)
                    .filename_suffix("log");
                if let Some(max_files) = max_files {
                    builder = builder.max_log_files(*max_files);
                }
                buf_builder.finish(builder.build(path)?)
            }
        };
        Ok((BoxMakeWriter::new(wr), wg))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_value, json};

    use super::*;

    #[test]
    fn subscriber_de_default() {
        let cfg: LoggingSubscriberConfig = from_value(json!({})).unwrap();
        assert_eq!(cfg, LoggingSubscriberConfig::default());
        assert_eq!(cfg.level, LoggingLevel::Info);
        assert_eq!(cfg.output, LoggingDestination::StdOut);
    }

    #[test]
    fn subscriber_de_custom() {
        let cfg: LoggingConfig = from_value(json!({
            "subscribers": [{
                "format": "json",
                "level": "warning",
                "targets": { "crewdb::gate": "trace" },
                "output": { "type": "dir", "path": "/var/log/crew", "max_files": 7 }
            }]
        }))
        .unwrap();
        let sub = &cfg.subscribers[0];
        assert_eq!(sub.format, LoggingFormat::Json);
        assert_eq!(sub.level, LoggingLevel::Warn);
        assert_eq!(sub.targets["crewdb::gate"], LoggingLevel::Trace);
        assert_eq!(
            sub.output,
            LoggingDestination::Directory {
                path: "/var/log/crew".into(),
                prefix: "crewdb".into(),
                max_files: Some(7),
            }
        );
    }

    #[test]
    fn level_aliases() {
        for (raw, level) in [
            ("off", LoggingLevel::Off),
            ("ERR", LoggingLevel::Error),
            ("warn", LoggingLevel::Warn),
            ("DEBUG", LoggingLevel::Debug),
        ] {
            assert_eq!(from_value::<LoggingLevel>(json!(raw)).unwrap(), level);
        }
        assert!(from_value::<LoggingLevel>(json!("loud")).is_err());
    }

    #[test]
    fn registry_from_stderr_subscriber() {
        let cfg = LoggingConfig {
            subscribers: vec![LoggingSubscriberConfig {
                output: LoggingDestination::StdErr,
                ..LoggingSubscriberConfig::default_for_dev()
            }],
        };
        let (_registry, guards) = cfg.make_registry().unwrap();
        assert_eq!(guards.len(), 1);
    }
}
