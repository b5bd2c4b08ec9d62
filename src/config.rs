//! Pool and service configuration structures.

use std::{borrow::Cow, marker::PhantomData, num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Root container for service configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ServiceConfig<C = ()>
where
    C: Clone + std::fmt::Debug + PartialEq,
{
    /// Backend client admission pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Service-specific configuration.
    #[serde(flatten)]
    pub service: C,
}

impl<C> ServiceConfig<C>
where
    C: Clone + std::fmt::Debug + PartialEq,
{
    /// Create builder for service configuration.
    pub fn builder() -> ServiceConfigBuilder<C> {
        ServiceConfigBuilder::new()
    }
}

/// Top-level service configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceConfigError {
    /// Configuration builder error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Builder for service configuration.
#[must_use]
pub struct ServiceConfigBuilder<C>
where
    C: Clone + std::fmt::Debug + PartialEq,
{
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    _type: PhantomData<C>,
}

impl<C> ServiceConfigBuilder<C>
where
    C: Clone + std::fmt::Debug + PartialEq,
{
    /// Alternative method to construct a service configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
            _type: PhantomData,
        }
    }
}

impl<C> Default for ServiceConfigBuilder<C>
where
    C: Clone + std::fmt::Debug + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ServiceConfigBuilder<C>
where
    C: Clone + std::fmt::Debug + PartialEq + for<'de> Deserialize<'de>,
{
    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<ServiceConfig<C>, ServiceConfigError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of service configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of service configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add optional file as a source of service configuration.
    ///
    /// Missing file is silently skipped.
    pub fn with_optional_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()).required(false))
    }

    /// Add environment variables as a source of service configuration.
    ///
    /// Both the prefix and nested keys are separated by `__`, so
    /// `CREW__POOL__MAX_CONCURRENT` maps onto `pool.max_concurrent` with prefix `CREW`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
    }
}

/// What to do with a caller which waited in the admission queue for too long.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TimeoutPolicy {
    /// Admit the caller anyway, even if this overcommits the pool.
    ///
    /// Keeps callers from deadlocking, but turns `max_concurrent` into a soft ceiling.
    #[default]
    ForceAdmit,
    /// Fail the caller with [`AdmissionError::Timeout`].
    ///
    /// [`AdmissionError::Timeout`]: crate::AdmissionError::Timeout
    Reject,
}

/// Admission pool configuration.
///
/// Only `max_concurrent`, `admission_timeout`, `on_timeout` and `batch_chunk_size` affect the
/// gate itself. The remaining timeouts are carried through for the backend client call sites,
/// see [`crate::Pool::config`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Pool name, used in logs and metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Advisory minimum idle capacity.
    ///
    /// Informational only, nothing is pre-warmed.
    #[serde(default = "PoolConfig::default_min_idle")]
    pub min_idle: usize,
    /// Ceiling on simultaneously admitted callers.
    #[serde(default = "PoolConfig::default_max_concurrent")]
    pub max_concurrent: NonZeroUsize,
    /// Advisory idle timeout for backend connections.
    #[serde(default = "PoolConfig::default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum time a queued caller waits before [`Self::on_timeout`] applies.
    #[serde(
        default = "PoolConfig::default_admission_timeout",
        alias = "connection_timeout",
        with = "humantime_serde"
    )]
    pub admission_timeout: Duration,
    /// Advisory statement timeout for the backend.
    #[serde(
        default = "PoolConfig::default_statement_timeout",
        with = "humantime_serde"
    )]
    pub statement_timeout: Duration,
    /// Query timeout for the backend.
    ///
    /// Advisory unless [`Self::enforce_query_timeout`] is set.
    #[serde(default = "PoolConfig::default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Policy applied to callers whose admission wait exceeded [`Self::admission_timeout`].
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Cut admitted units of work short after [`Self::query_timeout`].
    #[serde(default)]
    pub enforce_query_timeout: bool,
    /// Upper bound for the number of operations run concurrently by a single batch chunk.
    ///
    /// The effective chunk size is also capped by [`Self::max_concurrent`].
    #[serde(default = "PoolConfig::default_batch_chunk_size")]
    pub batch_chunk_size: NonZeroUsize,
    /// Interval of periodic pool statistics logging.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub monitor_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            min_idle: Self::default_min_idle(),
            max_concurrent: Self::default_max_concurrent(),
            idle_timeout: Self::default_idle_timeout(),
            admission_timeout: Self::default_admission_timeout(),
            statement_timeout: Self::default_statement_timeout(),
            query_timeout: Self::default_query_timeout(),
            on_timeout: TimeoutPolicy::default(),
            enforce_query_timeout: false,
            batch_chunk_size: Self::default_batch_chunk_size(),
            monitor_interval: None,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::min_idle`].
    #[must_use]
    #[inline]
    fn default_min_idle() -> usize {
        2
    }

    /// Default value for [`Self::max_concurrent`].
    #[must_use]
    #[inline]
    fn default_max_concurrent() -> NonZeroUsize {
        NonZeroUsize::MIN.saturating_add(9)
    }

    /// Default value for [`Self::idle_timeout`].
    #[must_use]
    #[inline]
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Default value for [`Self::admission_timeout`].
    #[must_use]
    #[inline]
    fn default_admission_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Default value for [`Self::statement_timeout`].
    #[must_use]
    #[inline]
    fn default_statement_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Default value for [`Self::query_timeout`].
    #[must_use]
    #[inline]
    fn default_query_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Default value for [`Self::batch_chunk_size`].
    #[must_use]
    #[inline]
    fn default_batch_chunk_size() -> NonZeroUsize {
        NonZeroUsize::MIN.saturating_add(4)
    }

    /// Set pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set maximum number of concurrently admitted callers.
    ///
    /// Zero is treated as one.
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Set admission queue timeout.
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Set admission timeout policy.
    #[must_use]
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    /// Enforce or relax [`Self::query_timeout`] for admitted units of work.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration, enforce: bool) -> Self {
        self.query_timeout = timeout;
        self.enforce_query_timeout = enforce;
        self
    }

    /// Set periodic statistics logging interval.
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    /// Pool name, falling back to `default`.
    #[must_use]
    pub fn name(&self) -> Cow<'static, str> {
        match &self.name {
            Some(name) => Cow::Owned(name.clone()),
            None => Cow::Borrowed("default"),
        }
    }

    /// Number of operations in a single batch chunk.
    #[must_use]
    pub fn effective_chunk_size(&self) -> usize {
        self.batch_chunk_size.min(self.max_concurrent).get()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_str, json, to_value};

    use super::*;

    /// Deserialize - empty object falls back to defaults.
    #[test]
    fn pool_config_de_default() {
        let deserialized: PoolConfig = from_str("{}").unwrap();
        assert_eq!(deserialized, PoolConfig::default());
        assert_eq!(deserialized.min_idle, 2);
        assert_eq!(deserialized.max_concurrent.get(), 10);
        assert_eq!(deserialized.idle_timeout, Duration::from_secs(30));
        assert_eq!(deserialized.admission_timeout, Duration::from_secs(5));
        assert_eq!(deserialized.statement_timeout, Duration::from_secs(30));
        assert_eq!(deserialized.query_timeout, Duration::from_secs(10));
        assert_eq!(deserialized.on_timeout, TimeoutPolicy::ForceAdmit);
        assert!(!deserialized.enforce_query_timeout);
    }

    /// Deserialize - humantime durations and policy.
    #[test]
    fn pool_config_de_custom() {
        let serialized = r#"{
            "name": "crew",
            "max_concurrent": 2,
            "connection_timeout": "50ms",
            "query_timeout": "1s 500ms",
            "on_timeout": "reject",
            "monitor_interval": "1m"
        }"#;
        let deserialized: PoolConfig = from_str(serialized).unwrap();
        assert_eq!(deserialized.name(), "crew");
        assert_eq!(deserialized.max_concurrent.get(), 2);
        assert_eq!(deserialized.admission_timeout, Duration::from_millis(50));
        assert_eq!(deserialized.query_timeout, Duration::from_millis(1500));
        assert_eq!(deserialized.on_timeout, TimeoutPolicy::Reject);
        assert_eq!(deserialized.monitor_interval, Some(Duration::from_secs(60)));
    }

    /// Deserialize - zero concurrency is rejected.
    #[test]
    fn pool_config_de_zero_max() {
        assert!(from_str::<PoolConfig>(r#"{"max_concurrent": 0}"#).is_err());
    }

    /// Serialize - durations are written in humantime form.
    #[test]
    fn pool_config_ser_default() {
        let serialized = to_value(PoolConfig::default()).unwrap();
        assert_eq!(serialized["admission_timeout"], json!("5s"));
        assert_eq!(serialized["on_timeout"], json!("force_admit"));
        assert!(serialized.get("name").is_none());
    }

    #[test]
    fn chunk_size_capped_by_concurrency() {
        assert_eq!(PoolConfig::default().effective_chunk_size(), 5);
        assert_eq!(
            PoolConfig::default()
                .with_max_concurrent(3)
                .effective_chunk_size(),
            3
        );
        assert_eq!(
            PoolConfig::default()
                .with_max_concurrent(0)
                .effective_chunk_size(),
            1
        );
    }

    /// Service config with a service-specific section.
    #[test]
    fn service_config_from_source() {
        #[derive(Clone, Debug, Default, Deserialize, PartialEq)]
        struct Extra {
            #[serde(default)]
            backend_url: String,
        }

        let source = config::File::from_str(
            r#"
pool:
  max_concurrent: 4
  admission_timeout: 250ms
backend_url: "https://backend.invalid"
"#,
            config::FileFormat::Yaml,
        );
        let cfg = ServiceConfig::<Extra>::builder()
            .with_source(source)
            .build()
            .unwrap();
        assert_eq!(cfg.pool.max_concurrent.get(), 4);
        assert_eq!(cfg.pool.admission_timeout, Duration::from_millis(250));
        assert_eq!(cfg.service.backend_url, "https://backend.invalid");
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    /// Environment keys keep underscores inside field names.
    #[test]
    fn service_config_from_env() {
        std::env::set_var("CREWENVTEST__POOL__MAX_CONCURRENT", "3");
        std::env::set_var("CREWENVTEST__POOL__ADMISSION_TIMEOUT", "150ms");
        std::env::set_var("CREWENVTEST__POOL__ON_TIMEOUT", "reject");
        let cfg = ServiceConfig::<()>::builder()
            .with_env("CREWENVTEST")
            .build()
            .unwrap();
        assert_eq!(cfg.pool.max_concurrent.get(), 3);
        assert_eq!(cfg.pool.admission_timeout, Duration::from_millis(150));
        assert_eq!(cfg.pool.on_timeout, TimeoutPolicy::Reject);
        assert_eq!(cfg.pool.min_idle, 2);
    }
}
