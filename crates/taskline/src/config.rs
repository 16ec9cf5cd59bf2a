//! Pipeline configuration
//!
//! Every component has its own config struct with defaults and `with_*`
//! builders. [`PipelineConfig`] groups them and can be loaded from
//! `TASKLINE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::ListenerConfig;
use crate::performance::PerformanceMonitorConfig;
use crate::results::ResultQueueConfig;
use crate::worker::{PollerConfig, WorkerPoolConfig};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another value
    #[error("invalid {component} configuration: {reason}")]
    Invalid {
        component: &'static str,
        reason: String,
    },

    /// An environment variable could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

impl ConfigError {
    pub fn invalid(component: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            component,
            reason: reason.into(),
        }
    }
}

/// Configuration of a whole task pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tokens the buffer holds between the poller and the workers
    pub buffer_capacity: usize,

    pub worker: WorkerPoolConfig,
    pub poller: PollerConfig,
    pub listener: ListenerConfig,
    pub result_queue: ResultQueueConfig,

    /// Flushing of per task type execution stats
    #[serde(default)]
    pub performance: PerformanceMonitorConfig,

    /// Overrides the fault threshold of the processing options
    pub fault_threshold: Option<u32>,

    /// Directory of the file result backup; in-memory when unset
    pub result_backup_dir: Option<PathBuf>,

    /// How often the joined metrics are logged; disabled when unset
    #[serde(default, with = "optional_duration_millis")]
    pub metrics_log_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            worker: WorkerPoolConfig::default(),
            poller: PollerConfig::default(),
            listener: ListenerConfig::default(),
            result_queue: ResultQueueConfig::default(),
            performance: PerformanceMonitorConfig::default(),
            fault_threshold: None,
            result_backup_dir: None,
            metrics_log_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `TASKLINE_*` environment variables
    ///
    /// A `.env` file in the working directory is loaded first. Unset
    /// variables keep their defaults; a
    /// `TASKLINE_METRICS_LOG_INTERVAL_MS` of zero disables metrics logging.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let worker = defaults.worker;
        let worker_count = env_or("TASKLINE_WORKER_COUNT", worker.worker_count)?;
        let shutdown_timeout =
            env_millis_or("TASKLINE_SHUTDOWN_TIMEOUT_MS", worker.shutdown_timeout)?;
        let mut worker = worker
            .with_worker_count(worker_count)
            .with_shutdown_timeout(shutdown_timeout);
        if let Ok(id) = std::env::var("TASKLINE_WORKER_ID") {
            worker = worker.with_worker_id(id);
        }

        let poller = defaults.poller;
        let poller = poller
            .clone()
            .with_min_interval(env_millis_or("TASKLINE_POLL_MIN_INTERVAL_MS", poller.min_interval)?)
            .with_max_interval(env_millis_or("TASKLINE_POLL_MAX_INTERVAL_MS", poller.max_interval)?)
            .with_idle_wait_timeout(env_millis_or(
                "TASKLINE_IDLE_WAIT_TIMEOUT_MS",
                poller.idle_wait_timeout,
            )?);

        let listener = defaults.listener;
        let listener = ListenerConfig::new(
            std::env::var("TASKLINE_NOTIFICATION_CHANNEL").unwrap_or(listener.channel.clone()),
        )
        .with_wait_timeout(env_millis_or(
            "TASKLINE_NOTIFICATION_WAIT_TIMEOUT_MS",
            listener.wait_timeout,
        )?)
        .with_reconnect_delays(
            env_millis_or(
                "TASKLINE_RECONNECT_INITIAL_DELAY_MS",
                listener.reconnect_initial_delay,
            )?,
            env_millis_or("TASKLINE_RECONNECT_MAX_DELAY_MS", listener.reconnect_max_delay)?,
        )
        .with_connect_timeout(env_millis_or(
            "TASKLINE_CONNECT_TIMEOUT_MS",
            listener.connect_timeout,
        )?);

        let result_queue = defaults.result_queue;
        let result_queue = result_queue
            .clone()
            .with_batch_size(env_or("TASKLINE_RESULT_BATCH_SIZE", result_queue.batch_size)?)
            .with_write_timeout(env_millis_or(
                "TASKLINE_RESULT_WRITE_TIMEOUT_MS",
                result_queue.write_timeout,
            )?)
            .with_reconciliation_interval(env_millis_or(
                "TASKLINE_RECONCILIATION_INTERVAL_MS",
                result_queue.reconciliation_interval,
            )?);

        let performance = defaults.performance;
        let performance = performance
            .clone()
            .with_flush_interval(env_millis_or(
                "TASKLINE_PERF_FLUSH_INTERVAL_MS",
                performance.flush_interval,
            )?)
            .with_flush_count_threshold(env_or(
                "TASKLINE_PERF_FLUSH_COUNT",
                performance.flush_count_threshold,
            )?);

        let metrics_log_interval = match env_parse::<u64>("TASKLINE_METRICS_LOG_INTERVAL_MS")? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.metrics_log_interval,
        };

        let config = Self {
            buffer_capacity: env_or("TASKLINE_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            worker,
            poller,
            listener,
            result_queue,
            performance,
            fault_threshold: env_parse("TASKLINE_FAULT_THRESHOLD")?,
            result_backup_dir: std::env::var("TASKLINE_RESULT_BACKUP_DIR")
                .ok()
                .map(PathBuf::from),
            metrics_log_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the buffer capacity
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_worker(mut self, worker: WorkerPoolConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_result_queue(mut self, result_queue: ResultQueueConfig) -> Self {
        self.result_queue = result_queue;
        self
    }

    pub fn with_performance(mut self, performance: PerformanceMonitorConfig) -> Self {
        self.performance = performance;
        self
    }

    /// Override the fault threshold of the processing options
    pub fn with_fault_threshold(mut self, threshold: u32) -> Self {
        self.fault_threshold = Some(threshold);
        self
    }

    /// Keep backed-up results as files under `dir`
    pub fn with_result_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_backup_dir = Some(dir.into());
        self
    }

    /// Set or disable periodic metrics logging
    pub fn with_metrics_log_interval(mut self, interval: Option<Duration>) -> Self {
        self.metrics_log_interval = interval;
        self
    }

    /// Validate every component configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipeline",
                "buffer_capacity must be greater than zero",
            ));
        }
        if self.metrics_log_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::invalid(
                "pipeline",
                "metrics_log_interval must be greater than zero",
            ));
        }
        self.worker.validate()?;
        self.poller.validate()?;
        self.listener.validate()?;
        self.performance.validate()?;
        self.result_queue.validate()
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(env_parse(var)?.unwrap_or(default))
}

fn env_millis_or(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_parse::<u64>(var)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
