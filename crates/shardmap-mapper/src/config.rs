//! Runtime configuration for the controller and the local worker.
//!
//! Both structs start from defaults and can be overridden from `SHARDMAP_*`
//! environment variables:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `SHARDMAP_UPDATE_JOB_STATE_DELAY_MS` | [`ControllerConfig::update_job_state_delay`] | 2000 |
//! | `SHARDMAP_TRANSACTION_ATTEMPTS` | [`ControllerConfig::transaction_attempts`] | 5 |
//! | `SHARDMAP_SPLIT_OVERSAMPLING` | [`ControllerConfig::oversampling`] | 32 |
//! | `SHARDMAP_WORKER_MAX_ATTEMPTS` | [`WorkerConfig::max_attempts`] | 10 |
//! | `SHARDMAP_WORKER_RETRY_DELAY_MS` | [`WorkerConfig::retry_delay`] | 1000 |
//! | `SHARDMAP_WORKER_MAX_DELIVERIES` | [`WorkerConfig::max_deliveries`] | 100000 |
//! | `SHARDMAP_WORKER_REAL_TIME` | [`WorkerConfig::real_time`] | false |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use shardmap_core::EnvReader;

use crate::error::{Error, Result};
use crate::split::DEFAULT_OVERSAMPLING;
use crate::store::DEFAULT_TRANSACTION_ATTEMPTS;

/// Delay between a shard finishing and the job aggregation running.
pub const DEFAULT_UPDATE_JOB_STATE_DELAY: Duration = Duration::from_secs(2);

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Delay applied to `UpdateJobState` tasks.
    pub update_job_state_delay: Duration,
    /// Attempts per read-modify-write before giving up with a transient error.
    pub transaction_attempts: u32,
    /// Scatter samples requested per shard when splitting.
    pub oversampling: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            update_job_state_delay: DEFAULT_UPDATE_JOB_STATE_DELAY,
            transaction_attempts: DEFAULT_TRANSACTION_ATTEMPTS,
            oversampling: DEFAULT_OVERSAMPLING,
        }
    }
}

impl ControllerConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Loads the configuration from `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_reader(env: &EnvReader) -> Result<Self> {
        let mut config = Self::default();
        if let Some(delay) = env.duration_ms("SHARDMAP_UPDATE_JOB_STATE_DELAY_MS")? {
            config.update_job_state_delay = delay;
        }
        if let Some(attempts) = env.u32("SHARDMAP_TRANSACTION_ATTEMPTS")? {
            config.transaction_attempts = attempts;
        }
        if let Some(oversampling) = env.u64("SHARDMAP_SPLIT_OVERSAMPLING")? {
            config.oversampling = usize::try_from(oversampling)
                .map_err(|_| Error::invalid_config("SHARDMAP_SPLIT_OVERSAMPLING is too large"))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero attempts or zero oversampling.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_attempts == 0 {
            return Err(Error::invalid_config("transaction_attempts must be > 0"));
        }
        if self.oversampling == 0 {
            return Err(Error::invalid_config("oversampling must be > 0"));
        }
        Ok(())
    }
}

/// Local worker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Deliveries of one task before a transient failure is given up on.
    pub max_attempts: u32,
    /// Delay before a transiently failed task is redelivered.
    pub retry_delay: Duration,
    /// Upper bound on deliveries in one `run_until_idle` call.
    pub max_deliveries: u64,
    /// Sleep for task delays instead of advancing the queue clock instantly.
    pub real_time: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(1),
            max_deliveries: 100_000,
            real_time: false,
        }
    }
}

impl WorkerConfig {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Loads the configuration from `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_reader(env: &EnvReader) -> Result<Self> {
        let mut config = Self::default();
        if let Some(attempts) = env.u32("SHARDMAP_WORKER_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(delay) = env.duration_ms("SHARDMAP_WORKER_RETRY_DELAY_MS")? {
            config.retry_delay = delay;
        }
        if let Some(max) = env.u64("SHARDMAP_WORKER_MAX_DELIVERIES")? {
            config.max_deliveries = max;
        }
        if let Some(real_time) = env.bool("SHARDMAP_WORKER_REAL_TIME")? {
            config.real_time = real_time;
        }
        if config.max_attempts == 0 {
            return Err(Error::invalid_config("SHARDMAP_WORKER_MAX_ATTEMPTS must be > 0"));
        }
        Ok(config)
    }
}
