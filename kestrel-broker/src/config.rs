//! Cluster configuration.

use std::path::PathBuf;
use std::time::Duration;

use kestrel_core::{Limits, NodeId};
use kestrel_group::GroupConfig;
use kestrel_partition::{LogConfig, ReplicationConfig};

use crate::error::{BrokerError, BrokerResult};

/// Configuration for a cluster of brokers hosted in one process.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Broker ids, in placement order.
    pub brokers: Vec<NodeId>,
    /// Root directory for segment files and committed offsets. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Record, topic and request limits.
    pub limits: Limits,
    /// Segment and default retention settings for new topics.
    pub log: LogConfig,
    /// Replication settings shared by every partition.
    pub replication: ReplicationConfig,
    /// Consumer group settings.
    pub group: GroupConfig,
    /// Interval between background replication rounds.
    pub replication_interval_ms: u64,
    /// Interval between retention sweeps.
    pub retention_check_interval_ms: u64,
    /// Interval between consumer session checks.
    pub session_check_interval_ms: u64,
    /// How long an `AckMode::All` produce waits for the high-water mark.
    pub ack_timeout_ms: u64,
}

impl ClusterConfig {
    /// Creates a config for the given brokers with default settings.
    #[must_use]
    pub fn new(brokers: Vec<NodeId>) -> Self {
        Self {
            brokers,
            data_dir: None,
            limits: Limits::default(),
            log: LogConfig::default(),
            replication: ReplicationConfig::default(),
            group: GroupConfig::default(),
            replication_interval_ms: 50,
            retention_check_interval_ms: 300_000,
            session_check_interval_ms: 1_000,
            ack_timeout_ms: 30_000,
        }
    }

    /// Creates a config for brokers `1..=count`.
    #[must_use]
    pub fn with_broker_count(count: u64) -> Self {
        Self::new((1..=count).map(NodeId::new).collect())
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the log config.
    #[must_use]
    pub const fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Sets the replication config.
    #[must_use]
    pub const fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Sets the group config.
    #[must_use]
    pub const fn with_group(mut self, group: GroupConfig) -> Self {
        self.group = group;
        self
    }

    /// Sets the replication round interval.
    #[must_use]
    pub const fn with_replication_interval_ms(mut self, ms: u64) -> Self {
        self.replication_interval_ms = ms;
        self
    }

    /// Sets the retention sweep interval.
    #[must_use]
    pub const fn with_retention_check_interval_ms(mut self, ms: u64) -> Self {
        self.retention_check_interval_ms = ms;
        self
    }

    /// Sets the session check interval.
    #[must_use]
    pub const fn with_session_check_interval_ms(mut self, ms: u64) -> Self {
        self.session_check_interval_ms = ms;
        self
    }

    /// Sets the produce acknowledgment timeout.
    #[must_use]
    pub const fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    /// Returns the replication interval as a `Duration`.
    #[must_use]
    pub const fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    /// Returns the ack timeout as a `Duration`.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first invalid setting.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.brokers.is_empty() {
            return Err(invalid("at least one broker is required"));
        }
        let mut sorted = self.brokers.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.brokers.len() {
            return Err(invalid("broker ids must be unique"));
        }
        self.limits
            .validate()
            .map_err(|e| invalid(format!("limits: {e}")))?;
        self.log
            .validate()
            .map_err(|e| invalid(format!("log: {e}")))?;
        self.replication
            .validate()
            .map_err(|e| invalid(format!("replication: {e}")))?;
        self.group
            .validate()
            .map_err(|e| invalid(format!("group: {e}")))?;

        let intervals = [
            ("replication_interval_ms", self.replication_interval_ms),
            ("retention_check_interval_ms", self.retention_check_interval_ms),
            ("session_check_interval_ms", self.session_check_interval_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::with_broker_count(3)
    }
}

fn invalid(message: impl Into<String>) -> BrokerError {
    BrokerError::InvalidConfig {
        message: message.into(),
    }
}
