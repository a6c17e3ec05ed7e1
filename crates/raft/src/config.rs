//! Raft configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RaftError, RaftResult};

/// Timing and batching of one raft server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Election timeout minimum
    pub election_timeout_min: Duration,

    /// Election timeout maximum
    pub election_timeout_max: Duration,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,

    /// Length of one replication round for a pending entry
    pub replication_timeout: Duration,

    /// Rounds without quorum after which the leader steps down
    pub max_append_retries: u32,

    /// Max entries per append
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            replication_timeout: Duration::from_millis(500),
            max_append_retries: 5,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    /// Reject settings the server cannot run with
    pub fn validate(&self) -> RaftResult<()> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Configuration(
                "election_timeout_min exceeds election_timeout_max".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout_min
        {
            return Err(RaftError::Configuration(
                "heartbeat_interval must be non-zero and below election_timeout_min".to_string(),
            ));
        }
        if self.max_append_retries == 0 || self.max_entries_per_append == 0 {
            return Err(RaftError::Configuration(
                "max_append_retries and max_entries_per_append must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_beat_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..RaftConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RaftError::Configuration(_))
        ));
    }
}
