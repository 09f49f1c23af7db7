//! Cadence parameters for automatic backup.
//!
//! The thresholds govern the throughput/latency tradeoff: a low threshold
//! backs up more often, a high one coalesces more frames per backup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};
use crate::types::FrameCount;

/// Frame drift beyond which a commit schedules an immediate backup.
pub const LOW_THRESHOLD: FrameCount = 100;
/// Frame drift beyond which a commit schedules a short coalescing delay.
pub const HIGH_THRESHOLD: FrameCount = 300;

/// Delay used above [`HIGH_THRESHOLD`].
pub const BURST_DELAY: Duration = Duration::from_secs(1);
/// Delay used when the drift is below both thresholds.
pub const IDLE_DELAY: Duration = Duration::from_secs(15);
/// Delay scheduled after a WAL checkpoint.
pub const CHECKPOINT_DELAY: Duration = Duration::from_secs(3);
/// Delay before retrying a failed backup.
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Notification name registered on each handle.
pub const DEFAULT_NOTIFICATION_NAME: &str = "backup";
/// Name of the dispatch thread.
pub const DEFAULT_THREAD_NAME: &str = "fsqlite-autobackup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoBackupConfig {
    pub low_threshold: FrameCount,
    pub high_threshold: FrameCount,
    pub burst_delay_ms: u64,
    pub idle_delay_ms: u64,
    pub checkpoint_delay_ms: u64,
    pub retry_delay_ms: u64,
    /// Threshold passed to the engine when registering notifications.
    pub notification_threshold: FrameCount,
    pub notification_name: String,
    pub thread_name: String,
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        Self {
            low_threshold: LOW_THRESHOLD,
            high_threshold: HIGH_THRESHOLD,
            burst_delay_ms: millis(BURST_DELAY),
            idle_delay_ms: millis(IDLE_DELAY),
            checkpoint_delay_ms: millis(CHECKPOINT_DELAY),
            retry_delay_ms: millis(RETRY_DELAY),
            notification_threshold: 0,
            notification_name: DEFAULT_NOTIFICATION_NAME.to_owned(),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl AutoBackupConfig {
    /// Parse a JSON document; omitted fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations whose tiers would overlap or that cannot be
    /// registered.
    pub fn validate(&self) -> Result<()> {
        if self.low_threshold > self.high_threshold {
            return Err(BackupError::invalid_config(format!(
                "low_threshold ({}) exceeds high_threshold ({})",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.notification_name.is_empty() {
            return Err(BackupError::invalid_config("notification_name is empty"));
        }
        if self.thread_name.contains('\0') {
            return Err(BackupError::invalid_config(
                "thread_name contains a NUL byte",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn burst_delay(&self) -> Duration {
        Duration::from_millis(self.burst_delay_ms)
    }

    #[must_use]
    pub const fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    #[must_use]
    pub const fn checkpoint_delay(&self) -> Duration {
        Duration::from_millis(self.checkpoint_delay_ms)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
