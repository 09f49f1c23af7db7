//! Commit-driven backup cadence.
//!
//! Three tiers, evaluated in order against the drift between the frame count
//! reported by a commit and the last backed-up count:
//!
//! | condition                                   | tier        | delay |
//! |---------------------------------------------|-------------|-------|
//! | `frames > backed_up + high`                 | `Burst`     | 1 s   |
//! | `frames > backed_up + low` or `< backed_up` | `Immediate` | 0     |
//! | otherwise                                   | `Idle`      | 15 s  |
//!
//! A very large drift means writes are still pouring in, so the backup is
//! held back briefly to coalesce the burst.

use std::time::Duration;

use serde::Serialize;

use crate::config::AutoBackupConfig;
use crate::types::FrameCount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceTier {
    Burst,
    Immediate,
    Idle,
}

impl CadenceTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::Immediate => "immediate",
            Self::Idle => "idle",
        }
    }
}

/// Tier thresholds and delays resolved from [`AutoBackupConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadencePolicy {
    low_threshold: FrameCount,
    high_threshold: FrameCount,
    burst_delay: Duration,
    idle_delay: Duration,
}

impl CadencePolicy {
    #[must_use]
    pub fn from_config(config: &AutoBackupConfig) -> Self {
        Self {
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            burst_delay: config.burst_delay(),
            idle_delay: config.idle_delay(),
        }
    }

    #[must_use]
    pub fn classify(&self, frames: FrameCount, backed_up: FrameCount) -> CadenceTier {
        if frames > backed_up.saturating_add(self.high_threshold) {
            CadenceTier::Burst
        } else if frames > backed_up.saturating_add(self.low_threshold) || frames < backed_up {
            CadenceTier::Immediate
        } else {
            CadenceTier::Idle
        }
    }

    #[must_use]
    pub const fn delay_for(&self, tier: CadenceTier) -> Duration {
        match tier {
            CadenceTier::Burst => self.burst_delay,
            CadenceTier::Immediate => Duration::ZERO,
            CadenceTier::Idle => self.idle_delay,
        }
    }

    /// Tier and delay for a commit at `frames`.
    #[must_use]
    pub fn decide(&self, frames: FrameCount, backed_up: FrameCount) -> (CadenceTier, Duration) {
        let tier = self.classify(frames, backed_up);
        (tier, self.delay_for(tier))
    }
}

impl Default for CadencePolicy {
    fn default() -> Self {
        Self::from_config(&AutoBackupConfig::default())
    }
}
