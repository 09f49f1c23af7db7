//! Automatic incremental backup scheduling for WAL-mode databases.
//!
//! The engine reports every commit and every WAL checkpoint together with the
//! current WAL frame count. This crate decides when the database should be
//! backed up:
//!
//! - a commit far beyond the last backed-up frame count backs up after a
//!   short coalescing delay, a moderate drift backs up immediately, and a
//!   small drift waits for 15 s of quiet (see [`cadence`]);
//! - a checkpoint always schedules a backup 3 s later;
//! - a failed backup is retried after 15 s.
//!
//! Backups run on a single dedicated thread, so at most one is in flight.
//! The engine supplies transactions, notifications and the backup copy via
//! the traits in [`engine`].

pub mod cadence;
pub mod config;
pub mod delay_queue;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod state;
pub mod telemetry;
pub mod types;

pub use cadence::{CadencePolicy, CadenceTier};
pub use config::{
    AutoBackupConfig, BURST_DELAY, CHECKPOINT_DELAY, HIGH_THRESHOLD, IDLE_DELAY, LOW_THRESHOLD,
    RETRY_DELAY,
};
pub use delay_queue::DelayQueue;
pub use engine::{BackupTarget, DatabaseResolver, NotifiableHandle, WalNotification};
pub use error::{BackupError, Result};
pub use lifecycle::{AutoBackupService, ExitFlag};
pub use orchestrator::{AutoBackup, StartOptions};
pub use state::BackedUpFrames;
pub use telemetry::{
    BackupMetrics, BackupMetricsSnapshot, BackupTelemetryEvent, BackupTelemetryObserver,
    BackupTelemetryRingBuffer, NoOpBackupObserver, SkipReason,
};
pub use types::{DbPath, FrameCount};
