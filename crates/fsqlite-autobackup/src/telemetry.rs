//! Structured telemetry for the backup scheduler.
//!
//! Same shape as the WAL telemetry schema: a serializable event enum, an
//! observer trait with a no-op default, a bounded ring buffer for diagnostic
//! queries, and relaxed atomic counters with a serializable snapshot.
//!
//! # Conformance rules
//!
//! 1. Every [`BackupTelemetryEvent`] variant carries a monotonic `timestamp_ns`.
//! 2. Events and snapshots implement `serde::Serialize` for JSON export.
//! 3. Observers MUST NOT block, take scheduler locks, or perform I/O.
//! 4. Log targets use `fsqlite.backup::<subdomain>` naming.
//! 5. Counters use `AtomicU64` with `Ordering::Relaxed`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cadence::CadenceTier;
use crate::types::{DbPath, FrameCount};

// ---------------------------------------------------------------------------
// Event schema
// ---------------------------------------------------------------------------

/// Why a timer fire did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The process exit flag was already set.
    ProcessExiting,
    /// No live instance for the path.
    NotResolved,
    /// The instance exists but is closed.
    NotOpened,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BackupTelemetryEvent {
    /// Hook installation attempted on a handle.
    HooksInstalled {
        path: DbPath,
        installed: bool,
        timestamp_ns: u64,
    },

    /// A commit notification rescheduled the path.
    CommitScheduled {
        path: DbPath,
        frames: FrameCount,
        backed_up: FrameCount,
        tier: CadenceTier,
        delay_ms: u64,
        timestamp_ns: u64,
    },

    /// A checkpoint notification rescheduled the path.
    CheckpointScheduled {
        path: DbPath,
        frames: FrameCount,
        delay_ms: u64,
        timestamp_ns: u64,
    },

    /// Backup finished successfully.
    BackupCompleted {
        path: DbPath,
        frames: FrameCount,
        duration_us: u64,
        timestamp_ns: u64,
    },

    /// Backup failed and was rescheduled.
    BackupFailed {
        path: DbPath,
        frames: FrameCount,
        duration_us: u64,
        retry_in_ms: u64,
        timestamp_ns: u64,
    },

    /// Timer fired but no backup was attempted.
    BackupSkipped {
        path: DbPath,
        reason: SkipReason,
        timestamp_ns: u64,
    },
}

impl BackupTelemetryEvent {
    #[must_use]
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Self::HooksInstalled { timestamp_ns, .. }
            | Self::CommitScheduled { timestamp_ns, .. }
            | Self::CheckpointScheduled { timestamp_ns, .. }
            | Self::BackupCompleted { timestamp_ns, .. }
            | Self::BackupFailed { timestamp_ns, .. }
            | Self::BackupSkipped { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    #[must_use]
    pub fn path(&self) -> &DbPath {
        match self {
            Self::HooksInstalled { path, .. }
            | Self::CommitScheduled { path, .. }
            | Self::CheckpointScheduled { path, .. }
            | Self::BackupCompleted { path, .. }
            | Self::BackupFailed { path, .. }
            | Self::BackupSkipped { path, .. } => path,
        }
    }

    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::HooksInstalled { .. } => "hooks_installed",
            Self::CommitScheduled { .. } => "commit_scheduled",
            Self::CheckpointScheduled { .. } => "checkpoint_scheduled",
            Self::BackupCompleted { .. } => "backup_completed",
            Self::BackupFailed { .. } => "backup_failed",
            Self::BackupSkipped { .. } => "backup_skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

pub trait BackupTelemetryObserver: Send + Sync {
    fn on_event(&self, event: &BackupTelemetryEvent);
}

pub struct NoOpBackupObserver;

impl BackupTelemetryObserver for NoOpBackupObserver {
    #[inline(always)]
    fn on_event(&self, _event: &BackupTelemetryEvent) {}
}

/// Keeps the last N events.
pub struct BackupTelemetryRingBuffer {
    events: parking_lot::Mutex<RingInner>,
}

struct RingInner {
    buf: Vec<BackupTelemetryEvent>,
    capacity: usize,
    write_pos: usize,
    count: usize,
}

impl BackupTelemetryRingBuffer {
    /// A zero capacity is bumped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: parking_lot::Mutex::new(RingInner {
                buf: Vec::with_capacity(capacity),
                capacity,
                write_pos: 0,
                count: 0,
            }),
        }
    }

    /// Stored events, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<BackupTelemetryEvent> {
        let inner = self.events.lock();
        let n = inner.count.min(inner.capacity);
        let start = if inner.count >= inner.capacity {
            inner.write_pos
        } else {
            0
        };
        (0..n)
            .map(|i| inner.buf[(start + i) % inner.capacity].clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.events.lock();
        inner.count.min(inner.capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackupTelemetryObserver for BackupTelemetryRingBuffer {
    fn on_event(&self, event: &BackupTelemetryEvent) {
        let mut inner = self.events.lock();
        let pos = inner.write_pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(event.clone());
        } else {
            inner.buf[pos] = event.clone();
        }
        inner.write_pos = (pos + 1) % inner.capacity;
        inner.count += 1;
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct BackupMetrics {
    commits_observed: AtomicU64,
    checkpoints_observed: AtomicU64,
    backups_attempted: AtomicU64,
    backups_succeeded: AtomicU64,
    backups_failed: AtomicU64,
    skipped_exiting: AtomicU64,
    skipped_unavailable: AtomicU64,
    hooks_installed: AtomicU64,
    hook_install_failures: AtomicU64,
    backup_duration_us_total: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupMetricsSnapshot {
    pub commits_observed: u64,
    pub checkpoints_observed: u64,
    pub backups_attempted: u64,
    pub backups_succeeded: u64,
    pub backups_failed: u64,
    pub skipped_exiting: u64,
    pub skipped_unavailable: u64,
    pub hooks_installed: u64,
    pub hook_install_failures: u64,
    pub backup_duration_us_total: u64,
    pub max_in_flight: u64,
}

impl BackupMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self) {
        self.commits_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_install(&self, installed: bool) {
        if installed {
            self.hooks_installed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hook_install_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::ProcessExiting => &self.skipped_exiting,
            SkipReason::NotResolved | SkipReason::NotOpened => &self.skipped_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a backup as started; pair with [`Self::record_backup_end`].
    pub fn record_backup_start(&self) {
        self.backups_attempted.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    pub fn record_backup_end(&self, ok: bool, duration_us: u64) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if ok {
            self.backups_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.backups_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.backup_duration_us_total
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> BackupMetricsSnapshot {
        BackupMetricsSnapshot {
            commits_observed: self.commits_observed.load(Ordering::Relaxed),
            checkpoints_observed: self.checkpoints_observed.load(Ordering::Relaxed),
            backups_attempted: self.backups_attempted.load(Ordering::Relaxed),
            backups_succeeded: self.backups_succeeded.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            skipped_exiting: self.skipped_exiting.load(Ordering::Relaxed),
            skipped_unavailable: self.skipped_unavailable.load(Ordering::Relaxed),
            hooks_installed: self.hooks_installed.load(Ordering::Relaxed),
            hook_install_failures: self.hook_install_failures.load(Ordering::Relaxed),
            backup_duration_us_total: self.backup_duration_us_total.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
        }
    }
}
