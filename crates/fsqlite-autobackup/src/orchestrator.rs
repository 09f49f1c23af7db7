//! WAL-drift driven backup orchestration.
//!
//! [`AutoBackup`] installs commit and checkpoint notifications on each handle,
//! turns them into per-path deadlines on a [`DelayQueue`], and runs the queue
//! on one dedicated thread. That thread is the only caller of
//! [`BackupTarget::backup`], so at most one backup is in flight per
//! orchestrator regardless of how many handles notify concurrently.
//!
//! Handles hold weak references to the orchestrator state; once the
//! orchestrator is dropped their notifications are no-ops.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::cadence::CadencePolicy;
use crate::config::AutoBackupConfig;
use crate::delay_queue::DelayQueue;
use crate::engine::{DatabaseResolver, NotifiableHandle, WalNotification};
use crate::error::Result;
use crate::lifecycle::ExitFlag;
use crate::state::BackedUpFrames;
use crate::telemetry::{
    BackupMetrics, BackupMetricsSnapshot, BackupTelemetryEvent, BackupTelemetryObserver,
    NoOpBackupObserver, SkipReason,
};
use crate::types::{DbPath, FrameCount};

/// Optional collaborators for [`AutoBackup::start_with`].
pub struct StartOptions {
    /// Process exit flag shared with the engine's lifecycle manager.
    pub exit_flag: ExitFlag,
    pub observer: Arc<dyn BackupTelemetryObserver>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            exit_flag: ExitFlag::new(),
            observer: Arc::new(NoOpBackupObserver),
        }
    }
}

struct Inner {
    config: AutoBackupConfig,
    policy: CadencePolicy,
    queue: DelayQueue<DbPath, FrameCount>,
    backed_up: BackedUpFrames,
    resolver: Arc<dyn DatabaseResolver>,
    exit: ExitFlag,
    metrics: BackupMetrics,
    observer: Arc<dyn BackupTelemetryObserver>,
    epoch: Instant,
}

/// Automatic backup scheduler for every handle it is installed on.
pub struct AutoBackup {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dispatch_thread: ThreadId,
}

impl AutoBackup {
    /// Validate `config` and spawn the dispatch thread.
    pub fn start(resolver: Arc<dyn DatabaseResolver>, config: AutoBackupConfig) -> Result<Self> {
        Self::start_with(resolver, config, StartOptions::default())
    }

    pub fn start_with(
        resolver: Arc<dyn DatabaseResolver>,
        config: AutoBackupConfig,
        options: StartOptions,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            policy: CadencePolicy::from_config(&config),
            queue: DelayQueue::new(),
            backed_up: BackedUpFrames::new(),
            resolver,
            exit: options.exit_flag,
            metrics: BackupMetrics::new(),
            observer: options.observer,
            epoch: Instant::now(),
            config,
        });

        let loop_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(inner.config.thread_name.clone())
            .spawn(move || {
                loop_inner
                    .queue
                    .run_loop(|path, frames| loop_inner.on_timer_fired(path, frames));
            })?;

        info!(
            target: "fsqlite.backup::lifecycle",
            low_threshold = inner.config.low_threshold,
            high_threshold = inner.config.high_threshold,
            thread = %inner.config.thread_name,
            "auto-backup started"
        );
        Ok(Self {
            inner,
            dispatch_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Install the backup notifications on a newly activated handle.
    ///
    /// The checkpoint notification is probed inside a transaction that is
    /// always rolled back. The commit notification is only registered when
    /// the checkpoint one was accepted, so a handle either gets both hooks
    /// or none that drive backups.
    pub fn install_hooks(&self, handle: &mut dyn NotifiableHandle) -> bool {
        let path = handle.path().clone();
        let name = self.inner.config.notification_name.as_str();
        let threshold = self.inner.config.notification_threshold;

        if let Err(err) = handle.begin_transaction() {
            warn!(
                target: "fsqlite.backup::hooks",
                path = %path,
                error = %err,
                "cannot open probe transaction; auto-backup disabled for handle"
            );
            self.inner.hooks_installed(&path, false);
            return false;
        }
        let checkpoint = handle.set_notification_when_checkpoint(
            threshold,
            name,
            Some(self.checkpoint_notification()),
        );
        handle.rollback_transaction();

        if let Err(err) = checkpoint {
            warn!(
                target: "fsqlite.backup::hooks",
                path = %path,
                error = %err,
                "checkpoint notification rejected; auto-backup disabled for handle"
            );
            self.inner.hooks_installed(&path, false);
            return false;
        }

        if let Err(err) = handle.set_notification_when_committed(
            threshold,
            name,
            Some(self.commit_notification()),
        ) {
            warn!(
                target: "fsqlite.backup::hooks",
                path = %path,
                error = %err,
                "commit notification rejected; only checkpoints will trigger backups"
            );
        }
        debug!(target: "fsqlite.backup::hooks", path = %path, "backup hooks installed");
        self.inner.hooks_installed(&path, true);
        true
    }

    /// Remove both notifications from `handle`, cancel its pending backup and
    /// forget its backed-up frame count.
    pub fn uninstall_hooks(&self, handle: &mut dyn NotifiableHandle) -> Result<()> {
        let path = handle.path().clone();
        let name = self.inner.config.notification_name.as_str();
        let threshold = self.inner.config.notification_threshold;
        handle.set_notification_when_committed(threshold, name, None)?;
        handle.set_notification_when_checkpoint(threshold, name, None)?;
        let cancelled = self.inner.queue.remove(&path);
        let forgotten = self.inner.backed_up.forget(&path);
        debug!(
            target: "fsqlite.backup::hooks",
            path = %path,
            cancelled = cancelled.is_some(),
            forgotten = ?forgotten,
            "backup hooks removed"
        );
        Ok(())
    }

    /// Commit notification entry point. Always returns `true`.
    pub fn on_committed(&self, path: &DbPath, frames: FrameCount) -> bool {
        self.inner.on_committed(path, frames)
    }

    /// Checkpoint notification entry point. Always returns `true`.
    pub fn on_checkpoint(&self, path: &DbPath, frames: FrameCount) -> bool {
        self.inner.on_checkpoint(path, frames)
    }

    /// Run the backup for `path` as if its timer had fired, on the calling
    /// thread. Returns the backup outcome; skips count as success.
    pub fn on_timer_fired(&self, path: &DbPath, frames: FrameCount) -> bool {
        self.inner.on_timer_fired(path, frames)
    }

    /// Stop the dispatch thread and wait for it to exit. Idempotent.
    ///
    /// Pending backups are abandoned. Every caller returns only after the
    /// loop has exited, including concurrent callers that lose the race to
    /// join the thread. Called from the dispatch thread itself (for example
    /// from inside `backup()`), this only requests the stop.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        self.inner.queue.stop();
        if thread::current().id() == self.dispatch_thread {
            if worker.is_some() {
                warn!(
                    target: "fsqlite.backup::lifecycle",
                    "shutdown requested from dispatch thread; not waiting"
                );
            }
            return;
        }
        self.inner.queue.wait_until_done();
        let Some(worker) = worker else {
            return;
        };
        if worker.join().is_err() {
            error!(target: "fsqlite.backup::lifecycle", "backup thread panicked");
        }
        info!(
            target: "fsqlite.backup::lifecycle",
            abandoned = self.inner.queue.len(),
            "auto-backup stopped"
        );
    }

    /// Whether the dispatch thread is still owned by this orchestrator.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    #[must_use]
    pub fn config(&self) -> &AutoBackupConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn exit_flag(&self) -> &ExitFlag {
        &self.inner.exit
    }

    #[must_use]
    pub fn metrics(&self) -> BackupMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Frame count of the last backup attempt for `path` (0 if none).
    #[must_use]
    pub fn backed_up_frames(&self, path: &DbPath) -> FrameCount {
        self.inner.backed_up.get(path)
    }

    #[must_use]
    pub fn pending_deadline(&self, path: &DbPath) -> Option<Instant> {
        self.inner.queue.deadline_of(path)
    }

    #[must_use]
    pub fn pending_frames(&self, path: &DbPath) -> Option<FrameCount> {
        self.inner.queue.payload_of(path)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.queue.len()
    }

    fn commit_notification(&self) -> WalNotification {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |path: &DbPath, frames: FrameCount| {
            weak.upgrade()
                .is_none_or(|inner| inner.on_committed(path, frames))
        })
    }

    fn checkpoint_notification(&self) -> WalNotification {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |path: &DbPath, frames: FrameCount| {
            weak.upgrade()
                .is_none_or(|inner| inner.on_checkpoint(path, frames))
        })
    }
}

impl Drop for AutoBackup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn timestamp_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn emit(&self, event: &BackupTelemetryEvent) {
        self.observer.on_event(event);
    }

    fn hooks_installed(&self, path: &DbPath, installed: bool) {
        self.metrics.record_hook_install(installed);
        self.emit(&BackupTelemetryEvent::HooksInstalled {
            path: path.clone(),
            installed,
            timestamp_ns: self.timestamp_ns(),
        });
    }

    fn on_committed(&self, path: &DbPath, frames: FrameCount) -> bool {
        self.metrics.record_commit();
        let backed_up = self.backed_up.get(path);
        let (tier, delay) = self.policy.decide(frames, backed_up);
        self.queue.requeue(path.clone(), delay, frames);

        let delay_ms = delay.as_millis() as u64;
        trace!(
            target: "fsqlite.backup::cadence",
            path = %path,
            frames,
            backed_up,
            tier = tier.as_str(),
            delay_ms,
            "commit rescheduled backup"
        );
        self.emit(&BackupTelemetryEvent::CommitScheduled {
            path: path.clone(),
            frames,
            backed_up,
            tier,
            delay_ms,
            timestamp_ns: self.timestamp_ns(),
        });
        true
    }

    fn on_checkpoint(&self, path: &DbPath, frames: FrameCount) -> bool {
        self.metrics.record_checkpoint();
        let delay = self.config.checkpoint_delay();
        self.queue.requeue(path.clone(), delay, frames);

        let delay_ms = delay.as_millis() as u64;
        debug!(
            target: "fsqlite.backup::cadence",
            path = %path,
            frames,
            delay_ms,
            "checkpoint rescheduled backup"
        );
        self.emit(&BackupTelemetryEvent::CheckpointScheduled {
            path: path.clone(),
            frames,
            delay_ms,
            timestamp_ns: self.timestamp_ns(),
        });
        true
    }

    fn skip(&self, path: &DbPath, reason: SkipReason) -> bool {
        self.metrics.record_skip(reason);
        trace!(
            target: "fsqlite.backup::cadence",
            path = %path,
            reason = ?reason,
            "backup skipped"
        );
        self.emit(&BackupTelemetryEvent::BackupSkipped {
            path: path.clone(),
            reason,
            timestamp_ns: self.timestamp_ns(),
        });
        true
    }

    fn on_timer_fired(&self, path: &DbPath, frames: FrameCount) -> bool {
        if self.exit.is_set() {
            return self.skip(path, SkipReason::ProcessExiting);
        }
        let Some(database) = self.resolver.resolve_open_instance(path) else {
            return self.skip(path, SkipReason::NotResolved);
        };
        if !database.is_opened() {
            return self.skip(path, SkipReason::NotOpened);
        }

        self.metrics.record_backup_start();
        let started = Instant::now();
        let result = database.backup();
        let duration_us = started.elapsed().as_micros() as u64;
        self.metrics.record_backup_end(result.is_ok(), duration_us);

        let ok = match result {
            Ok(()) => {
                info!(
                    target: "fsqlite.backup::cadence",
                    path = %path,
                    frames,
                    duration_us,
                    "backup completed"
                );
                self.emit(&BackupTelemetryEvent::BackupCompleted {
                    path: path.clone(),
                    frames,
                    duration_us,
                    timestamp_ns: self.timestamp_ns(),
                });
                true
            }
            Err(err) => {
                let retry = self.config.retry_delay();
                self.queue.requeue(path.clone(), retry, frames);
                let retry_in_ms = retry.as_millis() as u64;
                warn!(
                    target: "fsqlite.backup::cadence",
                    path = %path,
                    frames,
                    error = %err,
                    retry_in_ms,
                    "backup failed; rescheduled"
                );
                self.emit(&BackupTelemetryEvent::BackupFailed {
                    path: path.clone(),
                    frames,
                    duration_us,
                    retry_in_ms,
                    timestamp_ns: self.timestamp_ns(),
                });
                false
            }
        };

        // Recorded on failure too, so commits measure drift from the
        // attempted count instead of re-triggering on the same threshold.
        self.backed_up.record(path, frames);
        ok
    }
}
