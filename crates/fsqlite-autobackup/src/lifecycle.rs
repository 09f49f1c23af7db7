//! Process-wide ownership of the auto-backup orchestrator.
//!
//! The engine's lifecycle manager holds one [`AutoBackupService`]. The
//! orchestrator behind it is created on the first handle activation and torn
//! down exactly once, either through [`AutoBackupService::shutdown`] or on
//! drop. After teardown the service refuses to start a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::AutoBackupConfig;
use crate::engine::{DatabaseResolver, NotifiableHandle};
use crate::error::{BackupError, Result};
use crate::orchestrator::{AutoBackup, StartOptions};
use crate::telemetry::{BackupTelemetryObserver, NoOpBackupObserver};

/// Set-once flag raised when the process begins exiting.
///
/// Timer fires that observe the flag complete as no-ops, covering the window
/// between the exit notification and orchestrator teardown.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum Slot {
    Idle,
    Running(Arc<AutoBackup>),
    TornDown,
}

pub struct AutoBackupService {
    resolver: Arc<dyn DatabaseResolver>,
    config: AutoBackupConfig,
    exit: ExitFlag,
    observer: Arc<dyn BackupTelemetryObserver>,
    slot: Mutex<Slot>,
}

impl AutoBackupService {
    pub fn new(resolver: Arc<dyn DatabaseResolver>, config: AutoBackupConfig) -> Result<Self> {
        Self::with_observer(resolver, config, Arc::new(NoOpBackupObserver))
    }

    pub fn with_observer(
        resolver: Arc<dyn DatabaseResolver>,
        config: AutoBackupConfig,
        observer: Arc<dyn BackupTelemetryObserver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            config,
            exit: ExitFlag::new(),
            observer,
            slot: Mutex::new(Slot::Idle),
        })
    }

    /// The running orchestrator, starting it on first use.
    pub fn get_or_start(&self) -> Result<Arc<AutoBackup>> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Running(auto) => return Ok(Arc::clone(auto)),
            Slot::TornDown => return Err(BackupError::ShutDown),
            Slot::Idle => {}
        }
        let auto = Arc::new(AutoBackup::start_with(
            Arc::clone(&self.resolver),
            self.config.clone(),
            StartOptions {
                exit_flag: self.exit.clone(),
                observer: Arc::clone(&self.observer),
            },
        )?);
        *slot = Slot::Running(Arc::clone(&auto));
        Ok(auto)
    }

    /// The orchestrator if it has been started and not torn down.
    #[must_use]
    pub fn current(&self) -> Option<Arc<AutoBackup>> {
        match &*self.slot.lock() {
            Slot::Running(auto) => Some(Arc::clone(auto)),
            Slot::Idle | Slot::TornDown => None,
        }
    }

    /// Hook-installation entry point for each newly activated handle.
    pub fn install_hooks(&self, handle: &mut dyn NotifiableHandle) -> bool {
        match self.get_or_start() {
            Ok(auto) => auto.install_hooks(handle),
            Err(err) => {
                warn!(
                    target: "fsqlite.backup::lifecycle",
                    path = %handle.path(),
                    error = %err,
                    "auto-backup unavailable; hooks not installed"
                );
                false
            }
        }
    }

    /// Raise the process exit flag. Does not stop the dispatch thread.
    pub fn mark_process_exiting(&self) {
        self.exit.set();
    }

    #[must_use]
    pub fn exit_flag(&self) -> &ExitFlag {
        &self.exit
    }

    /// Stop the orchestrator and wait for its thread. Idempotent.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::TornDown);
        if let Slot::Running(auto) = previous {
            auto.shutdown();
            info!(target: "fsqlite.backup::lifecycle", "auto-backup service torn down");
        }
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        matches!(*self.slot.lock(), Slot::TornDown)
    }
}

impl Drop for AutoBackupService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
