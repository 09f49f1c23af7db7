//! In-memory engine double shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fsqlite_autobackup::{
    AutoBackupConfig, BackupError, BackupTarget, DatabaseResolver, DbPath, FrameCount,
    NotifiableHandle, Result, WalNotification,
};
use parking_lot::Mutex;

pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Short delays so end-to-end tests finish quickly.
pub fn fast_config() -> AutoBackupConfig {
    AutoBackupConfig {
        burst_delay_ms: 40,
        idle_delay_ms: 400,
        checkpoint_delay_ms: 120,
        retry_delay_ms: 80,
        ..AutoBackupConfig::default()
    }
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// In-flight backups across every database of one [`MockEngine`].
#[derive(Debug, Default)]
pub struct InFlight {
    pub now: AtomicUsize,
    pub max: AtomicUsize,
}

#[derive(Debug)]
pub struct MockDatabase {
    pub path: DbPath,
    pub opened: AtomicBool,
    pub failures_left: AtomicUsize,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub panic_next: AtomicBool,
    pub backup_time: Duration,
    engine_in_flight: Arc<InFlight>,
}

impl MockDatabase {
    pub fn new(path: &DbPath, backup_time: Duration, engine_in_flight: Arc<InFlight>) -> Arc<Self> {
        Arc::new(Self {
            path: path.clone(),
            opened: AtomicBool::new(true),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            panic_next: AtomicBool::new(false),
            backup_time,
            engine_in_flight,
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BackupTarget for MockDatabase {
    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn backup(&self) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let engine_now = self.engine_in_flight.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.engine_in_flight.max.fetch_max(engine_now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected panic in backup of {}", self.path);
        }
        if !self.backup_time.is_zero() {
            thread::sleep(self.backup_time);
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.engine_in_flight.now.fetch_sub(1, Ordering::SeqCst);
        if failed {
            Err(BackupError::backup_failed(&self.path, "injected failure"))
        } else {
            Ok(())
        }
    }
}

/// Resolver over a fixed set of databases, tracking in-flight backups across
/// all of them.
#[derive(Debug, Default)]
pub struct MockEngine {
    databases: Mutex<HashMap<DbPath, Arc<MockDatabase>>>,
    in_flight: Arc<InFlight>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self, path: &str, backup_time: Duration) -> Arc<MockDatabase> {
        let path = DbPath::from(path);
        let db = MockDatabase::new(&path, backup_time, Arc::clone(&self.in_flight));
        self.databases.lock().insert(path, Arc::clone(&db));
        db
    }

    pub fn total_calls(&self) -> usize {
        self.databases.lock().values().map(|db| db.calls()).sum()
    }

    /// Most backups ever running at once across all databases.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.now.load(Ordering::SeqCst)
    }
}

impl DatabaseResolver for MockEngine {
    fn resolve_open_instance(&self, path: &DbPath) -> Option<Arc<dyn BackupTarget>> {
        self.databases
            .lock()
            .get(path)
            .map(|db| Arc::clone(db) as Arc<dyn BackupTarget>)
    }
}

/// Connection handle that stores registered notifications and fires them on
/// demand.
pub struct MockHandle {
    path: DbPath,
    pub supports_checkpoint_hook: bool,
    pub busy: bool,
    pub broken: bool,
    pub in_transaction: bool,
    pub begins: usize,
    pub rollbacks: usize,
    pub registered_checkpoint_in_txn: bool,
    commit_hook: Option<(String, WalNotification)>,
    checkpoint_hook: Option<(String, WalNotification)>,
}

impl MockHandle {
    pub fn new(path: &str) -> Self {
        Self {
            path: DbPath::from(path),
            supports_checkpoint_hook: true,
            busy: false,
            broken: false,
            in_transaction: false,
            begins: 0,
            rollbacks: 0,
            registered_checkpoint_in_txn: false,
            commit_hook: None,
            checkpoint_hook: None,
        }
    }

    pub fn has_commit_hook(&self) -> bool {
        self.commit_hook.is_some()
    }

    pub fn has_checkpoint_hook(&self) -> bool {
        self.checkpoint_hook.is_some()
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.commit_hook
            .iter()
            .chain(self.checkpoint_hook.iter())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Simulate a committed transaction leaving `frames` in the WAL.
    pub fn commit(&self, frames: FrameCount) -> bool {
        self.commit_hook
            .as_ref()
            .is_none_or(|(_, hook)| hook(&self.path, frames))
    }

    /// Simulate a WAL checkpoint at `frames`.
    pub fn checkpoint(&self, frames: FrameCount) -> bool {
        self.checkpoint_hook
            .as_ref()
            .is_none_or(|(_, hook)| hook(&self.path, frames))
    }
}

impl NotifiableHandle for MockHandle {
    fn path(&self) -> &DbPath {
        &self.path
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.busy {
            return Err(BackupError::Busy {
                path: self.path.clone(),
            });
        }
        if self.broken {
            return Err(BackupError::TransactionFailed {
                path: self.path.clone(),
                detail: "journal is read-only".to_owned(),
            });
        }
        self.begins += 1;
        self.in_transaction = true;
        Ok(())
    }

    fn rollback_transaction(&mut self) {
        self.rollbacks += 1;
        self.in_transaction = false;
    }

    fn set_notification_when_checkpoint(
        &mut self,
        _threshold: FrameCount,
        name: &str,
        callback: Option<WalNotification>,
    ) -> Result<()> {
        if !self.supports_checkpoint_hook {
            return Err(BackupError::HookUnsupported {
                hook: "checkpoint",
                path: self.path.clone(),
            });
        }
        if callback.is_some() {
            self.registered_checkpoint_in_txn = self.in_transaction;
        }
        self.checkpoint_hook = callback.map(|cb| (name.to_owned(), cb));
        Ok(())
    }

    fn set_notification_when_committed(
        &mut self,
        _threshold: FrameCount,
        name: &str,
        callback: Option<WalNotification>,
    ) -> Result<()> {
        self.commit_hook = callback.map(|cb| (name.to_owned(), cb));
        Ok(())
    }
}
