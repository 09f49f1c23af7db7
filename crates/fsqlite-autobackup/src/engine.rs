//! Capabilities the scheduler needs from the database engine.
//!
//! The engine owns transactions, WAL frame accounting and the backup copy
//! itself. It exposes them through these traits so the scheduler can be
//! driven by any engine (or by a test double).

use std::sync::Arc;

use crate::error::Result;
use crate::types::{DbPath, FrameCount};

/// WAL notification callback: `(path, frames) -> handled`.
///
/// Invoked synchronously on the engine thread that committed or
/// checkpointed; implementations must not block on I/O.
pub type WalNotification = Arc<dyn Fn(&DbPath, FrameCount) -> bool + Send + Sync>;

/// A connection handle able to carry named WAL notifications.
pub trait NotifiableHandle {
    fn path(&self) -> &DbPath;

    fn begin_transaction(&mut self) -> Result<()>;

    fn rollback_transaction(&mut self);

    /// Register (`Some`) or remove (`None`) the checkpoint notification
    /// called `name`. Fails when the handle cannot observe checkpoints.
    fn set_notification_when_checkpoint(
        &mut self,
        threshold: FrameCount,
        name: &str,
        callback: Option<WalNotification>,
    ) -> Result<()>;

    /// Register (`Some`) or remove (`None`) the commit notification called
    /// `name`.
    fn set_notification_when_committed(
        &mut self,
        threshold: FrameCount,
        name: &str,
        callback: Option<WalNotification>,
    ) -> Result<()>;
}

/// An open database instance that can be backed up.
pub trait BackupTarget: Send + Sync {
    fn is_opened(&self) -> bool;

    /// Copy the database to its backup location. May be slow.
    fn backup(&self) -> Result<()>;
}

/// Engine-wide lookup of live database instances.
pub trait DatabaseResolver: Send + Sync {
    /// The instance for `path`, if one exists in this process.
    fn resolve_open_instance(&self, path: &DbPath) -> Option<Arc<dyn BackupTarget>>;
}
