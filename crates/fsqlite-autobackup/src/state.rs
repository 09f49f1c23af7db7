//! Last backed-up frame count per database.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::types::{DbPath, FrameCount};

/// Map from path to the frame count of the most recent backup attempt.
///
/// Commit hooks read it concurrently; only the dispatch thread writes it.
/// Guards are held for the map access alone, never across backup I/O.
#[derive(Debug, Default)]
pub struct BackedUpFrames {
    frames: RwLock<HashMap<DbPath, FrameCount>>,
}

impl BackedUpFrames {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded frame count for `path`, 0 when never attempted.
    #[must_use]
    pub fn get(&self, path: &DbPath) -> FrameCount {
        self.frames.read().get(path).copied().unwrap_or(0)
    }

    /// Record an attempt at `frames`, returning the previous value.
    pub fn record(&self, path: &DbPath, frames: FrameCount) -> Option<FrameCount> {
        self.frames.write().insert(path.clone(), frames)
    }

    /// Drop the record for `path`.
    pub fn forget(&self, path: &DbPath) -> Option<FrameCount> {
        self.frames.write().remove(path)
    }

    #[must_use]
    pub fn contains(&self, path: &DbPath) -> bool {
        self.frames.read().contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all records, sorted by path.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(DbPath, FrameCount)> {
        let mut out: Vec<_> = self
            .frames
            .read()
            .iter()
            .map(|(path, frames)| (path.clone(), *frames))
            .collect();
        out.sort_unstable();
        out
    }
}
