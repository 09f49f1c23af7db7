//! Identifiers shared by the scheduler, the record and the engine traits.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Number of WAL frames written since the database was opened.
///
/// Normally non-decreasing, but a WAL reset after checkpoint may report a
/// smaller value than previously seen.
pub type FrameCount = u32;

/// Opaque identity of one database file.
///
/// Only equality and hashing are meaningful. Cloning is a reference-count
/// bump so the path can be used as a queue key and a map key at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbPath(Arc<str>);

impl DbPath {
    #[must_use]
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(Arc::from(path.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DbPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DbPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for DbPath {
    fn from(path: String) -> Self {
        Self(Arc::from(path))
    }
}

impl Borrow<str> for DbPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}
