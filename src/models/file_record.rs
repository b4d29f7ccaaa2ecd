//! Represents a candidate file returned by the source listing.

use serde::{Deserialize, Serialize};

/// A single file discovered in cloud storage.
///
/// Created by the source lister, consumed once by the orchestrator and
/// never mutated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Opaque identifier assigned by the storage provider.
    pub id: String,

    /// Human-readable filename. Doubles as the processing-state key and the
    /// remote filename, so it is assumed unique across runs.
    pub name: String,
}

impl FileRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}
