use serde::{Deserialize, Serialize};
use std::{fmt, ops::AddAssign, path::PathBuf};

/// Net change to one source unit after coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileEvent {
    Add,
    Change,
    Unlink,
}

impl FileEvent {
    /// Fold a newer raw event into the pending one for the same path. `None` means the two
    /// cancel out and the path should leave the queue.
    pub fn coalesce(self, next: FileEvent) -> Option<FileEvent> {
        use FileEvent::*;
        match (self, next) {
            (Add, Change) => Some(Add),
            (Add, Unlink) => None,
            (Change, Unlink) => Some(Unlink),
            (Change, Add) => Some(Add),
            (Unlink, Add) => Some(Add),
            (Unlink, Change) => Some(Unlink),
            (same, _) => Some(same),
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileEvent::Add => "add",
            FileEvent::Change => "change",
            FileEvent::Unlink => "unlink",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    /// Absolute path as reported by the OS.
    pub path: PathBuf,
    /// Canonical root-relative path, the coalescing key.
    pub key: String,
    pub event: FileEvent,
}

/// Coalesced changes in first-arrival order, one entry per path.
pub type ChangeBatch = Vec<PathChange>;

/// What a sync pass did. Counters only; a pass that changed nothing reports all zeros apart from
/// `parsed`/`skipped`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub parsed: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub skipped: usize,
    pub links_updated: usize,
    pub centrality_updated: usize,
    pub embedded: usize,
    /// Ambiguous link targets seen by the resolution pass.
    pub ambiguous_links: usize,
}

impl SyncReport {
    /// True when the pass wrote nothing to the cache.
    pub fn is_noop(&self) -> bool {
        self.upserted == 0
            && self.deleted == 0
            && self.renamed == 0
            && self.links_updated == 0
            && self.centrality_updated == 0
            && self.embedded == 0
    }
}

impl AddAssign for SyncReport {
    fn add_assign(&mut self, other: SyncReport) {
        self.parsed += other.parsed;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.renamed += other.renamed;
        self.skipped += other.skipped;
        self.links_updated += other.links_updated;
        self.centrality_updated += other.centrality_updated;
        self.embedded += other.embedded;
        self.ambiguous_links += other.ambiguous_links;
    }
}
