// transfer module: planning, conflict resolution, resumable execution and verification
pub mod cancel;
pub mod conflict;
pub mod executor;
pub mod planner;
pub mod verify;

use std::path::PathBuf;

pub use cancel::{CancelRegistration, CancelToken};
pub use executor::{Executor, FileOutcome};
pub use verify::{VerificationMode, VerificationSummary};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_HASH_THRESHOLD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// One file to move. `size` and `mtime` describe the source side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub local: PathBuf,
    pub remote: String,
    pub display_name: String,
    pub size: u64,
    pub mtime: Option<u64>,
}

impl TransferItem {
    pub fn source_display(&self, direction: Direction) -> String {
        match direction {
            Direction::Upload => crate::path::display_path(&self.local).to_string(),
            Direction::Download => self.remote.clone(),
        }
    }
}

/// Flattened, conflict-resolved work for one job execution. Directories are
/// ordered shallow-to-deep so each one precedes everything under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub direction: Direction,
    pub remote_dirs: Vec<String>,
    pub local_dirs: Vec<PathBuf>,
    pub files: Vec<TransferItem>,
}

impl TransferPlan {
    pub fn new(direction: Direction) -> Self {
        Self { direction, remote_dirs: Vec::new(), local_dirs: Vec::new(), files: Vec::new() }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Bottom-up removal order produced by delete planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteStep {
    File(String),
    /// Removes the link itself, never its target.
    Link(String),
    Dir(String),
}

impl DeleteStep {
    pub fn path(&self) -> &str {
        match self {
            DeleteStep::File(p) | DeleteStep::Link(p) | DeleteStep::Dir(p) => p,
        }
    }
}

/// Executor knobs, derived from [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub resume: bool,
    pub verify: bool,
    pub hash_threshold_bytes: u64,
    pub mtime_tolerance_secs: u64,
    pub file_retry_attempts: usize,
    pub preserve_mtime: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            resume: true,
            verify: true,
            hash_threshold_bytes: DEFAULT_HASH_THRESHOLD,
            mtime_tolerance_secs: 2,
            file_retry_attempts: 3,
            preserve_mtime: true,
        }
    }
}
