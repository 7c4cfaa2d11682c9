use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::{Result, TransferError};
use crate::path::{duplicate_name, file_name_remote, join_remote, parent_remote};
use crate::prompt::{ConflictChoice, ConflictRequest, Prompter};
use crate::transfer::cancel::CancelToken;

/// Asks the collaborator about destination collisions and remembers an
/// "apply to all" answer for the rest of one job execution.
pub struct ConflictResolver<'a> {
    prompter: &'a dyn Prompter,
    remembered: Option<ConflictChoice>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(prompter: &'a dyn Prompter) -> Self {
        Self { prompter, remembered: None }
    }

    pub fn resolve(&mut self, request: &ConflictRequest) -> ConflictChoice {
        if let Some(choice) = self.remembered {
            debug!("[plan] conflict auto-resolved choice={:?} dest={}", choice, request.destination.path);
            return choice;
        }
        let decision = self.prompter.confirm_conflict(request);
        if decision.apply_to_all && request.allow_apply_to_all {
            self.remembered = Some(decision.choice);
        }
        debug!("[plan] conflict choice={:?} dest={}", decision.choice, request.destination.path);
        decision.choice
    }

    pub fn remembered(&self) -> Option<ConflictChoice> {
        self.remembered
    }
}

/// First `name (n)` sibling of `dest` that does not exist remotely. Probes
/// against one listing of the parent.
pub fn next_free_remote(conn: &ConnectionManager, dest: &str, cancel: &CancelToken) -> Result<String> {
    let parent = parent_remote(dest).unwrap_or_else(|| "/".to_string());
    let name = file_name_remote(dest);
    let taken: HashSet<String> =
        conn.list_dir(&parent, cancel)?.into_iter().map(|e| e.name).collect();
    for n in 1..u32::MAX {
        let candidate = duplicate_name(&name, n);
        if !taken.contains(&candidate) {
            return Ok(join_remote(&parent, &candidate));
        }
    }
    Err(TransferError::OperationFailed(format!("no free duplicate name for {dest}")))
}

/// Local counterpart of [`next_free_remote`].
pub fn next_free_local(dest: &Path) -> Result<PathBuf> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let name = dest.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    for n in 1..u32::MAX {
        let candidate = parent.join(duplicate_name(&name, n));
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }
    Err(TransferError::OperationFailed(format!("no free duplicate name for {}", dest.display())))
}
