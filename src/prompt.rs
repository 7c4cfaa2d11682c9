//! UI-decision collaborator. The engine never renders dialogs itself; it asks a
//! [`Prompter`] and consumes the decision value.
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;
use std::thread::ThreadId;

use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Overwrite,
    Duplicate,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictDecision {
    pub choice: ConflictChoice,
    pub apply_to_all: bool,
}

impl ConflictDecision {
    pub fn once(choice: ConflictChoice) -> Self {
        Self { choice, apply_to_all: false }
    }

    pub fn for_all(choice: ConflictChoice) -> Self {
        Self { choice, apply_to_all: true }
    }
}

/// Size/time/kind of one side of a collision, shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDetails {
    pub path: String,
    pub size: u64,
    pub mtime: Option<u64>,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRequest {
    pub source: EntryDetails,
    pub destination: EntryDetails,
    pub allow_apply_to_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkChoice {
    OperateOnLink,
    FollowTarget,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyPrompt {
    pub title: String,
    pub message: String,
    pub details: String,
    /// `true` for a changed key (possible MITM), `false` for a first-seen host.
    pub is_warning: bool,
}

pub trait Prompter: Send + Sync {
    fn prompt_text(&self, title: &str, message: &str, secret: bool) -> Option<String>;
    fn confirm(&self, title: &str, message: &str) -> bool;
    fn confirm_conflict(&self, request: &ConflictRequest) -> ConflictDecision;
    fn confirm_symlink(&self, link: &str, target: &str) -> SymlinkChoice;
    fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool;

    /// Thread that renders this prompter's dialogs, if any. Blocking
    /// decision requests issued from that thread would deadlock and are
    /// refused by callers.
    fn owner_thread(&self) -> Option<ThreadId> {
        None
    }
}

/// Interactive prompter on stdin/stdout used by the binary.
pub struct ConsolePrompter {
    lock: Mutex<()>,
}

impl Default for ConsolePrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePrompter {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    fn read_line(&self, prompt: &str) -> Option<String> {
        let mut out = std::io::stdout();
        let _ = write!(out, "{}", prompt);
        let _ = out.flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

// 口令不回显
fn read_secret(prompt: &str) -> Option<String> {
    match rpassword::prompt_password(prompt) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::debug!("[auth] cannot read secret from terminal err={}", e);
            None
        }
    }
}

fn describe(d: &EntryDetails) -> String {
    let when = d
        .mtime
        .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown time".to_string());
    if d.is_dir {
        format!("{} (directory, {})", d.path, when)
    } else {
        format!("{} ({}, {})", d.path, crate::util::human_bytes(d.size), when)
    }
}

impl Prompter for ConsolePrompter {
    fn prompt_text(&self, title: &str, message: &str, secret: bool) -> Option<String> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        println!("{}", title.bold());
        let prompt = format!("{}: ", message);
        let answer = if secret { read_secret(&prompt) } else { self.read_line(&prompt) };
        answer.filter(|s| !s.is_empty())
    }

    fn confirm(&self, title: &str, message: &str) -> bool {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        println!("{}", title.bold());
        matches!(
            self.read_line(&format!("{} [y/N] ", message)).as_deref().map(str::trim),
            Some("y" | "Y" | "yes" | "YES")
        )
    }

    fn confirm_conflict(&self, request: &ConflictRequest) -> ConflictDecision {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        println!("{}", "Destination already exists".yellow().bold());
        println!("  source:      {}", describe(&request.source));
        println!("  destination: {}", describe(&request.destination));
        let hint = if request.allow_apply_to_all {
            "[o]verwrite / [d]uplicate / [c]ancel (upper case applies to all) "
        } else {
            "[o]verwrite / [d]uplicate / [c]ancel "
        };
        loop {
            let Some(answer) = self.read_line(hint) else {
                return ConflictDecision::once(ConflictChoice::Cancel);
            };
            let all = request.allow_apply_to_all
                && answer.chars().next().is_some_and(|c| c.is_ascii_uppercase());
            let choice = match answer.trim().to_ascii_lowercase().as_str() {
                "o" | "overwrite" => ConflictChoice::Overwrite,
                "d" | "duplicate" => ConflictChoice::Duplicate,
                "c" | "cancel" => ConflictChoice::Cancel,
                _ => continue,
            };
            return ConflictDecision { choice, apply_to_all: all };
        }
    }

    fn confirm_symlink(&self, link: &str, target: &str) -> SymlinkChoice {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        println!("{} {} -> {}", "Symbolic link:".cyan().bold(), link, target);
        loop {
            let Some(answer) = self.read_line("[l]ink itself / [t]arget / [c]ancel ") else {
                return SymlinkChoice::Cancel;
            };
            match answer.trim().to_ascii_lowercase().as_str() {
                "l" | "link" => return SymlinkChoice::OperateOnLink,
                "t" | "target" => return SymlinkChoice::FollowTarget,
                "c" | "cancel" => return SymlinkChoice::Cancel,
                _ => continue,
            }
        }
    }

    fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if prompt.is_warning {
            println!("{}", prompt.title.red().bold());
            println!("{}", prompt.message.red());
        } else {
            println!("{}", prompt.title.bold());
            println!("{}", prompt.message);
        }
        println!("{}", prompt.details);
        let question = if prompt.is_warning {
            "Replace the stored key and continue? [y/N] "
        } else {
            "Trust this host and continue? [y/N] "
        };
        matches!(self.read_line(question).as_deref().map(str::trim), Some("y" | "Y" | "yes"))
    }
}

/// Everything a [`ScriptedPrompter`] was asked, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptRecord {
    Text(String),
    /// A text prompt whose answer is read without echo.
    Secret(String),
    Confirm(String),
    Conflict(ConflictRequest),
    Symlink(String),
    HostKey(HostKeyPrompt),
}

/// Replays queued answers; when a queue runs dry it falls back to a refusal
/// (`Cancel`, `false`, `None`).
#[derive(Default)]
pub struct ScriptedPrompter {
    texts: Mutex<VecDeque<Option<String>>>,
    confirms: Mutex<VecDeque<bool>>,
    conflicts: Mutex<VecDeque<ConflictDecision>>,
    symlinks: Mutex<VecDeque<SymlinkChoice>>,
    host_keys: Mutex<VecDeque<bool>>,
    owner: Mutex<Option<ThreadId>>,
    records: Mutex<Vec<PromptRecord>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, v: Option<&str>) -> &Self {
        self.texts.lock().unwrap_or_else(|p| p.into_inner()).push_back(v.map(str::to_string));
        self
    }

    pub fn push_confirm(&self, v: bool) -> &Self {
        self.confirms.lock().unwrap_or_else(|p| p.into_inner()).push_back(v);
        self
    }

    pub fn push_conflict(&self, v: ConflictDecision) -> &Self {
        self.conflicts.lock().unwrap_or_else(|p| p.into_inner()).push_back(v);
        self
    }

    pub fn push_symlink(&self, v: SymlinkChoice) -> &Self {
        self.symlinks.lock().unwrap_or_else(|p| p.into_inner()).push_back(v);
        self
    }

    pub fn push_host_key(&self, v: bool) -> &Self {
        self.host_keys.lock().unwrap_or_else(|p| p.into_inner()).push_back(v);
        self
    }

    /// Pretend dialogs are rendered on `thread`.
    pub fn set_owner_thread(&self, thread: Option<ThreadId>) {
        *self.owner.lock().unwrap_or_else(|p| p.into_inner()) = thread;
    }

    pub fn records(&self) -> Vec<PromptRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record(&self, r: PromptRecord) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).push(r);
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt_text(&self, _title: &str, message: &str, secret: bool) -> Option<String> {
        if secret {
            self.record(PromptRecord::Secret(message.to_string()));
        } else {
            self.record(PromptRecord::Text(message.to_string()));
        }
        self.texts.lock().unwrap_or_else(|p| p.into_inner()).pop_front().flatten()
    }

    fn confirm(&self, _title: &str, message: &str) -> bool {
        self.record(PromptRecord::Confirm(message.to_string()));
        self.confirms.lock().unwrap_or_else(|p| p.into_inner()).pop_front().unwrap_or(false)
    }

    fn confirm_conflict(&self, request: &ConflictRequest) -> ConflictDecision {
        self.record(PromptRecord::Conflict(request.clone()));
        self.conflicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConflictDecision::once(ConflictChoice::Cancel))
    }

    fn confirm_symlink(&self, link: &str, _target: &str) -> SymlinkChoice {
        self.record(PromptRecord::Symlink(link.to_string()));
        self.symlinks.lock().unwrap_or_else(|p| p.into_inner()).pop_front().unwrap_or(SymlinkChoice::Cancel)
    }

    fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool {
        self.record(PromptRecord::HostKey(prompt.clone()));
        self.host_keys.lock().unwrap_or_else(|p| p.into_inner()).pop_front().unwrap_or(false)
    }

    fn owner_thread(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_prompter_replays_then_refuses() {
        let p = ScriptedPrompter::new();
        p.push_confirm(true).push_conflict(ConflictDecision::for_all(ConflictChoice::Duplicate));
        assert!(p.confirm("t", "first?"));
        assert!(!p.confirm("t", "second?"));
        let req = ConflictRequest {
            source: EntryDetails { path: "a".into(), size: 1, mtime: None, is_dir: false },
            destination: EntryDetails { path: "b".into(), size: 2, mtime: None, is_dir: false },
            allow_apply_to_all: true,
        };
        assert_eq!(p.confirm_conflict(&req), ConflictDecision::for_all(ConflictChoice::Duplicate));
        assert_eq!(p.confirm_conflict(&req).choice, ConflictChoice::Cancel);
        assert_eq!(p.records().len(), 4);
    }

    #[test]
    fn describe_mentions_size_or_directory() {
        let f = EntryDetails { path: "/a".into(), size: 2048, mtime: None, is_dir: false };
        assert!(describe(&f).contains("2.00 KiB"));
        let d = EntryDetails { path: "/d".into(), size: 0, mtime: Some(0), is_dir: true };
        assert!(describe(&d).contains("directory"));
    }
}
