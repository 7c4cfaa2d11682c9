/// Repository-wide structured errors for connection, planning and transfer
/// operations.
///
/// Every remote capability call, every planner step and every executor step
/// reports through this one enum so the retry layers can classify failures
/// without string matching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    // transient: retried by reconnect and per-file retry
    #[error("connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("remote session closed: {0}")]
    SessionClosed(String),
    #[error("transfer I/O error: {0}")]
    Io(String),

    // authentication / trust: never retried
    #[error(transparent)]
    AuthUnavailable(#[from] AuthUnavailable),
    #[error("authentication rejected by {addr} (tried: {attempted})")]
    AuthFailed { addr: String, attempted: String },
    #[error("host key for {host}:{port} ({algorithm}) was not trusted")]
    HostKeyRejected { host: String, port: u16, algorithm: String },

    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("remote path exists and is not a directory: {0}")]
    NotADirectory(String),

    #[error("cancelled")]
    Cancelled,

    // integrity: terminal for the file, destination copy removed
    #[error("size mismatch after transfer: {path} (expected {expected} bytes, found {actual})")]
    SizeMismatch { path: String, expected: u64, actual: u64 },
    #[error("hash mismatch after transfer: {path} (source {source_hash}, destination {dest_hash})")]
    HashMismatch { path: String, source_hash: String, dest_hash: String },
    #[error("timestamp mismatch after transfer: {path} (source {source_mtime}, destination {dest_mtime})")]
    TimestampMismatch { path: String, source_mtime: u64, dest_mtime: u64 },

    #[error("not connected")]
    NotConnected,
    #[error("operation not supported by remote: {0}")]
    Unsupported(String),
    #[error("local filesystem error: {0}")]
    Local(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// Coarse error taxonomy used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Authentication,
    NotFound,
    Permission,
    Cancelled,
    Integrity,
    Fatal,
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        use TransferError::*;
        match self {
            Connection { .. } | Timeout(_) | SessionClosed(_) | Io(_) => ErrorClass::Transient,
            AuthUnavailable(_) | AuthFailed { .. } | HostKeyRejected { .. } => {
                ErrorClass::Authentication
            }
            NotFound(_) => ErrorClass::NotFound,
            PermissionDenied(_) => ErrorClass::Permission,
            Cancelled => ErrorClass::Cancelled,
            SizeMismatch { .. } | HashMismatch { .. } | TimestampMismatch { .. } => {
                ErrorClass::Integrity
            }
            NotADirectory(_) | NotConnected | Unsupported(_) | Local(_) | OperationFailed(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Whether a fresh attempt (after reconnecting if needed) may succeed.
    /// Connection, timeout, socket, disposed-session and stream I/O errors are
    /// transient; authentication, not-found, permission and cancellation are not.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Map a std I/O error onto the taxonomy. `context` names the path or
    /// operation and is kept in the message.
    pub fn from_io(err: &std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => TransferError::NotFound(context.to_string()),
            ErrorKind::PermissionDenied => TransferError::PermissionDenied(context.to_string()),
            ErrorKind::TimedOut => TransferError::Timeout(format!("{context}: {err}")),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransferError::Connection {
                addr: context.to_string(),
                reason: err.to_string(),
            },
            _ => TransferError::Io(format!("{context}: {err}")),
        }
    }

    /// Same as [`TransferError::from_io`] but for failures on the local disk,
    /// where only missing files and permissions keep their own class.
    pub fn from_local_io(err: &std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => TransferError::NotFound(context.to_string()),
            ErrorKind::PermissionDenied => TransferError::PermissionDenied(context.to_string()),
            _ => TransferError::Io(format!("{context}: {err}")),
        }
    }
}

/// Every configured authentication method was unusable before any network
/// round-trip. Carries the reason for each method so the user can fix the
/// profile instead of seeing a bare "not connected".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUnavailable {
    pub reasons: Vec<(crate::profile::AuthMethodKind, String)>,
}

impl std::fmt::Display for AuthUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no usable authentication method")?;
        for (i, (method, reason)) in self.reasons.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{method}: {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AuthUnavailable {}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::AuthMethodKind;

    #[test]
    fn transient_classification() {
        assert!(TransferError::Timeout("read".into()).is_transient());
        assert!(TransferError::SessionClosed("gone".into()).is_transient());
        assert!(!TransferError::NotFound("/x".into()).is_transient());
        assert!(!TransferError::PermissionDenied("/x".into()).is_transient());
        assert!(!TransferError::Cancelled.is_transient());
        assert!(
            !TransferError::AuthFailed { addr: "h:22".into(), attempted: "password".into() }
                .is_transient()
        );
    }

    #[test]
    fn io_kinds_map_onto_taxonomy() {
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(TransferError::from_io(&e, "h"), TransferError::Connection { .. }));
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert!(matches!(TransferError::from_io(&e, "/a"), TransferError::NotFound(_)));
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(TransferError::from_io(&e, "x").class(), ErrorClass::Transient);
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(TransferError::from_local_io(&e, "/tmp/a"), TransferError::Io(_)));
    }

    #[test]
    fn auth_unavailable_lists_every_reason() {
        let err = AuthUnavailable {
            reasons: vec![
                (AuthMethodKind::Agent, "agent not running".into()),
                (AuthMethodKind::Password, "no password configured".into()),
            ],
        };
        let s = TransferError::from(err).to_string();
        assert!(s.contains("agent: agent not running"));
        assert!(s.contains("password: no password configured"));
    }
}
