//! Error taxonomy for the session & transfer engine.
//!
//! Every fallible engine operation returns [`EngineError`]. The variants map
//! directly onto the error taxonomy table of the design spec: callers match on
//! variant to decide whether to retry, hand off to the Reconnection Manager, or
//! surface the failure to the user.

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::oneshot::error::RecvError;

/// Errors that can occur anywhere in the session & transfer engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Credential mismatch or auth method rejected by the remote host.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The user cancelled an in-progress authentication request.
    #[error("authentication cancelled by user")]
    AuthCancelled,

    /// Waiting for a user response to an `ssh:auth-request` exceeded the timeout.
    #[error("authentication request timed out")]
    AuthTimeout,

    /// The known-hosts cache detected a fingerprint change that was not approved.
    #[error("host key changed for {host}:{port} (was {previous})")]
    HostKeyChanged {
        host: String,
        port: u16,
        previous: String,
    },

    /// A transient network condition. The caller should hand this to the
    /// Reconnection Manager rather than tear down the owning `PooledClient`.
    #[error("transient I/O error: {0}")]
    TransientIO(String),

    /// A malformed SSH/SFTP exchange. Fatal for the owning session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A transfer failed an integrity check (size or checksum mismatch).
    #[error("transfer integrity check failed: {0}")]
    TransferIntegrity(String),

    /// The memory pool could not satisfy an allocation even after reclamation.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// An operation was rejected synchronously because its arguments are unsafe
    /// or nonsensical (e.g. deleting the root path).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An internal precondition was violated. Never propagates to sibling
    /// sessions; only fails the originating operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// The requested connection, session, or transfer id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation timed out waiting on a channel, lock, or remote reply.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The underlying SSH channel or stream was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Error surfaced by the `russh` transport.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Error surfaced by the `russh-sftp` client.
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    /// Underlying OS I/O error (local file access, socket setup).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to deliver a value through an internal channel; the receiver
    /// has gone away.
    #[error("internal channel closed: {0}")]
    ChannelSend(String),

    /// Failed to receive a value through an internal oneshot channel.
    #[error("internal channel closed: {0}")]
    ChannelRecv(#[from] RecvError),

    /// Catalog/journal (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl<T> From<SendError<T>> for EngineError {
    fn from(err: SendError<T>) -> Self {
        EngineError::ChannelSend(err.to_string())
    }
}

impl EngineError {
    /// Classifies a raw error message the way the Auth Orchestrator does: a
    /// message containing one of the known auth-failure substrings (and not
    /// a cancellation) is an [`EngineError::AuthFailure`]; anything else is
    /// [`EngineError::TransientIO`].
    pub fn classify_auth_error(message: &str) -> EngineError {
        let lower = message.to_ascii_lowercase();
        const AUTH_MARKERS: &[&str] = &[
            "authentication",
            "auth fail",
            "permission denied",
            "publickey",
            "password",
            "keyboard-interactive",
        ];
        let is_cancel = lower.contains("cancel");
        if !is_cancel && AUTH_MARKERS.iter().any(|marker| lower.contains(marker)) {
            EngineError::AuthFailure(message.to_string())
        } else {
            EngineError::TransientIO(message.to_string())
        }
    }

    /// True if this error should be handed to the Reconnection Manager rather
    /// than failing the requesting acquire outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIO(_))
    }

    /// True if a chunk-transfer failure is worth retrying with backoff rather
    /// than failing the transfer outright: transport hiccups and I/O errors,
    /// not integrity failures or rejected arguments.
    pub fn is_retryable_transfer_error(&self) -> bool {
        matches!(
            self,
            EngineError::TransientIO(_)
                | EngineError::Io(_)
                | EngineError::Russh(_)
                | EngineError::Sftp(_)
                | EngineError::Protocol(_)
                | EngineError::Timeout(_)
                | EngineError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_password_rejection_as_auth_failure() {
        let err = EngineError::classify_auth_error("Permission denied (publickey,password).");
        assert!(matches!(err, EngineError::AuthFailure(_)));
    }

    #[test]
    fn classifies_cancelled_auth_as_transient() {
        let err = EngineError::classify_auth_error("operation cancelled by user: authentication");
        assert!(matches!(err, EngineError::TransientIO(_)));
    }

    #[test]
    fn classifies_connection_reset_as_transient() {
        let err = EngineError::classify_auth_error("connection reset by peer");
        assert!(matches!(err, EngineError::TransientIO(_)));
    }

    #[test]
    fn classifies_keyboard_interactive_case_insensitively() {
        let err = EngineError::classify_auth_error("KEYBOARD-INTERACTIVE failure from server");
        assert!(matches!(err, EngineError::AuthFailure(_)));
    }

    #[test]
    fn transient_errors_are_retryable_but_integrity_failures_are_not() {
        assert!(EngineError::TransientIO("reset".to_string()).is_retryable_transfer_error());
        assert!(EngineError::ConnectionClosed.is_retryable_transfer_error());
        assert!(!EngineError::TransferIntegrity("checksum mismatch".to_string())
            .is_retryable_transfer_error());
        assert!(!EngineError::InvalidOperation("bad path".to_string()).is_retryable_transfer_error());
    }
}
