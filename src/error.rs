//! Error taxonomy shared by the codec, server, client and operators

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Socket I/O failed; the connection must be dropped.
    #[error("transport error ({context}): {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Malformed frame, bad JSON, or an unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    /// The peer answered with a non-zero result code.
    #[error("remote failure (code {code}): {message}")]
    Remote { code: i32, message: String },
}

impl SyncError {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        SyncError::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether the connection that produced this error can still be used.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Protocol(_) | SyncError::Auth(_)
        )
    }
}
