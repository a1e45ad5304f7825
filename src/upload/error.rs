use serde::Serialize;
use thiserror::Error;

/// Category carried by an [`UploadError`](super::events::UploadError) event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Server answered with a status >= 400
    HttpError,
    /// The request never produced a response (connect, reset, body read)
    TransportError,
    /// Reading the local file failed
    IoError,
    /// The engine refused to start or continue the transfer
    InvalidRequest,
}

/// Errors that can occur while moving a chunk to the server
#[derive(Error, Debug)]
pub enum ChunkUploadError {
    /// Local file could not be read
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Server rejected the chunk
    #[error("HTTP error {status} for chunk {chunk}")]
    HttpStatus { status: u16, chunk: usize },

    /// Network or protocol failure below HTTP status level
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChunkUploadError {
    /// Create an IO error with the file it came from
    pub fn from_io_error(error: std::io::Error, path: &str) -> Self {
        Self::Io {
            path: path.to_string(),
            source: error,
        }
    }

    /// Map the error onto the event taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HttpStatus { .. } => ErrorKind::HttpError,
            Self::Io { .. } => ErrorKind::IoError,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Config(_) => ErrorKind::InvalidRequest,
        }
    }

    /// HTTP status, when the server produced one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::Io { path, source } => {
                format!(
                    "Cannot read {}: {}\n\nPossible solutions:\n  \
                     1. Check the file still exists: ls -la {}\n  \
                     2. Ensure you have read access to the file",
                    path, source, path
                )
            }
            Self::HttpStatus { status, chunk } => {
                let hint = match *status {
                    401 | 403 => "Check the credentials passed with --header",
                    404 => "Verify the upload URL path",
                    413 => "Lower --chunk-size so each request fits the server limit",
                    _ if *status >= 500 => "The server failed; retry later or use --retries",
                    _ => "Inspect the server logs for the rejected request",
                };
                format!(
                    "Server returned HTTP {} on chunk {}\n\nPossible solution:\n  {}",
                    status, chunk, hint
                )
            }
            Self::Transport(e) => {
                format!(
                    "Network error: {}\n\nPossible solutions:\n  \
                     1. Check that the server is reachable\n  \
                     2. Try again with --max-concurrent 1\n  \
                     3. Raise --timeout for slow links",
                    e
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ChunkUploadError>;
