use serde::Serialize;
use std::fmt;

use super::file::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Queued,
    Uploading,
    ChunkSucceeded,
    Done,
    Failed,
    Stopped,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::ChunkSucceeded => "chunk succeeded",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-file transfer record, handed back once the transfer is terminal
#[derive(Debug, Clone, Serialize)]
pub struct TransferState {
    pub file_id: FileId,
    pub status: TransferStatus,
    pub current_chunk: usize,
    pub bytes_loaded: u64,
    pub last_error: Option<String>,
}

impl TransferState {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            status: TransferStatus::Queued,
            current_chunk: 0,
            bytes_loaded: 0,
            last_error: None,
        }
    }
}
