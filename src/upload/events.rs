//! Outbound events and the sink they are delivered to.
//!
//! A session calls exactly one sink, in order, from its own task. Handlers
//! must not block; the [`ChannelSink`] hands events to another task instead.

use serde::Serialize;
use tokio::sync::mpsc;

use super::error::ErrorKind;
use super::file::FileId;

/// A chunk was accepted by the server.
///
/// Set `cancelled` to stop the file after this chunk; the transfer then ends
/// as `Failed` and no later chunk is sent.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkUploaded {
    pub file_id: FileId,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub response_body: String,
    pub status: u16,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub file_id: FileId,
    pub bytes_loaded: u64,
    pub file_size: u64,
}

/// Terminal success
#[derive(Debug, Clone, Serialize)]
pub struct FileUploaded {
    pub file_id: FileId,
    pub response_body: String,
    pub status: u16,
}

/// Terminal failure
#[derive(Debug, Clone, Serialize)]
pub struct UploadError {
    pub file_id: FileId,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

/// Receiver of session events. Every method defaults to a no-op.
pub trait EventSink: Send + Sync {
    fn on_chunk_uploaded(&self, _event: &mut ChunkUploaded) {}

    fn on_progress(&self, _event: &UploadProgress) {}

    fn on_done(&self, _event: &FileUploaded) {}

    fn on_error(&self, _event: &UploadError) {}
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

/// Any event, as carried by [`ChannelSink`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum UploadEvent {
    ChunkUploaded(ChunkUploaded),
    Progress(UploadProgress),
    FileUploaded(FileUploaded),
    Error(UploadError),
}

impl UploadEvent {
    pub fn file_id(&self) -> &FileId {
        match self {
            Self::ChunkUploaded(e) => &e.file_id,
            Self::Progress(e) => &e.file_id,
            Self::FileUploaded(e) => &e.file_id,
            Self::Error(e) => &e.file_id,
        }
    }
}

/// Forwards events into an unbounded channel.
///
/// Channel receivers cannot answer back, so this sink never cancels on
/// `ChunkUploaded`. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_chunk_uploaded(&self, event: &mut ChunkUploaded) {
        let _ = self.tx.send(UploadEvent::ChunkUploaded(event.clone()));
    }

    fn on_progress(&self, event: &UploadProgress) {
        let _ = self.tx.send(UploadEvent::Progress(event.clone()));
    }

    fn on_done(&self, event: &FileUploaded) {
        let _ = self.tx.send(UploadEvent::FileUploaded(event.clone()));
    }

    fn on_error(&self, event: &UploadError) {
        let _ = self.tx.send(UploadEvent::Error(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        let id = FileId::generate();

        sink.on_progress(&UploadProgress {
            file_id: id.clone(),
            bytes_loaded: 10,
            file_size: 20,
        });
        sink.on_done(&FileUploaded {
            file_id: id.clone(),
            response_body: "ok".to_string(),
            status: 200,
        });

        assert!(matches!(rx.try_recv().unwrap(), UploadEvent::Progress(p) if p.bytes_loaded == 10));
        let done = rx.try_recv().unwrap();
        assert_eq!(done.file_id(), &id);
        assert!(matches!(done, UploadEvent::FileUploaded(_)));
    }

    #[test]
    fn test_event_json_shape() {
        let event = UploadEvent::Error(UploadError {
            file_id: FileId::generate(),
            kind: ErrorKind::HttpError,
            status: Some(500),
            message: "HTTP error 500 for chunk 1".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "Error");
        assert_eq!(json["kind"], "HTTP_ERROR");
        assert_eq!(json["status"], 500);
    }
}
