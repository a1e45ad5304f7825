//! Chunked HTTP upload engine.
//!
//! Splits a file into byte ranges, encodes each range as a multipart form,
//! a hand-framed multipart body or a raw octet stream depending on what the
//! transport supports, and sends the ranges one at a time while reporting
//! progress to an [`EventSink`]. Transfers can be cancelled by file id.

pub mod config;
pub mod upload;

pub use config::UploadConfig;
pub use upload::{
    CapabilityProfile, ChannelSink, ChunkUploaded, ClientOptions, EventSink, FileHandle, FileId,
    FileRegistry, FileUploaded, TransferState, TransferStatus, UploadError, UploadEvent,
    UploadProgress, Uploader,
};
