pub mod cancel;
pub mod capability;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod file;
pub mod mime;
pub mod planner;
pub mod progress;
pub mod session;
pub mod state;

pub use capability::CapabilityProfile;
pub use encoder::{encode, EncodedRequest, RequestBody, Strategy};
pub use engine::{ClientOptions, Uploader};
pub use error::{ChunkUploadError, ErrorKind};
pub use events::{
    ChannelSink, ChunkUploaded, EventSink, FileUploaded, NullSink, UploadError, UploadEvent,
    UploadProgress,
};
pub use file::{FileHandle, FileId, FileRegistry};
pub use planner::{plan, ChunkPlan, ChunkRange};
pub use progress::ProgressReporter;
pub use state::{TransferState, TransferStatus};
