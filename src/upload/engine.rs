use std::time::Duration;
use tracing::warn;

use super::cancel::CancellationRegistry;
use super::capability::CapabilityProfile;
use super::error::{ChunkUploadError, Result};
use super::events::{EventSink, UploadError};
use super::file::{FileHandle, FileId};
use super::planner::plan;
use super::session::TransportSession;
use super::state::{TransferState, TransferStatus};
use crate::config::UploadConfig;

/// Settings of the HTTP client shared by every session
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whole-request timeout; `None` leaves timing to the transport
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: format!("chunkup/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Entry point of the upload engine.
///
/// Holds one HTTP client, the capability profile detected at startup and
/// the cancellation handles of running transfers. Share it behind an `Arc`
/// to upload several files concurrently.
pub struct Uploader {
    client: reqwest::Client,
    profile: CapabilityProfile,
    cancellations: CancellationRegistry,
}

impl Uploader {
    pub fn new(profile: CapabilityProfile) -> Result<Self> {
        Self::with_options(profile, ClientOptions::default())
    }

    pub fn with_options(profile: CapabilityProfile, options: ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(options.user_agent);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            profile,
            cancellations: CancellationRegistry::new(),
        })
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    /// Upload `file` to `url`, reporting to `sink`.
    ///
    /// Never fails: every outcome is a terminal [`TransferState`], and any
    /// failure was already reported once through `sink.on_error`. An invalid
    /// `config` is rejected before anything is sent.
    pub async fn upload_file(
        &self,
        file: &FileHandle,
        url: &str,
        config: &UploadConfig,
        sink: &dyn EventSink,
    ) -> TransferState {
        if let Err(e) = config.validate() {
            return reject(file, sink, ChunkUploadError::Config(format!("{:#}", e)));
        }

        let Some(cancel) = self.cancellations.register(file.id()) else {
            return reject(
                file,
                sink,
                ChunkUploadError::Config(format!("{} is already uploading", file.id())),
            );
        };

        let _active = ActiveTransfer {
            registry: &self.cancellations,
            id: file.id(),
        };

        let plan = plan(file.size(), config.chunk_size, &self.profile);
        let session = TransportSession::new(
            &self.client,
            self.profile,
            plan,
            config,
            url,
            file,
            sink,
            cancel,
        );
        session.run().await
    }

    /// Stop the transfer of `id`. Returns whether one was running.
    pub fn cancel(&self, id: &FileId) -> bool {
        self.cancellations.cancel(id)
    }

    /// Stop every running transfer, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        self.cancellations.cancel_all()
    }

    pub fn is_active(&self, id: &FileId) -> bool {
        self.cancellations.is_active(id)
    }
}

/// Releases the cancellation slot even when the upload future is dropped
struct ActiveTransfer<'a> {
    registry: &'a CancellationRegistry,
    id: &'a FileId,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

fn reject(file: &FileHandle, sink: &dyn EventSink, err: ChunkUploadError) -> TransferState {
    warn!("Refusing upload of {}: {}", file.upload_name(), err);

    sink.on_error(&UploadError {
        file_id: file.id().clone(),
        kind: err.kind(),
        status: None,
        message: err.to_string(),
    });

    let mut state = TransferState::new(file.id().clone());
    state.status = TransferStatus::Failed;
    state.last_error = Some(err.to_string());
    state
}
