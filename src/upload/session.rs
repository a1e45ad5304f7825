use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capability::CapabilityProfile;
use super::encoder::{encode, EncodedRequest, RequestBody};
use super::error::{ChunkUploadError, Result};
use super::events::{ChunkUploaded, EventSink, FileUploaded, UploadError, UploadProgress};
use super::file::FileHandle;
use super::planner::ChunkPlan;
use super::progress::ProgressReporter;
use super::state::{TransferState, TransferStatus};
use crate::config::UploadConfig;

// Granularity of in-flight progress reports
const PROGRESS_PIECE: usize = 64 * 1024;

/// How one request ended
enum Outcome {
    Response { status: u16, body: String },
    Failed(ChunkUploadError),
    Stopped,
}

/// What the state machine does after a classified response
enum Step {
    Send(usize),
    Finish,
}

/// Drives one file through its chunk plan, one request at a time.
///
/// The cancellation token is checked at the top of every transition and
/// before every emitted event, so once it fires the sink hears nothing more.
pub struct TransportSession<'a> {
    client: &'a Client,
    profile: CapabilityProfile,
    config: &'a UploadConfig,
    url: &'a str,
    file: &'a FileHandle,
    sink: &'a dyn EventSink,
    cancel: CancellationToken,
    plan: ChunkPlan,
    progress: ProgressReporter,
    state: TransferState,
}

impl<'a> TransportSession<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a Client,
        profile: CapabilityProfile,
        plan: ChunkPlan,
        config: &'a UploadConfig,
        url: &'a str,
        file: &'a FileHandle,
        sink: &'a dyn EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            profile,
            config,
            url,
            file,
            sink,
            cancel,
            plan,
            progress: ProgressReporter::new(file.size()),
            state: TransferState::new(file.id().clone()),
        }
    }

    /// Run the transfer to a terminal state
    pub async fn run(mut self) -> TransferState {
        info!(
            "Uploading {} ({} bytes, {} chunk(s)) to {}",
            self.file.upload_name(),
            self.file.size(),
            self.plan.total_chunks(),
            self.url
        );

        let mut index = 0;
        loop {
            if self.stopped() {
                break;
            }

            match self.send_chunk(index).await {
                Outcome::Stopped => {
                    self.stopped();
                    break;
                }
                Outcome::Failed(err) => {
                    self.fail(err);
                    break;
                }
                Outcome::Response { status, body } => {
                    // A response racing a cancel is dropped
                    if self.stopped() {
                        break;
                    }
                    match self.on_response(index, status, body) {
                        Step::Send(next) => index = next,
                        Step::Finish => break,
                    }
                }
            }
        }

        info!(
            "Upload of {} finished: {} ({} of {} bytes)",
            self.file.upload_name(),
            self.state.status,
            self.state.bytes_loaded,
            self.file.size()
        );
        self.state
    }

    /// Mark the transfer stopped if the token fired
    fn stopped(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.state.status = TransferStatus::Stopped;
            true
        } else {
            false
        }
    }

    async fn send_chunk(&mut self, index: usize) -> Outcome {
        let Some(range) = self.plan.range_of(index) else {
            return Outcome::Failed(ChunkUploadError::Config(format!(
                "chunk {} is outside a plan of {} chunk(s)",
                index,
                self.plan.total_chunks()
            )));
        };

        self.state.status = TransferStatus::Uploading;
        self.state.current_chunk = index;

        let cancel = self.cancel.clone();
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Stopped,
            read = self.file.read_range(range) => match read {
                Ok(data) => data,
                Err(e) => return Outcome::Failed(e),
            },
        };

        let encoded = encode(
            data,
            index,
            &self.plan,
            self.file,
            self.config,
            &self.profile,
        );
        debug!(
            "Sending chunk {}/{} of {} ({} bytes, {:?})",
            index + 1,
            self.plan.total_chunks(),
            self.file.upload_name(),
            encoded.chunk_len(),
            encoded.strategy()
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let progress_tx = self.profile.can_report_progress.then_some(progress_tx);

        let request = match self.build_request(&encoded, progress_tx) {
            Ok(request) => request,
            Err(e) => return Outcome::Failed(e),
        };

        let send = request.send();
        tokio::pin!(send);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Stopped,
                Some(sent) = progress_rx.recv() => self.report_in_flight(&encoded, sent),
                result = &mut send => break result,
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let status = response.status().as_u16();

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Stopped,
            text = response.text() => text,
        };

        match text {
            Ok(body) => Outcome::Response { status, body },
            // The status alone classifies an error response
            Err(_) if status >= 400 => Outcome::Response {
                status,
                body: String::new(),
            },
            Err(e) => Outcome::Failed(e.into()),
        }
    }

    fn build_request(
        &self,
        encoded: &EncodedRequest,
        progress: Option<mpsc::UnboundedSender<u64>>,
    ) -> Result<RequestBuilder> {
        let mut builder = self.client.post(self.url);

        if !encoded.query.is_empty() {
            builder = builder.query(&encoded.query);
        }

        for (name, value) in &encoded.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let builder = match &encoded.body {
            RequestBody::Form { fields, file } => {
                let mut form = Form::new();
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                let part = Part::stream_with_length(
                    progress_body(file.data.clone(), progress),
                    file.data.len() as u64,
                )
                .file_name(file.file_name.clone())
                .mime_str(file.content_type)?;

                builder.multipart(form.part(file.field_name.clone(), part))
            }
            RequestBody::Framed { payload, .. } => builder
                .header(CONTENT_LENGTH, payload.len())
                .body(progress_body(payload.clone(), progress)),
            RequestBody::Raw(data) => builder
                .header(CONTENT_LENGTH, data.len())
                .body(progress_body(data.clone(), progress)),
        };

        Ok(builder)
    }

    fn report_in_flight(&mut self, encoded: &EncodedRequest, wire_sent: u64) {
        let file_sent = encoded.file_bytes_sent(wire_sent);
        if let Some(loaded) = self.progress.in_flight(file_sent) {
            self.state.bytes_loaded = loaded;
            self.emit_progress();
        }
    }

    /// Classify a response and pick the next transition
    fn on_response(&mut self, index: usize, status: u16, body: String) -> Step {
        if status >= 400 {
            self.fail(ChunkUploadError::HttpStatus {
                status,
                chunk: index,
            });
            return Step::Finish;
        }

        self.state.status = TransferStatus::ChunkSucceeded;
        let chunk_len = self.plan.range_of(index).map(|r| r.len()).unwrap_or(0);

        if self.plan.is_chunked() {
            let mut event = ChunkUploaded {
                file_id: self.file.id().clone(),
                chunk_index: index,
                total_chunks: self.plan.total_chunks(),
                response_body: body.clone(),
                status,
                cancelled: false,
            };
            self.sink.on_chunk_uploaded(&mut event);

            if self.stopped() {
                return Step::Finish;
            }
            if event.cancelled {
                info!(
                    "Chunk handler cancelled {} after chunk {}",
                    self.file.upload_name(),
                    index
                );
                self.state.status = TransferStatus::Failed;
                self.state.last_error = Some(format!("cancelled after chunk {}", index));
                return Step::Finish;
            }
        }

        self.state.bytes_loaded = self.progress.chunk_completed(&self.plan, index, chunk_len);
        self.emit_progress();
        if self.stopped() {
            return Step::Finish;
        }

        if self.plan.is_last(index) {
            self.state.status = TransferStatus::Done;
            self.sink.on_done(&FileUploaded {
                file_id: self.file.id().clone(),
                response_body: body,
                status,
            });
            return Step::Finish;
        }

        Step::Send(index + 1)
    }

    fn emit_progress(&mut self) {
        if self.stopped() {
            return;
        }
        self.sink.on_progress(&UploadProgress {
            file_id: self.file.id().clone(),
            bytes_loaded: self.state.bytes_loaded,
            file_size: self.file.size(),
        });
    }

    /// Terminal failure, reported once. A cancelled transfer stops silently.
    fn fail(&mut self, err: ChunkUploadError) {
        if self.stopped() {
            return;
        }

        warn!(
            "Upload of {} failed on chunk {}: {}",
            self.file.upload_name(),
            self.state.current_chunk,
            err
        );
        self.state.status = TransferStatus::Failed;
        self.state.last_error = Some(err.to_string());

        self.sink.on_error(&UploadError {
            file_id: self.file.id().clone(),
            kind: err.kind(),
            status: err.status(),
            message: err.to_string(),
        });
    }
}

/// Request body that reports how many bytes the transport has pulled
fn progress_body(data: Bytes, progress: Option<mpsc::UnboundedSender<u64>>) -> Body {
    let Some(tx) = progress else {
        return Body::from(data);
    };

    let mut sent = 0u64;
    let stream = futures::stream::iter(split_pieces(&data)).map(move |piece| {
        sent += piece.len() as u64;
        let _ = tx.send(sent);
        Ok::<_, std::io::Error>(piece)
    });

    Body::wrap_stream(stream)
}

fn split_pieces(data: &Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(PROGRESS_PIECE)
        .map(|start| data.slice(start..(start + PROGRESS_PIECE).min(data.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pieces_covers_payload() {
        let data = Bytes::from(vec![1u8; PROGRESS_PIECE * 2 + 10]);
        let pieces = split_pieces(&data);

        let lens: Vec<_> = pieces.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![PROGRESS_PIECE, PROGRESS_PIECE, 10]);
        assert!(split_pieces(&Bytes::new()).is_empty());
    }
}
