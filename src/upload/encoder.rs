use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use uuid::Uuid;

use super::capability::CapabilityProfile;
use super::file::FileHandle;
use super::mime::detect_content_type;
use super::planner::ChunkPlan;
use crate::config::UploadConfig;

const CRLF: &str = "\r\n";
const DASHDASH: &str = "--";

/// How a request body was put together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Form built by the HTTP client from named parts
    StructuredMultipart,
    /// multipart/form-data assembled byte by byte around the chunk
    FramedMultipart,
    /// Chunk bytes only; metadata moves to the query string
    RawStream,
}

/// The file part of a structured form
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field_name: String,
    pub file_name: String,
    pub content_type: &'static str,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Form {
        fields: IndexMap<String, String>,
        file: FilePart,
    },
    /// `leading` and `trailing` are the framing bytes around the chunk
    Framed {
        payload: Bytes,
        boundary: String,
        leading: usize,
        trailing: usize,
    },
    Raw(Bytes),
}

/// One chunk ready for the wire
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub body: RequestBody,
    pub headers: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
}

impl EncodedRequest {
    pub fn strategy(&self) -> Strategy {
        match self.body {
            RequestBody::Form { .. } => Strategy::StructuredMultipart,
            RequestBody::Framed { .. } => Strategy::FramedMultipart,
            RequestBody::Raw(_) => Strategy::RawStream,
        }
    }

    /// Length of the file data carried by this request
    pub fn chunk_len(&self) -> u64 {
        match &self.body {
            RequestBody::Form { file, .. } => file.data.len() as u64,
            RequestBody::Framed {
                payload,
                leading,
                trailing,
                ..
            } => (payload.len() - leading - trailing) as u64,
            RequestBody::Raw(data) => data.len() as u64,
        }
    }

    /// Translate bytes handed to the transport into file bytes.
    ///
    /// For a structured form only the file part stream is counted, so the
    /// value passes through. For the framed body the leading framing is
    /// skipped and the trailing framing is cut off.
    pub fn file_bytes_sent(&self, wire_sent: u64) -> u64 {
        match &self.body {
            RequestBody::Framed { leading, .. } => wire_sent
                .saturating_sub(*leading as u64)
                .min(self.chunk_len()),
            _ => wire_sent.min(self.chunk_len()),
        }
    }
}

/// Encode one chunk according to the capability profile.
///
/// Strategy, first match wins:
/// 1. multipart requested and the transport builds forms with file parts
/// 2. multipart requested and binary bodies can be sent: hand-framed body
/// 3. raw octet stream with the fields in the query string
pub fn encode(
    chunk: Bytes,
    chunk_index: usize,
    plan: &ChunkPlan,
    file: &FileHandle,
    config: &UploadConfig,
    profile: &CapabilityProfile,
) -> EncodedRequest {
    let fields = request_fields(chunk_index, plan, file, config);
    let file_name = file.upload_name().to_string();
    let content_type = detect_content_type(&file_name);

    if config.multipart && profile.supports_structured_multipart() {
        let mut headers = config.headers.clone();
        remove_header(&mut headers, "content-type");

        return EncodedRequest {
            body: RequestBody::Form {
                fields,
                file: FilePart {
                    field_name: config.file_field_name.clone(),
                    file_name,
                    content_type,
                    data: chunk,
                },
            },
            headers,
            query: IndexMap::new(),
        };
    }

    if config.multipart && profile.can_send_binary {
        let boundary = format!("----chunkupboundary{}", Uuid::new_v4().simple());
        let (payload, leading, trailing) = frame_multipart(
            &boundary,
            &fields,
            &config.file_field_name,
            &file_name,
            content_type,
            &chunk,
        );

        let mut headers = config.headers.clone();
        set_header(
            &mut headers,
            "Content-Type",
            format!("multipart/form-data; boundary={}", boundary),
        );

        return EncodedRequest {
            body: RequestBody::Framed {
                payload,
                boundary,
                leading,
                trailing,
            },
            headers,
            query: IndexMap::new(),
        };
    }

    let mut headers = IndexMap::new();
    headers.insert(
        "Content-Type".to_string(),
        "application/octet-stream".to_string(),
    );
    for (name, value) in &config.headers {
        set_header(&mut headers, name, value.clone());
    }

    EncodedRequest {
        body: RequestBody::Raw(chunk),
        headers,
        query: fields,
    }
}

/// `name`, chunk position when chunked, then configured fields
fn request_fields(
    chunk_index: usize,
    plan: &ChunkPlan,
    file: &FileHandle,
    config: &UploadConfig,
) -> IndexMap<String, String> {
    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), file.upload_name().to_string());

    if plan.is_chunked() {
        fields.insert("chunk".to_string(), chunk_index.to_string());
        fields.insert("chunks".to_string(), plan.total_chunks().to_string());
    }

    for (name, value) in config
        .multipart_fixed_fields
        .iter()
        .chain(config.multipart_params_extra.iter())
    {
        fields.insert(name.clone(), value.clone());
    }

    fields
}

/// Build an RFC 2388 body around `chunk`, returning (payload, leading, trailing)
fn frame_multipart(
    boundary: &str,
    fields: &IndexMap<String, String>,
    file_field: &str,
    file_name: &str,
    content_type: &str,
    chunk: &[u8],
) -> (Bytes, usize, usize) {
    let mut head = String::new();
    for (name, value) in fields {
        head.push_str(&format!(
            "{DASHDASH}{boundary}{CRLF}Content-Disposition: form-data; name=\"{}\"{CRLF}{CRLF}{value}{CRLF}",
            escape_quoted(name)
        ));
    }
    head.push_str(&format!(
        "{DASHDASH}{boundary}{CRLF}Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}\
         Content-Type: {content_type}{CRLF}{CRLF}",
        escape_quoted(file_field),
        escape_quoted(file_name)
    ));
    let tail = format!("{CRLF}{DASHDASH}{boundary}{DASHDASH}{CRLF}");

    let mut payload = BytesMut::with_capacity(head.len() + chunk.len() + tail.len());
    payload.put_slice(head.as_bytes());
    payload.put_slice(chunk);
    payload.put_slice(tail.as_bytes());

    (payload.freeze(), head.len(), tail.len())
}

/// Percent-encode the characters that would break a quoted header parameter
fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn remove_header(headers: &mut IndexMap<String, String>, name: &str) {
    headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
}

fn set_header(headers: &mut IndexMap<String, String>, name: &str, value: String) {
    remove_header(headers, name);
    headers.insert(name.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::planner::plan;

    fn chunked_setup() -> (FileHandle, ChunkPlan, UploadConfig) {
        let file = FileHandle::from_bytes("report.pdf", vec![b'x'; 1000]);
        let profile = CapabilityProfile::detect();
        let plan = plan(file.size(), 300, &profile);
        let mut config = UploadConfig::default();
        config.chunk_size = 300;
        config
            .multipart_fixed_fields
            .insert("album".to_string(), "trip".to_string());
        (file, plan, config)
    }

    #[test]
    fn test_structured_form_when_supported() {
        let (file, plan, config) = chunked_setup();
        let req = encode(
            Bytes::from_static(b"abc"),
            1,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect(),
        );

        assert_eq!(req.strategy(), Strategy::StructuredMultipart);
        assert!(req.query.is_empty());
        match &req.body {
            RequestBody::Form { fields, file } => {
                let keys: Vec<_> = fields.keys().map(String::as_str).collect();
                assert_eq!(keys, vec!["name", "chunk", "chunks", "album"]);
                assert_eq!(fields["chunk"], "1");
                assert_eq!(fields["chunks"], "4");
                assert_eq!(file.field_name, "file");
                assert_eq!(file.file_name, "report.pdf");
                assert_eq!(file.content_type, "application/pdf");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_framed_body_when_form_blobs_broken() {
        let (file, plan, config) = chunked_setup();
        let file = file.with_target_name("final \"name\".pdf");
        let profile = CapabilityProfile::detect().with_broken_form_blobs();

        let req = encode(Bytes::from_static(b"CHUNK"), 0, &plan, &file, &config, &profile);
        assert_eq!(req.strategy(), Strategy::FramedMultipart);

        let RequestBody::Framed {
            payload,
            boundary,
            leading,
            trailing,
        } = &req.body
        else {
            panic!("expected framed body");
        };

        assert_eq!(
            req.headers["Content-Type"],
            format!("multipart/form-data; boundary={boundary}")
        );
        assert_eq!(&payload[*leading..payload.len() - trailing], b"CHUNK");

        let text = String::from_utf8_lossy(payload);
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"name\"\r\n\r\nfinal \"name\".pdf\r\n"));
        assert!(text.contains("name=\"album\"\r\n\r\ntrip\r\n"));
        assert!(text.contains("filename=\"final %22name%22.pdf\""));
        assert!(text.ends_with(&format!("\r\n--{boundary}--\r\n")));
    }

    #[test]
    fn test_raw_stream_fallback_has_no_framing() {
        let (file, plan, config) = chunked_setup();
        let profile = CapabilityProfile::detect()
            .without_multipart()
            .without_binary();

        let req = encode(Bytes::from_static(b"RAW"), 3, &plan, &file, &config, &profile);

        assert_eq!(req.strategy(), Strategy::RawStream);
        assert_eq!(req.headers["Content-Type"], "application/octet-stream");
        assert_eq!(req.query["name"], "report.pdf");
        assert_eq!(req.query["chunk"], "3");
        assert_eq!(req.query["chunks"], "4");
        assert_eq!(req.query["album"], "trip");
        match &req.body {
            RequestBody::Raw(data) => assert_eq!(&data[..], b"RAW"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_raw_stream_when_multipart_disabled() {
        let file = FileHandle::from_bytes("a.bin", vec![0u8; 10]);
        let plan = plan(10, 0, &CapabilityProfile::detect());
        let mut config = UploadConfig::default();
        config.multipart = false;

        let req = encode(
            Bytes::from(vec![0u8; 10]),
            0,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect(),
        );
        assert_eq!(req.strategy(), Strategy::RawStream);
        // Unchunked requests carry only the name
        let keys: Vec<_> = req.query.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name"]);
    }

    #[test]
    fn test_extra_params_override_fixed_fields() {
        let (file, plan, mut config) = chunked_setup();
        config
            .multipart_params_extra
            .insert("album".to_string(), "override".to_string());
        config
            .multipart_params_extra
            .insert("name".to_string(), "custom.pdf".to_string());

        let req = encode(
            Bytes::new(),
            0,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect().without_multipart().without_binary(),
        );
        assert_eq!(req.query["album"], "override");
        assert_eq!(req.query["name"], "custom.pdf");
        assert_eq!(req.query.get_index_of("name"), Some(0));
    }

    #[test]
    fn test_headers_per_strategy() {
        let (file, plan, mut config) = chunked_setup();
        config
            .headers
            .insert("content-type".to_string(), "text/plain".to_string());
        config
            .headers
            .insert("X-Token".to_string(), "secret".to_string());

        let form = encode(Bytes::new(), 0, &plan, &file, &config, &CapabilityProfile::detect());
        assert_eq!(form.headers.len(), 1);
        assert_eq!(form.headers["X-Token"], "secret");

        let framed = encode(
            Bytes::new(),
            0,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect().with_broken_form_blobs(),
        );
        assert!(framed.headers["Content-Type"].starts_with("multipart/form-data"));
        assert!(!framed.headers.contains_key("content-type"));

        let raw = encode(
            Bytes::new(),
            0,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect().without_multipart().without_binary(),
        );
        assert_eq!(raw.headers["content-type"], "text/plain");
        assert_eq!(raw.headers.len(), 2);
    }

    #[test]
    fn test_file_bytes_sent_skips_framing() {
        let (file, plan, config) = chunked_setup();
        let req = encode(
            Bytes::from(vec![7u8; 100]),
            0,
            &plan,
            &file,
            &config,
            &CapabilityProfile::detect().with_broken_form_blobs(),
        );
        let RequestBody::Framed {
            leading, trailing, ..
        } = req.body.clone()
        else {
            panic!("expected framed body");
        };

        assert_eq!(req.chunk_len(), 100);
        assert_eq!(req.file_bytes_sent(0), 0);
        assert_eq!(req.file_bytes_sent(leading as u64), 0);
        assert_eq!(req.file_bytes_sent(leading as u64 + 40), 40);
        assert_eq!(req.file_bytes_sent((leading + 100 + trailing) as u64), 100);
    }
}
