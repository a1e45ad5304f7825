use serde::Serialize;

/// What the transport underneath the engine can do.
///
/// Computed once with [`CapabilityProfile::detect`] before any upload starts
/// and never mutated afterwards. The planner and encoder branch on these flags
/// only; nothing re-probes the environment mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityProfile {
    /// Byte ranges of a file can be sent as separate requests
    pub can_slice_chunks: bool,
    /// Arbitrary binary payloads can be sent as a request body
    pub can_send_binary: bool,
    /// Structured multipart forms can be built by the transport
    pub can_use_multipart: bool,
    /// Upload progress is observable while a request is in flight
    pub can_report_progress: bool,
    /// File bytes cannot be attached to a structured form part
    pub blob_in_multipart_broken: bool,
}

impl CapabilityProfile {
    /// Profile of the reqwest/hyper transport this crate ships with.
    ///
    /// Every capability is available: request bodies are streams we control,
    /// so slicing, binary bodies and byte-level progress all come for free.
    pub fn detect() -> Self {
        Self {
            can_slice_chunks: true,
            can_send_binary: true,
            can_use_multipart: true,
            can_report_progress: true,
            blob_in_multipart_broken: false,
        }
    }

    pub fn without_chunking(mut self) -> Self {
        self.can_slice_chunks = false;
        self
    }

    pub fn without_multipart(mut self) -> Self {
        self.can_use_multipart = false;
        self
    }

    pub fn without_binary(mut self) -> Self {
        self.can_send_binary = false;
        self
    }

    pub fn without_progress(mut self) -> Self {
        self.can_report_progress = false;
        self
    }

    /// Force the hand-framed multipart path
    pub fn with_broken_form_blobs(mut self) -> Self {
        self.blob_in_multipart_broken = true;
        self
    }

    /// Whether file bytes can travel inside a structured form
    pub fn supports_structured_multipart(&self) -> bool {
        self.can_use_multipart && !self.blob_in_multipart_broken
    }
}

impl Default for CapabilityProfile {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reports_full_transport() {
        let profile = CapabilityProfile::detect();
        assert!(profile.can_slice_chunks);
        assert!(profile.can_send_binary);
        assert!(profile.supports_structured_multipart());
        assert!(profile.can_report_progress);
    }

    #[test]
    fn test_restrictions_compose() {
        let profile = CapabilityProfile::detect()
            .with_broken_form_blobs()
            .without_chunking();

        assert!(profile.can_use_multipart);
        assert!(!profile.supports_structured_multipart());
        assert!(!profile.can_slice_chunks);
        assert!(profile.can_send_binary);
    }
}
