use super::planner::ChunkPlan;

/// File-level progress counter.
///
/// `bytes_loaded` never decreases and never exceeds the file size, whatever
/// the transport reports about framing bytes or resent data.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    file_size: u64,
    loaded: u64,
    completed: u64,
}

impl ProgressReporter {
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            loaded: 0,
            completed: 0,
        }
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.loaded
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes of fully acknowledged chunks
    pub fn completed_bytes(&self) -> u64 {
        self.completed
    }

    /// File bytes of the current chunk have reached the transport.
    ///
    /// Returns the new value when the counter moved.
    pub fn in_flight(&mut self, chunk_bytes_sent: u64) -> Option<u64> {
        let candidate = self
            .completed
            .saturating_add(chunk_bytes_sent)
            .min(self.file_size);
        self.advance(candidate)
    }

    /// Chunk `index` was acknowledged. Returns the value to report.
    pub fn chunk_completed(&mut self, plan: &ChunkPlan, index: usize, chunk_len: u64) -> u64 {
        self.completed = self.completed.saturating_add(chunk_len).min(self.file_size);
        self.advance(plan.loaded_after(index));
        self.loaded
    }

    fn advance(&mut self, candidate: u64) -> Option<u64> {
        let candidate = candidate.min(self.file_size);
        if candidate > self.loaded {
            self.loaded = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::capability::CapabilityProfile;
    use crate::upload::planner::plan;

    #[test]
    fn test_in_flight_is_monotonic_and_clamped() {
        let mut reporter = ProgressReporter::new(100);

        assert_eq!(reporter.in_flight(40), Some(40));
        // Transport restarted its count: no regression
        assert_eq!(reporter.in_flight(10), None);
        assert_eq!(reporter.bytes_loaded(), 40);
        // Framing overshoot never exceeds the file
        assert_eq!(reporter.in_flight(250), Some(100));
        assert_eq!(reporter.in_flight(300), None);
    }

    #[test]
    fn test_chunks_accumulate() {
        let p = plan(1000, 300, &CapabilityProfile::detect());
        let mut reporter = ProgressReporter::new(1000);

        let mut seen = Vec::new();
        for (index, range) in p.ranges().enumerate() {
            reporter.in_flight(range.len() / 2);
            seen.push(reporter.chunk_completed(&p, index, range.len()));
        }

        assert_eq!(seen, vec![300, 600, 900, 1000]);
        assert_eq!(reporter.completed_bytes(), 1000);
    }

    #[test]
    fn test_in_flight_counts_from_completed_chunks() {
        let p = plan(1000, 300, &CapabilityProfile::detect());
        let mut reporter = ProgressReporter::new(1000);
        reporter.chunk_completed(&p, 0, 300);

        assert_eq!(reporter.in_flight(50), Some(350));
    }

    #[test]
    fn test_empty_file() {
        let p = plan(0, 0, &CapabilityProfile::detect());
        let mut reporter = ProgressReporter::new(0);
        assert_eq!(reporter.in_flight(0), None);
        assert_eq!(reporter.chunk_completed(&p, 0, 0), 0);
    }
}
