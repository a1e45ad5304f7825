use super::capability::CapabilityProfile;

/// Half-open byte range `[start, end)` of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Ordered split of a file into chunk-sized byte ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: usize,
    chunked: bool,
}

/// Compute the chunk plan for a file.
///
/// Falls back to a single whole-file unit when no chunk size is configured,
/// when the file fits in one chunk, or when the transport cannot slice.
pub fn plan(file_size: u64, configured_chunk_size: u64, profile: &CapabilityProfile) -> ChunkPlan {
    if configured_chunk_size == 0
        || file_size <= configured_chunk_size
        || !profile.can_slice_chunks
    {
        return ChunkPlan {
            file_size,
            chunk_size: file_size,
            total_chunks: 1,
            chunked: false,
        };
    }

    ChunkPlan {
        file_size,
        chunk_size: configured_chunk_size,
        total_chunks: file_size.div_ceil(configured_chunk_size) as usize,
        chunked: true,
    }
}

impl ChunkPlan {
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// True when the file travels as more than one request
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.total_chunks
    }

    /// Byte range of chunk `index`, `None` past the end of the plan
    pub fn range_of(&self, index: usize) -> Option<ChunkRange> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Some(ChunkRange { start, end })
    }

    /// Bytes confirmed once chunk `index` has succeeded
    pub fn loaded_after(&self, index: usize) -> u64 {
        if !self.chunked {
            return self.file_size;
        }
        ((index as u64 + 1) * self.chunk_size).min(self.file_size)
    }

    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.total_chunks).filter_map(|i| self.range_of(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths(plan: &ChunkPlan) -> Vec<u64> {
        plan.ranges().map(|r| r.len()).collect()
    }

    #[test]
    fn test_plan_uneven_split() {
        let plan = plan(1000, 300, &CapabilityProfile::detect());
        assert!(plan.is_chunked());
        assert_eq!(plan.total_chunks(), 4);
        assert_eq!(lengths(&plan), vec![300, 300, 300, 100]);
        assert_eq!(plan.range_of(3), Some(ChunkRange { start: 900, end: 1000 }));
        assert_eq!(plan.range_of(4), None);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let plan = plan(900, 300, &CapabilityProfile::detect());
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(lengths(&plan), vec![300, 300, 300]);
    }

    #[test]
    fn test_plan_degenerate_cases() {
        let profile = CapabilityProfile::detect();

        // No chunk size configured
        let p = plan(500, 0, &profile);
        assert!(!p.is_chunked());
        assert_eq!(lengths(&p), vec![500]);

        // File smaller than or equal to one chunk
        assert_eq!(lengths(&plan(200, 300, &profile)), vec![200]);
        assert_eq!(lengths(&plan(300, 300, &profile)), vec![300]);

        // Transport cannot slice
        let p = plan(1000, 300, &profile.without_chunking());
        assert_eq!(p.total_chunks(), 1);
        assert_eq!(p.chunk_size(), 1000);

        // Empty file still produces one (empty) unit
        let p = plan(0, 300, &profile);
        assert_eq!(p.total_chunks(), 1);
        assert!(p.range_of(0).unwrap().is_empty());
    }

    #[test]
    fn test_ranges_are_contiguous_and_exhaustive() {
        let profile = CapabilityProfile::detect();
        for file_size in 0..=64u64 {
            for chunk_size in 0..=20u64 {
                let p = plan(file_size, chunk_size, &profile);
                let ranges: Vec<_> = p.ranges().collect();
                assert_eq!(ranges.len(), p.total_chunks());

                let mut cursor = 0;
                for r in &ranges {
                    assert_eq!(r.start, cursor, "gap at {file_size}/{chunk_size}");
                    assert!(r.len() <= p.chunk_size());
                    cursor = r.end;
                }
                assert_eq!(cursor, file_size);

                if p.is_chunked() {
                    assert_eq!(p.total_chunks() as u64, file_size.div_ceil(chunk_size));
                    assert!(ranges.last().unwrap().len() >= 1);
                } else {
                    assert_eq!(p.total_chunks(), 1);
                }
            }
        }
    }

    #[test]
    fn test_loaded_after_clamps_to_file_size() {
        let p = plan(1000, 300, &CapabilityProfile::detect());
        assert_eq!(p.loaded_after(0), 300);
        assert_eq!(p.loaded_after(2), 900);
        assert_eq!(p.loaded_after(3), 1000);

        let whole = plan(500, 0, &CapabilityProfile::detect());
        assert_eq!(whole.loaded_after(0), 500);
    }
}
