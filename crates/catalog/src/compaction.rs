//! Layered segment-compaction state.
//!
//! Segments are bucketed into layers by row count (each layer spans one
//! order of magnitude). Any layer of a table holding two or more sealed
//! segments yields a merge candidate: compacting same-sized segments keeps
//! write amplification bounded.

use keel_core::TxnTimeStamp;

/// Rows per layer step. Layer n holds segments with
/// `LAYER_BASE^n <= row_count < LAYER_BASE^(n+1)`.
const LAYER_BASE: u64 = 10;

/// Most segments merged in one pass.
pub const MAX_SEGMENTS_PER_COMPACTION: usize = 8;

/// Armed compaction-algorithm state.
#[derive(Debug, Clone)]
pub struct CompactionState {
    /// Timestamp the algorithm was initialized with (the system start ts).
    pub initialized_at: TxnTimeStamp,
}

/// A group of segments that should be merged into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionCandidate {
    pub db: String,
    pub table: String,
    pub segment_ids: Vec<u64>,
}

/// Which layer a segment of `row_count` rows belongs to.
pub fn layer_of(row_count: u64) -> u32 {
    let mut layer = 0;
    let mut bound = LAYER_BASE;
    while row_count >= bound {
        layer += 1;
        match bound.checked_mul(LAYER_BASE) {
            Some(next) => bound = next,
            None => break,
        }
    }
    layer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_step_by_magnitude() {
        assert_eq!(layer_of(0), 0);
        assert_eq!(layer_of(9), 0);
        assert_eq!(layer_of(10), 1);
        assert_eq!(layer_of(99), 1);
        assert_eq!(layer_of(100), 2);
        assert_eq!(layer_of(1_000_000), 6);
    }

    #[test]
    fn huge_counts_do_not_overflow() {
        let _ = layer_of(u64::MAX);
    }
}
