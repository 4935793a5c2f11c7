use rdmx_verbs::wire::WireRecord;
use rdmx_verbs::RegionView;

use crate::error::{LambdaError, Result};
use crate::records::{LambdaRequestHeader, RESULT_HEADER_LEN};

/// Input and output views over the session buffer.
///
/// Input is the lower half and output the upper half. Both are computed and
/// checked once when a server or client is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub capacity: usize,
    pub input: RegionView,
    pub output: RegionView,
}

impl RegionLayout {
    pub fn for_capacity(capacity: usize) -> Result<Self> {
        let need = LambdaRequestHeader::SIZE.max(2 * RESULT_HEADER_LEN);
        if capacity < need {
            return Err(LambdaError::BufferTooSmall { capacity, need });
        }
        let half = capacity / 2;
        let layout = Self {
            capacity,
            input: RegionView::new(0, half),
            output: RegionView::new(half, capacity - half),
        };
        debug_assert!(!layout.input.overlaps(&layout.output));
        Ok(layout)
    }

    /// Largest output a result record can carry back.
    pub fn max_result_output(&self) -> usize {
        self.capacity - RESULT_HEADER_LEN
    }
}
