use crate::util::memory;
use crate::util::Address;

/// Sink for the page ranges a release job decides to return to the OS.
///
/// The driver emits disjoint ranges in strictly ascending order, as byte
/// offsets relative to [`base`](RangeRecorder::base). Tests substitute a
/// capturing implementation; production uses [`ReleaseRecorder`].
pub trait RangeRecorder {
    /// Absolute address of region 0 of the job.
    fn base(&self) -> Address;

    /// Release the pages spanning `[from, to)` bytes past `base`.
    fn release_page_range_to_os(&mut self, from: usize, to: usize);
}

/// The production [`RangeRecorder`]: hands ranges to the OS and accumulates
/// per-job statistics.
pub struct ReleaseRecorder {
    released_ranges_count: usize,
    released_bytes: usize,
    base: Address,
}

impl ReleaseRecorder {
    pub fn new(base: Address) -> Self {
        Self {
            released_ranges_count: 0,
            released_bytes: 0,
            base,
        }
    }

    /// How many distinct ranges this job has released.
    pub fn get_released_ranges_count(&self) -> usize {
        self.released_ranges_count
    }

    /// How many bytes this job has released.
    pub fn get_released_bytes(&self) -> usize {
        self.released_bytes
    }

    pub fn get_base(&self) -> Address {
        self.base
    }
}

impl RangeRecorder for ReleaseRecorder {
    fn base(&self) -> Address {
        self.base
    }

    fn release_page_range_to_os(&mut self, from: usize, to: usize) {
        let size = to - from;
        // The advice is just that; on failure the pages simply stay
        // resident, so log and keep going.
        if let Err(e) = memory::release_pages(self.base + from, size) {
            warn!(
                "madvise failed for [{}, {}): {}",
                self.base + from,
                self.base + to,
                e
            );
        }
        self.released_ranges_count += 1;
        self.released_bytes += size;
    }
}
