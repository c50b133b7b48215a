use crate::util::memory;

use super::recorder::RangeRecorder;

/// Consumes per-page release decisions in ascending page order and
/// coalesces maximal runs of releasable pages into single recorder calls.
pub struct FreePagesRangeTracker<'a, R: RangeRecorder> {
    recorder: &'a mut R,
    page_size_log: usize,
    in_range: bool,
    current_page: usize,
    current_range_start_page: usize,
}

impl<'a, R: RangeRecorder> FreePagesRangeTracker<'a, R> {
    pub fn new(recorder: &'a mut R) -> Self {
        Self {
            recorder,
            page_size_log: memory::page_size_log_cached(),
            in_range: false,
            current_page: 0,
            current_range_start_page: 0,
        }
    }

    pub fn process_next_page(&mut self, released: bool) {
        if released {
            if !self.in_range {
                self.current_range_start_page = self.current_page;
                self.in_range = true;
            }
        } else {
            self.close_opened_range();
        }
        self.current_page += 1;
    }

    /// Advance past `n` pages without examining them, closing any open run
    /// first. Used when an entire region is skipped.
    pub fn skip_pages(&mut self, n: usize) {
        self.close_opened_range();
        self.current_page += n;
    }

    pub fn finish(mut self) {
        self.close_opened_range();
    }

    fn close_opened_range(&mut self) {
        if self.in_range {
            self.recorder.release_page_range_to_os(
                self.current_range_start_page << self.page_size_log,
                self.current_page << self.page_size_log,
            );
            self.in_range = false;
        }
    }
}
