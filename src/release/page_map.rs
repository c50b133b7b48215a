use spin::{Mutex, MutexGuard};

use crate::util::constants::{BITS_IN_WORD, BYTES_IN_WORD};
use crate::util::conversions;
use crate::util::memory;
use crate::util::Address;

/// Capacity, in words, of the process-wide static counter buffer.
pub const STATIC_BUFFER_WORDS: usize = 2048;

// Small jobs borrow this buffer instead of mapping a fresh one. Whoever
// wins the try_lock keeps the guard inside their page map until the job
// ends; everyone else falls back to a private mapping.
static STATIC_BUFFER: Mutex<[usize; STATIC_BUFFER_WORDS]> = Mutex::new([0; STATIC_BUFFER_WORDS]);

enum CounterBuffer {
    Unallocated,
    Static(MutexGuard<'static, [usize; STATIC_BUFFER_WORDS]>),
    Mapped { base: Address, map_size: usize },
}

/// A packed 2D array of counters, one per (region, page), recording how
/// many free blocks touch each page.
///
/// Each counter occupies `2^n` bits, the narrowest power-of-two width that
/// can hold the job's maximum expected count, so locating a counter is a
/// shift and a mask rather than a division. The all-ones value
/// (`counter_mask`) is a sentinel meaning "every block in this page is
/// free", whatever the actual block count for that page; a single compare
/// against it answers the release question in the hot loop.
///
/// `reset` tries the static buffer first and maps a private buffer when the
/// static one is too small or already taken. Mapping can fail, so callers
/// are expected to check `is_allocated` before use. For performance, none
/// of the accessors validate their arguments beyond debug assertions:
/// indices must be in range and a counter must not be pushed past its max.
pub struct RegionPageMap {
    regions: usize,
    num_counters: usize,
    counter_size_bits_log: usize,
    counter_mask: usize,
    packing_ratio_log: usize,
    bit_offset_mask: usize,
    size_per_region: usize,
    buffer_size: usize,
    buffer: CounterBuffer,
}

impl Default for RegionPageMap {
    fn default() -> Self {
        Self {
            regions: 0,
            num_counters: 0,
            counter_size_bits_log: 0,
            counter_mask: 0,
            packing_ratio_log: 0,
            bit_offset_mask: 0,
            size_per_region: 0,
            buffer_size: 0,
            buffer: CounterBuffer::Unallocated,
        }
    }
}

impl RegionPageMap {
    pub fn new(number_of_regions: usize, counters_per_region: usize, max_value: usize) -> Self {
        let mut map = Self::default();
        map.reset(number_of_regions, counters_per_region, max_value);
        map
    }

    /// (Re)configure the geometry and allocate a zeroed backing buffer.
    /// On allocation failure the map is left unallocated.
    pub fn reset(&mut self, number_of_regions: usize, counters_per_region: usize, max_value: usize) {
        debug_assert!(number_of_regions > 0);
        debug_assert!(counters_per_region > 0);
        debug_assert!(max_value > 0);

        self.release_buffer();

        self.regions = number_of_regions;
        self.num_counters = counters_per_region;

        // Rounding the counter width up to a power of two reduces counter
        // addressing to shifts and masks.
        let counter_size_bits = conversions::bits_to_represent(max_value).next_power_of_two();
        debug_assert!(counter_size_bits <= BITS_IN_WORD);
        self.counter_size_bits_log = conversions::log2(counter_size_bits);
        self.counter_mask = usize::MAX >> (BITS_IN_WORD - counter_size_bits);

        let packing_ratio = BITS_IN_WORD >> self.counter_size_bits_log;
        debug_assert!(packing_ratio > 0);
        self.packing_ratio_log = conversions::log2(packing_ratio);
        self.bit_offset_mask = packing_ratio - 1;

        self.size_per_region =
            conversions::raw_align_up(counters_per_region, packing_ratio) >> self.packing_ratio_log;
        self.buffer_size = self.size_per_region * BYTES_IN_WORD * number_of_regions;

        if self.buffer_size <= STATIC_BUFFER_WORDS * BYTES_IN_WORD {
            if let Some(mut guard) = STATIC_BUFFER.try_lock() {
                guard[..self.size_per_region * number_of_regions].fill(0);
                self.buffer = CounterBuffer::Static(guard);
                trace!(
                    "page map using the static buffer ({} of {} words)",
                    self.size_per_region * number_of_regions,
                    STATIC_BUFFER_WORDS
                );
                return;
            }
        }

        // Fresh anonymous mappings come back zeroed, so only the static
        // buffer needs an explicit fill above.
        let map_size = conversions::raw_align_up(self.buffer_size, memory::page_size_cached());
        match memory::map_anon(map_size, "reclaim:counters") {
            Ok(base) => {
                trace!("page map mapped a private buffer of {} bytes", map_size);
                self.buffer = CounterBuffer::Mapped { base, map_size };
            }
            Err(e) => {
                warn!("failed to map {} bytes for page counters: {}", map_size, e);
            }
        }
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self.buffer, CounterBuffer::Unallocated)
    }

    /// The number of counters per region.
    pub fn get_count(&self) -> usize {
        self.num_counters
    }

    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn get(&self, region: usize, i: usize) -> usize {
        let (word, bit_offset) = self.slot(region, i);
        (self.words()[word] >> bit_offset) & self.counter_mask
    }

    /// Add 1 to the counter. The counter must not already be at its max,
    /// and the page must not be marked all-counted.
    pub fn inc(&mut self, region: usize, i: usize) {
        debug_assert!(self.get(region, i) < self.counter_mask);
        let (word, bit_offset) = self.slot(region, i);
        self.words_mut()[word] += 1 << bit_offset;
    }

    /// Add `n` to the counter. The result must not exceed the counter max.
    pub fn inc_n(&mut self, region: usize, i: usize, n: usize) {
        debug_assert!(n > 0);
        debug_assert!(n <= self.counter_mask);
        debug_assert!(self.get(region, i) <= self.counter_mask - n);
        let (word, bit_offset) = self.slot(region, i);
        self.words_mut()[word] += n << bit_offset;
    }

    /// Add 1 to every counter in `[from, to]`, clamped to the region's
    /// counter count.
    pub fn inc_range(&mut self, region: usize, from: usize, to: usize) {
        debug_assert!(from <= to);
        let top = usize::min(to + 1, self.num_counters);
        for i in from..top {
            self.inc(region, i);
        }
    }

    /// Force the counter to the all-counted sentinel. The maximum number of
    /// blocks per page varies between pages; pinning every fully-free page
    /// to the same sentinel lets the release loop test them uniformly.
    pub fn set_as_all_counted(&mut self, region: usize, i: usize) {
        debug_assert!(self.get(region, i) <= self.counter_mask);
        let (word, bit_offset) = self.slot(region, i);
        let mask = self.counter_mask;
        self.words_mut()[word] |= mask << bit_offset;
    }

    /// [`set_as_all_counted`](Self::set_as_all_counted) over `[from, to]`,
    /// clamped to the region's counter count.
    pub fn set_as_all_counted_range(&mut self, region: usize, from: usize, to: usize) {
        debug_assert!(from <= to);
        let top = usize::min(to + 1, self.num_counters);
        for i in from..top {
            self.set_as_all_counted(region, i);
        }
    }

    /// The release-time classifier: returns true if the page is fully free,
    /// promoting an exact `expected_count` match to the sentinel on the way.
    pub fn update_as_all_counted_if(
        &mut self,
        region: usize,
        i: usize,
        expected_count: usize,
    ) -> bool {
        let count = self.get(region, i);
        if count == self.counter_mask {
            return true;
        }
        if count == expected_count {
            self.set_as_all_counted(region, i);
            return true;
        }
        false
    }

    pub fn is_all_counted(&self, region: usize, i: usize) -> bool {
        self.get(region, i) == self.counter_mask
    }

    fn slot(&self, region: usize, i: usize) -> (usize, usize) {
        debug_assert!(region < self.regions);
        debug_assert!(i < self.num_counters);
        let index = i >> self.packing_ratio_log;
        let bit_offset = (i & self.bit_offset_mask) << self.counter_size_bits_log;
        debug_assert!(bit_offset < BITS_IN_WORD);
        (region * self.size_per_region + index, bit_offset)
    }

    fn words(&self) -> &[usize] {
        match &self.buffer {
            CounterBuffer::Unallocated => &[],
            CounterBuffer::Static(guard) => &guard[..],
            CounterBuffer::Mapped { base, .. } => unsafe {
                std::slice::from_raw_parts(base.to_ptr(), self.size_per_region * self.regions)
            },
        }
    }

    fn words_mut(&mut self) -> &mut [usize] {
        match &mut self.buffer {
            CounterBuffer::Unallocated => &mut [],
            CounterBuffer::Static(guard) => &mut guard[..],
            CounterBuffer::Mapped { base, .. } => unsafe {
                std::slice::from_raw_parts_mut(base.to_mut_ptr(), self.size_per_region * self.regions)
            },
        }
    }

    fn release_buffer(&mut self) {
        match std::mem::replace(&mut self.buffer, CounterBuffer::Unallocated) {
            CounterBuffer::Unallocated => {}
            // Dropping the guard unlocks the static buffer.
            CounterBuffer::Static(_) => {}
            CounterBuffer::Mapped { base, map_size } => {
                if let Err(e) = memory::unmap(base, map_size) {
                    error!("failed to unmap counter buffer at {}: {}", base, e);
                }
            }
        }
    }

    #[cfg(test)]
    fn uses_static_buffer(&self) -> bool {
        matches!(self.buffer, CounterBuffer::Static(_))
    }
}

impl Drop for RegionPageMap {
    fn drop(&mut self) {
        self.release_buffer();
    }
}
