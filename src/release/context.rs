use crate::util::conversions;
use crate::util::memory;
use crate::util::Address;

use super::page_map::RegionPageMap;

/// A batch of compacted block pointers from the allocator's free list.
///
/// The free list is consumed as an ordered sequence of batches; the engine
/// only needs positional access within each one. Decoding a compact
/// pointer back to an absolute address is the caller's business, via the
/// `decompact_ptr` closure handed to
/// [`mark_free_blocks`](super::PageReleaseContext::mark_free_blocks).
pub trait TransferBatch {
    /// The compact pointer representation stored in the batch.
    type CompactPtr: Copy;

    fn count(&self) -> u16;

    fn get(&self, i: u16) -> Self::CompactPtr;
}

/// Geometry and state of one release job.
///
/// The job covers `number_of_regions` regions of `region_size` bytes, each
/// carved into `block_size` blocks, and examines the release window
/// `[release_offset, release_offset + release_size)` (within region 0 when
/// there is only one region; multi-region jobs always cover whole
/// regions). Construction classifies how blocks and pages interleave; the
/// marking calls then populate the page map, and
/// [`release_free_memory_to_os`](super::release_free_memory_to_os) turns
/// the populated map into OS release calls.
pub struct PageReleaseContext {
    pub(super) block_size: usize,
    pub(super) region_size: usize,
    pub(super) number_of_regions: usize,
    // For a partial release window, pages before the window need no counters.
    pub(super) release_page_offset: usize,
    pub(super) page_size: usize,
    pub(super) pages_count: usize,
    pub(super) page_size_log: usize,
    pub(super) rounded_region_size: usize,
    pub(super) rounded_size: usize,
    pub(super) full_pages_block_count_max: usize,
    pub(super) same_block_count_per_page: bool,
    pub(super) page_map: RegionPageMap,
}

impl PageReleaseContext {
    pub fn new(
        block_size: usize,
        region_size: usize,
        number_of_regions: usize,
        release_size: usize,
        release_offset: usize,
    ) -> Self {
        let page_size = memory::page_size_cached();

        let (full_pages_block_count_max, same_block_count_per_page) = if block_size <= page_size {
            if page_size % block_size == 0 {
                // Every page holds the same number of blocks, none straddle.
                (page_size / block_size, true)
            } else if block_size % (page_size % block_size) == 0 {
                // Blocks straddle page boundaries, but with a repeating
                // phase: every page still sees the same number of blocks,
                // one or two of them partial.
                (page_size / block_size + 1, true)
            } else {
                // Straddling with a drifting phase: every page holds one or
                // two partial blocks and the count varies from page to page.
                (page_size / block_size + 2, false)
            }
        } else if block_size % page_size == 0 {
            // One block covers a whole number of pages.
            (1, true)
        } else {
            // One block covers several pages and straddles: some pages see
            // one block, some two.
            (2, false)
        };

        // Partial-window marking is only supported for a single region.
        // Multi-region jobs sidestep the region-tail special cases by
        // always covering whole regions.
        if number_of_regions != 1 {
            debug_assert_eq!(release_size, region_size);
            debug_assert_eq!(release_offset, 0);
        }

        let page_size_log = memory::page_size_log_cached();
        let rounded_region_size = conversions::raw_align_up(region_size, page_size);
        Self {
            block_size,
            region_size,
            number_of_regions,
            release_page_offset: release_offset >> page_size_log,
            page_size,
            pages_count: conversions::raw_align_up(release_size, page_size) / page_size,
            page_size_log,
            rounded_region_size,
            rounded_size: number_of_regions * rounded_region_size,
            full_pages_block_count_max,
            same_block_count_per_page,
            page_map: RegionPageMap::default(),
        }
    }

    /// Whether any marking call has populated (and thus allocated) the
    /// page map.
    pub fn has_blocks_marked(&self) -> bool {
        self.page_map.is_allocated()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pages_count(&self) -> usize {
        self.pages_count
    }

    /// The maximum number of distinct blocks that can touch a single page.
    pub fn full_pages_block_count_max(&self) -> usize {
        self.full_pages_block_count_max
    }

    /// Whether every page of the job sees the same maximum block count.
    pub fn same_block_count_per_page(&self) -> bool {
        self.same_block_count_per_page
    }

    pub fn page_map(&self) -> &RegionPageMap {
        &self.page_map
    }

    /// The page map is allocated lazily by the first marking call, so a job
    /// that turns out to have no free blocks never allocates. Returns false
    /// when the map could not be allocated; the job must then be abandoned.
    fn ensure_page_map_allocated(&mut self) -> bool {
        if self.page_map.is_allocated() {
            return true;
        }
        self.page_map.reset(
            self.number_of_regions,
            self.pages_count,
            self.full_pages_block_count_max,
        );
        self.page_map.is_allocated()
    }

    /// Mark every block in the byte range `[from, to)` as free without
    /// enumerating them.
    ///
    /// `from` must be page aligned, and so must `to` unless the range runs
    /// to the end of the region. Both must fall in the same region.
    /// Interior pages are force-marked with the all-counted sentinel; the
    /// at most two seam pages that share a straddling block with the
    /// outside of the range only get counter increments, so the release
    /// driver can still judge them against their expected counts.
    pub fn mark_range_as_all_counted(&mut self, from: Address, to: Address, base: Address) {
        debug_assert!(from < to);
        debug_assert!(from.is_aligned_to(self.page_size));

        if !self.ensure_page_map_allocated() {
            return;
        }

        let from_offset = from - base;
        let to_offset = to - base;

        let region_index = if self.number_of_regions == 1 {
            0
        } else {
            from_offset / self.region_size
        };
        if cfg!(debug_assertions) {
            let to_region_index = if self.number_of_regions == 1 {
                0
            } else {
                (to_offset - 1) / self.region_size
            };
            assert_eq!(region_index, to_region_index, "range spans regions");
        }

        let mut from_in_region = from_offset - region_index * self.region_size;
        let mut to_in_region = to_offset - region_index * self.region_size;
        let first_block_in_range =
            conversions::round_up_to_multiple(from_in_region, self.block_size);

        // A single straddling block covers the entire range; nothing in it
        // is known to be free.
        if first_block_in_range >= to_in_region {
            return;
        }

        // The first whole block may start pages past `from`.
        from_in_region = conversions::raw_align_down(first_block_in_range, self.page_size);

        if first_block_in_range != from_in_region {
            // A block straddles `from`:
            //
            //   from                                            to
            //     v                                              v
            //     +----------------------------------------------+
            //  +-----+-----+-----+-----+
            //  |     |     |     |     | ...
            //  +-----+-----+-----+-----+
            //     |-    first page    -||-   second page    -||- ...
            //
            // The first page cannot be marked all-counted outright: count
            // the blocks that begin inside it, then move on to the next
            // page boundary.
            debug_assert!(from_in_region + self.page_size > first_block_in_range);
            let num_blocks_in_first_page = (from_in_region + self.page_size - first_block_in_range
                + self.block_size
                - 1)
                / self.block_size;
            self.page_map.inc_n(
                region_index,
                self.get_page_index(from_in_region),
                num_blocks_in_first_page,
            );
            from_in_region = conversions::raw_align_up(from_in_region + 1, self.page_size);
        }

        let last_block_in_range =
            conversions::round_down_to_multiple(to_in_region - 1, self.block_size);
        if last_block_in_range < from_in_region {
            return;
        }

        if last_block_in_range + self.block_size != self.region_size {
            debug_assert!(conversions::raw_is_aligned(to_in_region, self.page_size));
            // The last block may hang past `to`:
            //
            //   from                                      to
            //     v                                        v
            //     +----------------------------------------+
            //                          +-----+-----+-----+-----+
            //                          |     |     |     |     | ...
            //                          +-----+-----+-----+-----+
            //                    ... -||-    last page   -||-   next page   -|
            //
            // The pages under the hanging bytes only get increments.
            if last_block_in_range + self.block_size != to_in_region {
                self.page_map.inc_range(
                    region_index,
                    self.get_page_index(to_in_region),
                    self.get_page_index(last_block_in_range + self.block_size - 1),
                );
            }
        } else {
            // The terminal block of the region: no block lives past it, so
            // the range effectively extends to the region end.
            to_in_region = self.region_size;
        }

        // With both seams handled, everything in between is wholly free.
        if from_in_region < to_in_region {
            self.page_map.set_as_all_counted_range(
                region_index,
                self.get_page_index(from_in_region),
                self.get_page_index(to_in_region - 1),
            );
        }
    }

    /// Count every free block on the allocator's free list into the page
    /// map. Pointers outside the job's rounded window are ignored.
    pub fn mark_free_blocks<'a, B, I, D>(&mut self, free_list: I, decompact_ptr: &D, base: Address)
    where
        B: TransferBatch + 'a,
        I: IntoIterator<Item = &'a B>,
        D: Fn(B::CompactPtr) -> Address,
    {
        if !self.ensure_page_map_allocated() {
            return;
        }

        let last_block_in_region = ((self.region_size / self.block_size) - 1) * self.block_size;

        if self.block_size <= self.page_size && self.page_size % self.block_size == 0 {
            // Fast path: every block is confined to a single page.
            for batch in free_list {
                for i in 0..batch.count() {
                    let p = decompact_ptr(batch.get(i)) - base;
                    if p >= self.rounded_size {
                        continue;
                    }
                    let region_index = if self.number_of_regions == 1 {
                        0
                    } else {
                        p / self.region_size
                    };
                    let p_in_region = p - region_index * self.region_size;
                    self.page_map
                        .inc(region_index, self.get_page_index(p_in_region));
                    if p_in_region == last_block_in_region {
                        self.mark_last_block(region_index, last_block_in_region);
                    }
                }
            }
        } else {
            // General path: a block may touch several pages.
            debug_assert!(self.region_size >= self.block_size);
            for batch in free_list {
                for i in 0..batch.count() {
                    let p = decompact_ptr(batch.get(i)) - base;
                    if p >= self.rounded_size {
                        continue;
                    }
                    let region_index = if self.number_of_regions == 1 {
                        0
                    } else {
                        p / self.region_size
                    };
                    let p_in_region = p - region_index * self.region_size;
                    self.page_map.inc_range(
                        region_index,
                        self.get_page_index(p_in_region),
                        self.get_page_index(p_in_region + self.block_size - 1),
                    );
                    if p_in_region == last_block_in_region {
                        self.mark_last_block(region_index, last_block_in_region);
                    }
                }
            }
        }
    }

    // The last block of a region may leave a tail on the final page(s) that
    // no block can occupy. When that block turns out to be free, pretend
    // blocks fill the tail so the affected pages can still reach their
    // expected counts.
    fn mark_last_block(&mut self, region_index: usize, last_block_in_region: usize) {
        let mut p_in_region = last_block_in_region + self.block_size;
        while p_in_region < self.rounded_region_size {
            self.page_map.inc_range(
                region_index,
                self.get_page_index(p_in_region),
                self.get_page_index(p_in_region + self.block_size - 1),
            );
            p_in_region += self.block_size;
        }
    }

    fn get_page_index(&self, p: usize) -> usize {
        debug_assert!((p >> self.page_size_log) >= self.release_page_offset);
        (p >> self.page_size_log) - self.release_page_offset
    }
}
