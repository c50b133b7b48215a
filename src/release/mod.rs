//! Deciding which OS pages behind the allocator's regions hold no live
//! blocks, and returning them to the OS.
//!
//! A release job reconciles two geometries: fixed-size allocator blocks
//! and fixed-size OS pages, neither of which has to divide the other. The
//! [`PageReleaseContext`] records, per (region, page), how many free
//! blocks touch each page in a packed counter array ([`RegionPageMap`]);
//! the driver then classifies every page (does its free-block count match
//! the number of blocks touching it?) and streams maximal runs of
//! releasable pages through a [`FreePagesRangeTracker`] into a
//! [`RangeRecorder`].

mod context;
mod page_map;
mod range_tracker;
mod recorder;

pub use self::context::{PageReleaseContext, TransferBatch};
pub use self::page_map::{RegionPageMap, STATIC_BUFFER_WORDS};
pub use self::range_tracker::FreePagesRangeTracker;
pub use self::recorder::{RangeRecorder, ReleaseRecorder};

use crate::util::conversions;
use crate::util::Address;

/// Walk the populated page map and release every page that holds only free
/// blocks, coalescing adjacent releasable pages into single recorder calls.
///
/// Pages are classified with
/// [`RegionPageMap::update_as_all_counted_if`]: a page whose counter has
/// reached the number of blocks touching it is fully free. When every page
/// sees the same number of blocks that number is a per-job constant;
/// otherwise it is recomputed per page by walking block boundaries
/// alongside page boundaries. Ranges are emitted in strictly ascending
/// address order. Regions for which `skip_region` returns true are passed
/// over without being examined.
pub fn release_free_memory_to_os<R, S>(
    context: &mut PageReleaseContext,
    recorder: &mut R,
    skip_region: S,
) where
    R: RangeRecorder,
    S: Fn(usize) -> bool,
{
    let page_size = context.page_size;
    let block_size = context.block_size;
    let pages_count = context.pages_count;
    let number_of_regions = context.number_of_regions;
    let release_page_offset = context.release_page_offset;
    let full_pages_block_count_max = context.full_pages_block_count_max;
    let same_block_count_per_page = context.same_block_count_per_page;
    let page_map = &mut context.page_map;

    trace!(
        "release job: regions={} pages_per_region={} block_size={} uniform={}",
        number_of_regions,
        pages_count,
        block_size,
        same_block_count_per_page
    );

    let mut tracker = FreePagesRangeTracker::new(recorder);
    if same_block_count_per_page {
        // Fast path: every page is judged against the same block count.
        for region in 0..number_of_regions {
            if skip_region(region) {
                tracker.skip_pages(pages_count);
                continue;
            }
            for page in 0..pages_count {
                let can_release =
                    page_map.update_as_all_counted_if(region, page, full_pages_block_count_max);
                tracker.process_next_page(can_release);
            }
        }
    } else {
        // Slow path: blocks and pages are incommensurable, so track the
        // next block boundary alongside the page boundary and count how
        // many blocks touch each page. A page sees the blocks wholly
        // inside it, plus up to one straddling in at the front and one
        // hanging out at the back.
        let pn = if block_size < page_size {
            page_size / block_size
        } else {
            1
        };
        let pnc = pn * block_size;
        for region in 0..number_of_regions {
            if skip_region(region) {
                tracker.skip_pages(pages_count);
                continue;
            }
            let mut prev_page_boundary = 0;
            let mut current_boundary = 0;
            if release_page_offset > 0 {
                prev_page_boundary = release_page_offset * page_size;
                current_boundary = conversions::round_up_to_multiple(prev_page_boundary, block_size);
            }
            for page in 0..pages_count {
                let page_boundary = prev_page_boundary + page_size;
                let mut blocks_per_page = pn;
                if current_boundary < page_boundary {
                    if current_boundary > prev_page_boundary {
                        blocks_per_page += 1;
                    }
                    current_boundary += pnc;
                    if current_boundary < page_boundary {
                        blocks_per_page += 1;
                        current_boundary += block_size;
                    }
                }
                prev_page_boundary = page_boundary;
                let can_release = page_map.update_as_all_counted_if(region, page, blocks_per_page);
                tracker.process_next_page(can_release);
            }
        }
    }
    tracker.finish();
}

/// Mark and release in one call, for callers that do not need the page
/// usage information afterwards. Builds a full-window context covering
/// every region, counts the free list into it, and drives the release. If
/// the page map cannot be allocated the job is abandoned with a warning.
pub fn release_free_list_to_os<'a, B, I, D, R, S>(
    free_list: I,
    region_size: usize,
    number_of_regions: usize,
    block_size: usize,
    recorder: &mut R,
    decompact_ptr: D,
    skip_region: S,
) where
    B: TransferBatch + 'a,
    I: IntoIterator<Item = &'a B>,
    D: Fn(B::CompactPtr) -> Address,
    R: RangeRecorder,
    S: Fn(usize) -> bool,
{
    let mut context =
        PageReleaseContext::new(block_size, region_size, number_of_regions, region_size, 0);
    context.mark_free_blocks(free_list, &decompact_ptr, recorder.base());
    if !context.has_blocks_marked() {
        warn!("page map allocation failed; abandoning release job");
        return;
    }
    release_free_memory_to_os(&mut context, recorder, skip_region);
}
