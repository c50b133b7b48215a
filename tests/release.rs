//! End-to-end release jobs: mark free blocks (or ranges), drive the
//! release, and check the exact page ranges handed to the recorder.
//!
//! Expectations are computed from the host's real page size so the suite
//! holds on 4 KiB and 16 KiB kernels alike.

use reclaim::util::conversions;
use reclaim::util::memory;
use reclaim::{
    release_free_list_to_os, release_free_memory_to_os, Address, PageReleaseContext,
    RangeRecorder, ReleaseRecorder, TransferBatch,
};

/// Captures emitted ranges and checks the driver's ordering contract:
/// strictly ascending, non-overlapping, non-empty.
struct CaptureRecorder {
    ranges: Vec<(usize, usize)>,
}

impl CaptureRecorder {
    fn new() -> Self {
        Self { ranges: Vec::new() }
    }
}

impl RangeRecorder for CaptureRecorder {
    fn base(&self) -> Address {
        Address::ZERO
    }

    fn release_page_range_to_os(&mut self, from: usize, to: usize) {
        assert!(from < to);
        if let Some(&(_, prev_to)) = self.ranges.last() {
            assert!(from >= prev_to, "ranges must be disjoint and ascending");
        }
        self.ranges.push((from, to));
    }
}

struct Batch(Vec<usize>);

impl TransferBatch for Batch {
    type CompactPtr = usize;

    fn count(&self) -> u16 {
        self.0.len() as u16
    }

    fn get(&self, i: u16) -> usize {
        self.0[i as usize]
    }
}

/// Chop a stream of block offsets into transfer batches.
fn batches(offsets: impl Iterator<Item = usize>) -> Vec<Batch> {
    let mut out = Vec::new();
    let mut cur = Vec::new();
    for p in offsets {
        cur.push(p);
        if cur.len() == 64 {
            out.push(Batch(std::mem::take(&mut cur)));
        }
    }
    if !cur.is_empty() {
        out.push(Batch(cur));
    }
    out
}

fn decompact(p: usize) -> Address {
    unsafe { Address::from_usize(p) }
}

/// All block start offsets of a region of `region_size` bytes.
fn all_blocks(region_size: usize, block_size: usize) -> impl Iterator<Item = usize> {
    (0..region_size / block_size).map(move |k| k * block_size)
}

#[test]
fn full_region_of_page_sized_divisors_releases_as_one_range() {
    let ps = memory::page_size_cached();
    let block_size = 16;
    let region_size = 16 * ps;

    let ctx = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    assert_eq!(ctx.full_pages_block_count_max(), ps / block_size);
    assert!(ctx.same_block_count_per_page());

    let free = batches(all_blocks(region_size, block_size));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert_eq!(recorder.ranges, vec![(0, region_size)]);
}

#[test]
fn one_fully_free_page_releases_exactly_that_page() {
    let ps = memory::page_size_cached();
    let block_size = 16;
    let region_size = 16 * ps;

    // Only the blocks of the first page are free.
    let free = batches((0..ps / block_size).map(|k| k * block_size));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert_eq!(recorder.ranges, vec![(0, ps)]);
}

#[test]
fn straddling_blocks_with_fixed_phase_release_the_whole_region() {
    let ps = memory::page_size_cached();
    let block_size = 48;
    let region_size = 4 * ps;

    let ctx = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    assert_eq!(ctx.full_pages_block_count_max(), ps / block_size + 1);
    assert!(ctx.same_block_count_per_page());

    // Every real block is free; the region tail past the last block is
    // covered by tail compensation.
    let free = batches(all_blocks(region_size, block_size));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert_eq!(recorder.ranges, vec![(0, region_size)]);
}

#[test]
fn straddling_blocks_with_drifting_phase_release_the_whole_region() {
    let ps = memory::page_size_cached();
    let block_size = 96;
    let region_size = 4 * ps;

    let ctx = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    assert!(!ctx.same_block_count_per_page());

    let free = batches(all_blocks(region_size, block_size));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert_eq!(recorder.ranges, vec![(0, region_size)]);
}

#[test]
fn drifting_phase_releases_only_pages_with_every_toucher_free() {
    let ps = memory::page_size_cached();
    let block_size = 96;
    let region_size = 4 * ps;

    // Free every block that touches page 0, including the one straddling
    // out into page 1. Page 0 becomes releasable; page 1 is touched by one
    // free block but misses the rest.
    let free = batches((0..).map(|k| k * block_size).take_while(|&p| p < ps));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert_eq!(recorder.ranges, vec![(0, ps)]);

    // Without the straddler, page 0 is one count short and nothing moves.
    let free = batches(
        (0..)
            .map(|k| k * block_size)
            .take_while(|&p| p + block_size <= ps),
    );
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    assert!(recorder.ranges.is_empty());
}

#[test]
fn multi_page_blocks_release_in_block_sized_chunks() {
    let ps = memory::page_size_cached();
    let block_size = 2 * ps;
    let region_size = 64 * ps;

    let ctx = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    assert_eq!(ctx.full_pages_block_count_max(), 1);
    assert!(ctx.same_block_count_per_page());

    // Every other block is free.
    let free = batches((0..region_size / block_size).filter(|k| k % 2 == 0).map(|k| k * block_size));
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(&free, region_size, 1, block_size, &mut recorder, decompact, |_| {
        false
    });
    let expected: Vec<(usize, usize)> = (0..region_size / block_size)
        .filter(|k| k % 2 == 0)
        .map(|k| (k * block_size, k * block_size + block_size))
        .collect();
    assert_eq!(recorder.ranges, expected);
}

#[test]
fn regions_release_independently_and_skips_are_honored() {
    let ps = memory::page_size_cached();
    let block_size = 16;
    let region_size = 16 * ps;
    let number_of_regions = 4;

    // Regions 0 and 2 are fully free, region 1 has nothing free, and
    // region 3 (also fully free) is skipped by the caller.
    let free = batches(
        all_blocks(region_size, block_size)
            .chain(all_blocks(region_size, block_size).map(|p| 2 * region_size + p))
            .chain(all_blocks(region_size, block_size).map(|p| 3 * region_size + p)),
    );
    let mut recorder = CaptureRecorder::new();
    release_free_list_to_os(
        &free,
        region_size,
        number_of_regions,
        block_size,
        &mut recorder,
        decompact,
        |region| region == 3,
    );
    assert_eq!(
        recorder.ranges,
        vec![(0, region_size), (2 * region_size, 3 * region_size)]
    );
}

#[test]
fn range_mark_and_free_list_mark_classify_pages_identically() {
    let ps = memory::page_size_cached();
    let block_size = 48;
    let region_size = 16 * ps;
    let from = ps;
    let to = 3 * ps;

    // Path 1: bulk-mark the page-aligned range.
    let mut bulk = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    bulk.mark_range_as_all_counted(
        unsafe { Address::from_usize(from) },
        unsafe { Address::from_usize(to) },
        Address::ZERO,
    );

    // Path 2: enumerate the blocks wholly inside the range as a free list.
    let first_block = conversions::round_up_to_multiple(from, block_size);
    let free = batches(
        (0..)
            .map(|k| first_block + k * block_size)
            .take_while(|&p| p + block_size <= to),
    );
    let mut listed = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    listed.mark_free_blocks(&free, &decompact, Address::ZERO);

    let mut bulk_recorder = CaptureRecorder::new();
    release_free_memory_to_os(&mut bulk, &mut bulk_recorder, |_| false);
    let mut listed_recorder = CaptureRecorder::new();
    release_free_memory_to_os(&mut listed, &mut listed_recorder, |_| false);

    // Only the interior page is releasable: the seam pages share straddling
    // blocks with the outside of the range.
    assert_eq!(bulk_recorder.ranges, vec![(2 * ps, 3 * ps)]);
    assert_eq!(bulk_recorder.ranges, listed_recorder.ranges);
}

#[test]
fn partial_window_releases_only_window_pages() {
    let ps = memory::page_size_cached();
    let block_size = 16;
    let region_size = 16 * ps;
    let release_offset = 8 * ps;
    let release_size = 8 * ps;

    let mut ctx = PageReleaseContext::new(block_size, region_size, 1, release_size, release_offset);
    assert_eq!(ctx.pages_count(), 8);

    // Free every block of the window. Emitted offsets are relative to the
    // window start; a production recorder for a partial window is based
    // there.
    let free = batches((release_offset..region_size).step_by(block_size));
    ctx.mark_free_blocks(&free, &decompact, Address::ZERO);
    let mut recorder = CaptureRecorder::new();
    release_free_memory_to_os(&mut ctx, &mut recorder, |_| false);
    assert_eq!(recorder.ranges, vec![(0, release_size)]);
}

#[test]
fn partial_window_with_drifting_phase_keeps_the_seam_page() {
    let ps = memory::page_size_cached();
    let block_size = 96;
    let region_size = 16 * ps;
    let release_offset = 8 * ps;
    let release_size = 8 * ps;

    let mut ctx = PageReleaseContext::new(block_size, region_size, 1, release_size, release_offset);

    // Free every block that lies wholly inside the window. The block
    // straddling the window start is not on the list, so the first window
    // page can never prove itself fully free.
    let first_block = conversions::round_up_to_multiple(release_offset, block_size);
    let free = batches(
        (0..)
            .map(|k| first_block + k * block_size)
            .take_while(|&p| p + block_size <= region_size),
    );
    ctx.mark_free_blocks(&free, &decompact, Address::ZERO);
    let mut recorder = CaptureRecorder::new();
    release_free_memory_to_os(&mut ctx, &mut recorder, |_| false);
    assert_eq!(recorder.ranges, vec![(ps, release_size)]);
}

#[test]
fn release_recorder_accumulates_stats_and_returns_memory() {
    let ps = memory::page_size_cached();
    let block_size = 256;
    let region_size = 4 * ps;

    let base = memory::map_anon(region_size, "reclaim:test-region").unwrap();
    memory::set(base, 0xab, region_size);

    let mut ctx = PageReleaseContext::new(block_size, region_size, 1, region_size, 0);
    ctx.mark_range_as_all_counted(base, base + region_size, base);
    let mut recorder = ReleaseRecorder::new(base);
    release_free_memory_to_os(&mut ctx, &mut recorder, |_| false);

    assert_eq!(recorder.get_released_ranges_count(), 1);
    assert_eq!(recorder.get_released_bytes(), region_size);
    assert_eq!(recorder.get_base(), base);

    // On Linux, MADV_DONTNEED guarantees the next touch sees zero pages.
    #[cfg(target_os = "linux")]
    for i in (0..region_size).step_by(ps) {
        assert_eq!(unsafe { *(base + i).to_ptr::<u8>() }, 0);
    }

    memory::unmap(base, region_size).unwrap();
}
