//! A page-release engine for multi-region size-class allocators.
//!
//! A size-class allocator carves page-aligned regions into fixed-size
//! blocks. Over time many blocks become free, but the OS pages backing them
//! stay resident until somebody notices that *every* block touching a page
//! is free and tells the OS so. This crate is that somebody: given the
//! allocator's free list (or the knowledge that a whole byte range is
//! free), it counts free blocks per page in a packed counter array, decides
//! which pages hold no live data, and returns maximal runs of them to the
//! OS in as few `madvise` calls as possible.
//!
//! The crate does not decide *when* to release; that policy belongs to the
//! caller. A release job is synchronous and owned by the invoking thread:
//!
//! ```no_run
//! use reclaim::{release_free_memory_to_os, PageReleaseContext, ReleaseRecorder};
//! # use reclaim::util::Address;
//! # let region_base: Address = unsafe { Address::from_usize(0x1000_0000) };
//! # let (block_size, region_size, regions) = (32, 1 << 20, 4);
//!
//! let mut context = PageReleaseContext::new(block_size, region_size, regions, region_size, 0);
//! // ... context.mark_free_blocks(...) / context.mark_range_as_all_counted(...)
//! let mut recorder = ReleaseRecorder::new(region_base);
//! release_free_memory_to_os(&mut context, &mut recorder, |_region| false);
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod release;
pub mod util;

pub use crate::release::{
    release_free_list_to_os, release_free_memory_to_os, FreePagesRangeTracker,
    PageReleaseContext, RangeRecorder, RegionPageMap, ReleaseRecorder, TransferBatch,
};
pub use crate::util::Address;
