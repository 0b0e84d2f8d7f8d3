#[cfg(not(target_pointer_width = "64"))]
compile_error!("hugefill supports only 64-bit targets.");

pub mod bitmap;
pub mod common;
pub mod filler;
pub mod lists;
pub mod residency;
pub mod stats;
pub mod subrelease;
pub mod tracker;
pub mod vm;

// core allocator surface
pub use filler::{
    DenseTrackerSort, FillerConfig, HugePageFiller, TryGetResult, CANDIDATES_FOR_RELEASING,
};
pub use lists::{TrackerId, TrackerSlab};
pub use tracker::{PageTracker, TrackerAllocation};

// page model
pub use common::{
    Clock, Density, PageId, PageRange, SpanAllocInfo, HUGE_PAGE_SIZE, MAX_SMALL_SPAN_PAGES,
    PAGES_PER_HUGE_PAGE, PAGE_SHIFT, PAGE_SIZE,
};

// release policy
pub use subrelease::SkipSubreleaseIntervals;

// statistics
pub use stats::{
    BackingStats, FillerStats, LargeSpanStats, NativePageCounterInfo, PbtxtRegion, SmallSpanStats,
    SubreleaseStats,
};

// injected operations
pub use residency::{Residency, SinglePageBitmaps};
pub use vm::{MemoryModify, VmError};
#[cfg(unix)]
pub use vm::{SystemBack, SystemUnback};
