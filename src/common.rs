use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Small page size. 8KB pages keep a 2MB huge page at 256 entries, which in
/// turn keeps every per-page bitmap at four machine words.
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Huge page size the OS can back with a single TLB entry.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Number of small pages covered by one huge page.
pub const PAGES_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Free runs shorter than this are histogrammed per length; longer runs are
/// aggregated as "large" spans.
pub const MAX_SMALL_SPAN_PAGES: usize = 32;

/// Index of a small page. Page ids are assigned monotonically by the caller;
/// a huge page covers the id range `[first, first + PAGES_PER_HUGE_PAGE)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct PageId(pub usize);

impl PageId {
    #[inline]
    #[must_use]
    pub fn offset(self, n: usize) -> PageId {
        PageId(self.0 + n)
    }

    /// Byte address of this page relative to page id zero.
    #[inline]
    #[must_use]
    pub fn in_bytes(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl Add<usize> for PageId {
    type Output = PageId;
    fn add(self, rhs: usize) -> PageId {
        PageId(self.0 + rhs)
    }
}

impl AddAssign<usize> for PageId {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<PageId> for PageId {
    type Output = usize;
    fn sub(self, rhs: PageId) -> usize {
        self.0 - rhs.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A contiguous run of small pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageRange {
    pub first: PageId,
    pub len: usize,
}

impl PageRange {
    #[inline]
    #[must_use]
    pub fn new(first: PageId, len: usize) -> Self {
        Self { first, len }
    }

    #[inline]
    #[must_use]
    pub fn in_bytes(&self) -> usize {
        self.len << PAGE_SHIFT
    }
}

/// Predicted access density of an allocation. A routing hint, not a property
/// of the pages: sparse and dense requests fill disjoint sets of huge pages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Density {
    Sparse,
    Dense,
}

/// Number of density classes, plus one aggregate slot used by statistics.
pub const DENSITY_KINDS: usize = 2;

impl Density {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Density::Sparse => 0,
            Density::Dense => 1,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Density::Sparse => "sparsely-accessed",
            Density::Dense => "densely-accessed",
        }
    }
}

/// Metadata attached to every allocation request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanAllocInfo {
    pub objects_per_span: usize,
    pub density: Density,
}

/// Injected tick source. `now` returns monotonic ticks, `freq` ticks per
/// second. Tests substitute an atomic counter advanced by a helper; the
/// production clock reads `CLOCK_MONOTONIC`.
#[derive(Clone, Copy)]
pub struct Clock {
    pub now: fn() -> i64,
    pub freq: fn() -> f64,
}

impl Clock {
    /// Ticks elapsed for `seconds` under this clock.
    #[inline]
    #[must_use]
    pub fn ticks_for(&self, seconds: f64) -> i64 {
        (seconds * (self.freq)()) as i64
    }

    /// Seconds represented by `ticks` under this clock.
    #[inline]
    #[must_use]
    pub fn seconds_for(&self, ticks: i64) -> f64 {
        ticks as f64 / (self.freq)()
    }

    /// Monotonic system clock in nanosecond ticks.
    #[cfg(unix)]
    #[must_use]
    pub fn system() -> Clock {
        fn now() -> i64 {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // Safety: FFI call to clock_gettime with a valid out-pointer.
            let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            assert!(rc == 0, "clock_gettime(CLOCK_MONOTONIC) failed");
            ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
        }
        fn freq() -> f64 {
            1e9
        }
        Clock { now, freq }
    }
}
