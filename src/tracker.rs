use crate::bitmap::PageBitmap;
use crate::common::{Density, PageId, PageRange, MAX_SMALL_SPAN_PAGES, PAGES_PER_HUGE_PAGE};
use crate::lists::{ListHome, TrackerId};
use crate::residency::SinglePageBitmaps;
use crate::stats::{LargeSpanStats, NativePageCounterInfo, SmallSpanStats};
use crate::vm::MemoryModify;

/// Allocator over the pages of a single huge page.
///
/// Two parallel bitmaps carry the whole state: `allocated` marks pages
/// currently handed out, `released` marks pages currently unmapped from the
/// OS. A page is never both (`allocated ∧ released = 0`); a released page
/// is by definition free.
pub struct PageTracker {
    first_page: PageId,
    allocated: PageBitmap,
    released: PageBitmap,
    was_donated: bool,
    taken_from_filler: bool,
    density: Density,
    creation_time: i64,
    used: usize,
    released_count: usize,
    nallocs: usize,
    was_ever_released: bool,

    // Intrusive list state, owned by the list layer.
    pub(crate) prev: Option<TrackerId>,
    pub(crate) next: Option<TrackerId>,
    pub(crate) home: Option<ListHome>,
}

/// Result of [`PageTracker::allocate`]. When `from_released` holds, some of
/// the returned pages were unmapped and the caller must re-back them via
/// the injected remap operation before handing them out.
#[derive(Clone, Copy, Debug)]
pub struct TrackerAllocation {
    pub page: PageId,
    pub from_released: bool,
}

impl PageTracker {
    #[must_use]
    pub fn new(first_page: PageId, was_donated: bool, creation_time: i64) -> Self {
        Self {
            first_page,
            allocated: PageBitmap::new(),
            released: PageBitmap::new(),
            was_donated,
            taken_from_filler: false,
            density: Density::Sparse,
            creation_time,
            used: 0,
            released_count: 0,
            nallocs: 0,
            was_ever_released: false,
            prev: None,
            next: None,
            home: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    #[inline]
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.used
    }

    #[inline]
    #[must_use]
    pub fn free_pages(&self) -> usize {
        PAGES_PER_HUGE_PAGE - self.used
    }

    #[inline]
    #[must_use]
    pub fn released_pages(&self) -> usize {
        self.released_count
    }

    /// Free pages that are still mapped.
    #[inline]
    #[must_use]
    pub fn free_mapped_pages(&self) -> usize {
        self.free_pages() - self.released_count
    }

    #[inline]
    #[must_use]
    pub fn nallocs(&self) -> usize {
        self.nallocs
    }

    #[inline]
    #[must_use]
    pub fn empty(&self) -> bool {
        self.used == 0
    }

    /// True while any page of this huge page is unmapped.
    #[inline]
    #[must_use]
    pub fn released(&self) -> bool {
        self.released_count > 0
    }

    /// Sticky: true once any page of this huge page has ever been unmapped.
    #[inline]
    #[must_use]
    pub fn ever_released(&self) -> bool {
        self.was_ever_released
    }

    #[inline]
    #[must_use]
    pub fn was_donated(&self) -> bool {
        self.was_donated
    }

    /// A donated tracker stays in the donated bucket until the filler first
    /// allocates from it.
    #[inline]
    #[must_use]
    pub fn donated(&self) -> bool {
        self.was_donated && !self.taken_from_filler
    }

    pub(crate) fn set_taken_from_filler(&mut self) {
        self.taken_from_filler = true;
    }

    #[inline]
    #[must_use]
    pub fn density(&self) -> Density {
        self.density
    }

    pub(crate) fn set_density(&mut self, density: Density) {
        self.density = density;
    }

    #[inline]
    #[must_use]
    pub fn creation_time(&self) -> i64 {
        self.creation_time
    }

    #[must_use]
    pub fn longest_free_range(&self) -> usize {
        self.allocated.longest_zero_run()
    }

    /// First-fit allocation of `len` pages.
    ///
    /// Never fails on capacity: `len <= longest_free_range()` is a
    /// precondition and its violation aborts.
    pub fn allocate(&mut self, len: usize) -> TrackerAllocation {
        assert!(
            len > 0 && len <= self.longest_free_range(),
            "allocate({len}) exceeds longest free range {}",
            self.longest_free_range()
        );
        let start = self
            .allocated
            .find_and_set_first_fit(len)
            .expect("fit guaranteed by precondition");

        let from_released = self.released.count_ones_in(start, len);
        if from_released > 0 {
            self.released.clear_range(start, len);
            self.released_count -= from_released;
        }

        self.used += len;
        self.nallocs += 1;
        TrackerAllocation {
            page: self.first_page + start,
            from_released: from_released > 0,
        }
    }

    /// Return a previously allocated range. The pages stay mapped; they are
    /// only unmapped by a later [`Self::release_free`].
    pub fn free(&mut self, r: PageRange) {
        let start = r.first - self.first_page;
        assert!(
            start + r.len <= PAGES_PER_HUGE_PAGE,
            "free of {r:?} outside huge page at {}",
            self.first_page
        );
        assert_eq!(
            self.allocated.count_ones_in(start, r.len),
            r.len,
            "free of {r:?} covers pages that are not allocated"
        );
        self.allocated.clear_range(start, r.len);
        self.used -= r.len;
        self.nallocs -= 1;
    }

    /// Unmap every free run via `unback`, one call per maximal run of
    /// not-yet-released free pages. The last such run of each free run is
    /// extended through trailing already-released pages, so a free tail
    /// re-unmaps as a single coalesced call; if that call fails, every page
    /// it covered ends up un-released.
    ///
    /// Returns the number of pages newly marked released. A failing
    /// `unback` leaves (or makes) its range mapped; the engine above
    /// carries on.
    pub fn release_free(&mut self, unback: &mut dyn MemoryModify) -> usize {
        let mut released_now = 0;
        let mut cursor = 0;
        while let Some(run_start) = self.allocated.first_zero_from(cursor) {
            let run_end = self
                .allocated
                .first_one_from(run_start)
                .unwrap_or(PAGES_PER_HUGE_PAGE);

            let mut sub = run_start;
            while sub < run_end {
                let seg_start = match self.released.first_zero_from(sub) {
                    Some(i) if i < run_end => i,
                    _ => break, // rest of the run is already released
                };
                let mut seg_end = self
                    .released
                    .first_one_from(seg_start)
                    .unwrap_or(PAGES_PER_HUGE_PAGE)
                    .min(run_end);
                // Absorb a trailing released segment so the whole tail goes
                // out in one call.
                match self.released.first_zero_from(seg_end) {
                    Some(i) if i < run_end => {}
                    _ => seg_end = run_end,
                }

                let len = seg_end - seg_start;
                let r = PageRange::new(self.first_page + seg_start, len);
                if unback.modify(r).is_ok() {
                    let newly = len - self.released.count_ones_in(seg_start, len);
                    self.released.set_range(seg_start, len);
                    self.released_count += newly;
                    released_now += newly;
                    self.was_ever_released = true;
                } else {
                    let lost = self.released.count_ones_in(seg_start, len);
                    self.released.clear_range(seg_start, len);
                    self.released_count -= lost;
                }
                sub = seg_end;
            }
            cursor = run_end;
        }
        released_now
    }

    /// Tally every maximal free run into the span histograms, split by
    /// released status.
    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        let mut cursor = 0;
        while let Some(run_start) = self.allocated.first_zero_from(cursor) {
            let run_end = self
                .allocated
                .first_one_from(run_start)
                .unwrap_or(PAGES_PER_HUGE_PAGE);

            let mut i = run_start;
            while i < run_end {
                let is_released = self.released.get(i);
                let seg_end = if is_released {
                    self.released.first_zero_from(i)
                } else {
                    self.released.first_one_from(i)
                }
                .unwrap_or(PAGES_PER_HUGE_PAGE)
                .min(run_end);

                let len = seg_end - i;
                if len < MAX_SMALL_SPAN_PAGES {
                    if is_released {
                        small.returned_length[len] += 1;
                    } else {
                        small.normal_length[len] += 1;
                    }
                } else {
                    large.spans += 1;
                    if is_released {
                        large.returned_pages += len;
                    } else {
                        large.normal_pages += len;
                    }
                }
                i = seg_end;
            }
            cursor = run_end;
        }
    }

    /// Classify every native page of this huge page against a residency
    /// report. Native pages may be finer or coarser than tracker pages;
    /// the covered range is inspected either way. "Free" means free and
    /// still mapped.
    #[must_use]
    pub fn count_info_in_huge_page(
        &self,
        bitmaps: &SinglePageBitmaps,
        native_pages_in_huge_page: usize,
    ) -> NativePageCounterInfo {
        let mut info = NativePageCounterInfo::default();
        for native in 0..native_pages_in_huge_page {
            let (start, len) = if native_pages_in_huge_page >= PAGES_PER_HUGE_PAGE {
                let ratio = native_pages_in_huge_page / PAGES_PER_HUGE_PAGE;
                (native / ratio, 1)
            } else {
                let ratio = PAGES_PER_HUGE_PAGE / native_pages_in_huge_page;
                (native * ratio, ratio)
            };

            let allocated = self.allocated.count_ones_in(start, len);
            let released = self.released.count_ones_in(start, len);
            let used_any = allocated > 0;
            // Free-and-mapped: some covered page neither allocated nor
            // released (released pages are a subset of the unallocated).
            let free_mapped = len - allocated - released > 0;

            if bitmaps.swapped.contains(native) {
                if used_any {
                    info.n_used_swapped += 1;
                } else if free_mapped {
                    info.n_free_swapped += 1;
                }
            }
            if bitmaps.unbacked.contains(native) {
                if used_any {
                    info.n_used_unbacked += 1;
                } else if !free_mapped {
                    info.n_non_free_non_used_unbacked += 1;
                }
            }
        }
        info
    }

    /// Test sweep of the tracker invariants.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.allocated.count_ones(), self.used);
        assert_eq!(self.released.count_ones(), self.released_count);
        assert!(self.released_count <= self.free_pages());
        assert_eq!(self.nallocs == 0, self.used == 0);
        for i in 0..PAGES_PER_HUGE_PAGE {
            assert!(
                !(self.allocated.get(i) && self.released.get(i)),
                "page {i} both allocated and released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmError;
    use std::collections::VecDeque;

    const N: usize = PAGES_PER_HUGE_PAGE;

    /// Test double in the recording-mock style: remembers every call and
    /// pops scripted results (missing script entries succeed).
    pub(crate) struct RecordingUnback {
        pub calls: Vec<PageRange>,
        pub results: VecDeque<bool>,
    }

    impl RecordingUnback {
        pub fn new() -> Self {
            Self {
                calls: Vec::new(),
                results: VecDeque::new(),
            }
        }

        pub fn fail_next(&mut self, outcomes: &[bool]) {
            self.results.extend(outcomes.iter().copied());
        }
    }

    impl MemoryModify for RecordingUnback {
        fn modify(&mut self, r: PageRange) -> Result<(), VmError> {
            self.calls.push(r);
            if self.results.pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(VmError::DecommitFailed(std::io::Error::from(
                    std::io::ErrorKind::Other,
                )))
            }
        }
    }

    fn tracker() -> PageTracker {
        PageTracker::new(PageId(1000), /*was_donated=*/ false, 0)
    }

    #[test]
    fn test_alloc_sane() {
        // Increasing sizes fill the page without fragmentation; every
        // allocation is distinct and the counters track exactly.
        let mut t = tracker();
        let mut free = N;
        let mut n = 1;
        let mut allocs = Vec::new();
        while n <= free {
            assert!(t.longest_free_range() >= n);
            assert_eq!(t.used_pages(), N - free);
            assert_eq!(t.free_pages(), free);
            let a = t.allocate(n);
            allocs.push((a.page, n));
            free -= n;
            n += 1;
        }
        t.check_invariants();
        // All distinct.
        for w in allocs.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "overlapping allocations");
        }
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let mut t = tracker();
        let a = t.allocate(17);
        assert_eq!(t.used_pages(), 17);
        assert_eq!(t.nallocs(), 1);
        t.free(PageRange::new(a.page, 17));
        assert_eq!(t.used_pages(), 0);
        assert_eq!(t.nallocs(), 0);
        assert_eq!(t.longest_free_range(), N);
        t.check_invariants();
    }

    /// Build the `[A][B][C][D]` quarter layout used by the release tests.
    fn quarters(t: &mut PageTracker) -> [PageRange; 4] {
        let q = N / 4;
        let sizes = [q - 3, q, q + 1, q + 2];
        let mut out = [PageRange::new(PageId(0), 0); 4];
        for (i, &s) in sizes.iter().enumerate() {
            let a = t.allocate(s);
            out[i] = PageRange::new(a.page, s);
        }
        out
    }

    #[test]
    fn test_releasing_return() {
        let mut t = tracker();
        let [a1, a2, a3, a4] = quarters(&mut t);
        t.free(a2);
        t.free(a4);
        // [alloced][free][alloced][free]: only the free quarters unmap.
        let mut unback = RecordingUnback::new();
        let released = t.release_free(&mut unback);
        assert_eq!(released, a2.len + a4.len);
        assert_eq!(unback.calls, vec![a2, a4]);
        assert_eq!(t.released_pages(), a2.len + a4.len);
        assert_eq!(t.free_pages(), a2.len + a4.len);
        t.check_invariants();
        t.free(a1);
        t.free(a3);
    }

    #[test]
    fn test_releasing_retain_coalesces_tail() {
        let mut t = tracker();
        let [a1, a2, a3, a4] = quarters(&mut t);
        t.free(a2);
        t.free(a4);
        let mut unback = RecordingUnback::new();
        assert_eq!(t.release_free(&mut unback), a2.len + a4.len);
        unback.calls.clear();

        // Free the retained quarters. The next release covers a1 alone (a2
        // splits the run) and a3 together with the already-released a4 tail.
        t.free(a1);
        t.free(a3);
        let released = t.release_free(&mut unback);
        assert_eq!(released, a1.len + a3.len);
        assert_eq!(
            unback.calls,
            vec![a1, PageRange::new(a3.first, a3.len + a4.len)]
        );
        assert_eq!(t.released_pages(), N);
        assert_eq!(t.free_pages(), N);
        t.check_invariants();
    }

    #[test]
    fn test_releasing_retain_failure() {
        let mut t = tracker();
        let [a1, a2, a3, a4] = quarters(&mut t);
        t.free(a2);
        t.free(a4);
        let mut unback = RecordingUnback::new();
        unback.fail_next(&[true, false]);
        assert_eq!(t.release_free(&mut unback), a2.len);
        assert_eq!(unback.calls, vec![a2, a4]);
        assert_eq!(t.released_pages(), a2.len);
        assert_eq!(t.free_pages(), a2.len + a4.len);
        unback.calls.clear();

        // a3 and a4 coalesce into one attempt; its failure leaves both
        // unreleased while a1 succeeds.
        t.free(a1);
        t.free(a3);
        unback.fail_next(&[true, false]);
        assert_eq!(t.release_free(&mut unback), a1.len);
        assert_eq!(
            unback.calls,
            vec![a1, PageRange::new(a3.first, a3.len + a4.len)]
        );
        assert_eq!(t.released_pages(), a1.len + a2.len);
        assert_eq!(t.free_pages(), N);
        t.check_invariants();
    }

    #[test]
    fn test_coalesced_failure_unreleases_tail() {
        // Spec scenario: B and D released successfully, then A and C are
        // freed. The tail call covers C∪D; its failure strips D of its
        // released status.
        let mut t = tracker();
        let [a1, a2, a3, a4] = quarters(&mut t);
        t.free(a2);
        t.free(a4);
        let mut unback = RecordingUnback::new();
        assert_eq!(t.release_free(&mut unback), a2.len + a4.len);
        unback.calls.clear();

        t.free(a1);
        t.free(a3);
        unback.fail_next(&[true, false]);
        t.release_free(&mut unback);
        assert_eq!(
            unback.calls,
            vec![a1, PageRange::new(a3.first, a3.len + a4.len)]
        );
        assert_eq!(t.released_pages(), a1.len + a2.len);
        assert_eq!(t.free_pages(), N);
        t.check_invariants();
    }

    #[test]
    fn test_release_all_failing_changes_nothing() {
        let mut t = tracker();
        let a = t.allocate(N / 2);
        t.free(PageRange::new(a.page, N / 2));
        let mut unback = RecordingUnback::new();
        unback.fail_next(&[false]);
        assert_eq!(t.release_free(&mut unback), 0);
        assert_eq!(t.released_pages(), 0);
        assert!(!t.ever_released());
        t.check_invariants();
    }

    #[test]
    fn test_allocate_from_released_reports_and_clears() {
        let mut t = tracker();
        let a = t.allocate(N / 2);
        t.free(PageRange::new(a.page, N / 2));
        let mut unback = RecordingUnback::new();
        assert_eq!(t.release_free(&mut unback), N);

        let b = t.allocate(N / 4);
        assert!(b.from_released);
        assert_eq!(t.released_pages(), N - N / 4);
        assert!(t.ever_released());
        t.check_invariants();
        t.free(PageRange::new(b.page, N / 4));
    }

    #[test]
    fn test_span_stats() {
        // One large free run plus 1/2/3-page holes separated by single
        // allocated pages. First-fit keeps the layout deterministic.
        let mut t = tracker();
        let large_len = MAX_SMALL_SPAN_PAGES + 1;
        let a_large = t.allocate(large_len);
        t.allocate(1); // separator
        let f1 = t.allocate(1);
        t.allocate(1); // separator
        let f2 = t.allocate(2);
        t.allocate(1); // separator
        let f3 = t.allocate(3);
        let rest = N - (large_len + 3 + 1 + 2 + 3);
        t.allocate(rest);

        t.free(PageRange::new(a_large.page, large_len));
        t.free(PageRange::new(f1.page, 1));
        t.free(PageRange::new(f2.page, 2));
        t.free(PageRange::new(f3.page, 3));

        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        t.add_span_stats(&mut small, &mut large);
        assert_eq!(small.normal_length[1], 1);
        assert_eq!(small.normal_length[2], 1);
        assert_eq!(small.normal_length[3], 1);
        assert_eq!(large.spans, 1);
        assert_eq!(large.normal_pages, large_len);
        assert_eq!(large.returned_pages, 0);

        // After release the same spans show up as returned.
        let mut unback = RecordingUnback::new();
        t.release_free(&mut unback);
        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        t.add_span_stats(&mut small, &mut large);
        assert_eq!(small.returned_length[1], 1);
        assert_eq!(small.returned_length[2], 1);
        assert_eq!(small.returned_length[3], 1);
        assert_eq!(small.normal_length[1], 0);
        assert_eq!(large.spans, 1);
        assert_eq!(large.normal_pages, 0);
        assert_eq!(large.returned_pages, large_len);
    }

    #[test]
    fn test_span_stats_last_page_boundary() {
        // One free page at the very end of the huge page: the scan must
        // report exactly one run of length 1 without walking past the end
        // of the bitmaps.
        let mut t = tracker();
        let mut pages = Vec::with_capacity(N);
        for _ in 0..N {
            pages.push(t.allocate(1).page);
        }
        pages.sort();
        t.free(PageRange::new(*pages.last().unwrap(), 1));
        assert_eq!(t.used_pages(), N - 1);

        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        t.add_span_stats(&mut small, &mut large);
        assert_eq!(small.normal_length[1], 1);
        for len in 2..MAX_SMALL_SPAN_PAGES {
            assert_eq!(small.normal_length[len], 0, "phantom run of length {len}");
        }
        assert_eq!(large.spans, 0);
    }

    #[test]
    fn test_count_info_in_huge_page() {
        // Quarter layout [used][released][used][free-mapped], first half of
        // native pages unbacked, second half swapped.
        let q = N / 4;
        let mut t = tracker();
        t.allocate(q - 4);
        let a2 = t.allocate(q);
        t.allocate(q + 3);
        let a4 = t.allocate(q + 1);
        t.free(PageRange::new(a2.page, q));
        t.free(PageRange::new(a4.page, q + 1));

        let mut unback = RecordingUnback::new();
        unback.fail_next(&[true, false]);
        t.release_free(&mut unback);
        assert_eq!(t.released_pages(), q);
        assert_eq!(t.free_pages(), 2 * q + 1);

        let native = 2 * N; // native pages finer than tracker pages
        let mut bitmaps = SinglePageBitmaps::empty(native);
        bitmaps.unbacked.set_range(0..native / 2, true);
        bitmaps.swapped.set_range(native / 2..native, true);

        let info = t.count_info_in_huge_page(&bitmaps, native);
        assert_eq!(info.n_used_unbacked, native / 4);
        assert_eq!(info.n_non_free_non_used_unbacked, native / 4);
        assert_eq!(info.n_used_swapped, native / 4 - 2);
        assert_eq!(info.n_free_swapped, native / 4 + 2);
    }

    #[test]
    fn test_count_info_coarse_native_pages() {
        // 8 native pages per huge page (256KB native pages): each native
        // page covers 32 tracker pages.
        let mut t = tracker();
        t.allocate(32); // exactly native page 0
        let native = 8;
        let mut bitmaps = SinglePageBitmaps::empty(native);
        bitmaps.swapped.set_range(0..native, true);
        let info = t.count_info_in_huge_page(&bitmaps, native);
        assert_eq!(info.n_used_swapped, 1);
        assert_eq!(info.n_free_swapped, native - 1);
    }

    #[test]
    #[should_panic(expected = "exceeds longest free range")]
    fn test_allocate_beyond_longest_free_range_aborts() {
        let mut t = tracker();
        t.allocate(N - 1);
        t.allocate(2);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_free_unallocated_aborts() {
        let mut t = tracker();
        let a = t.allocate(4);
        t.free(PageRange::new(a.page, 4));
        t.free(PageRange::new(a.page, 4));
    }

    #[test]
    fn test_defrag_churn() {
        // Random grow/shrink churn in the reference driver's style: the
        // tracker must never lose pages and the invariants must hold
        // throughout.
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut t = tracker();
        let mut live: Vec<PageRange> = Vec::new();

        for _ in 0..10_000 {
            let lfr = t.longest_free_range();
            if lfr == 0 || (!live.is_empty() && rng.gen_bool(0.5)) {
                let idx = rng.gen_range(0..live.len());
                let r = live.swap_remove(idx);
                t.free(r);
            } else {
                let len = rng.gen_range(1..=lfr.min(32));
                let a = t.allocate(len);
                live.push(PageRange::new(a.page, len));
            }
            assert_eq!(t.used_pages() + t.free_pages(), N);
        }
        t.check_invariants();
        for r in live {
            t.free(r);
        }
        assert!(t.empty());
    }
}
