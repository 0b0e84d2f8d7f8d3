use std::fmt::Write as _;

use crate::common::{
    Clock, Density, PageId, PageRange, SpanAllocInfo, DENSITY_KINDS, HUGE_PAGE_SIZE, PAGE_SIZE,
    PAGES_PER_HUGE_PAGE,
};
use crate::lists::{HintedTrackerLists, ListClass, TrackerId, TrackerSlab};
use crate::residency::Residency;
use crate::stats::{
    BackingStats, FillerStats, LargeSpanStats, LifetimeHisto, NativePageHisto, PageHisto,
    PbtxtRegion, SmallSpanStats, SubreleaseStats, DENSITY_TOTAL,
};
use crate::subrelease::{SkipSubreleaseIntervals, SubreleaseTracker};
use crate::tracker::PageTracker;
use crate::vm::MemoryModify;

/// Upper bound on the candidate window buffered per release pass, so the
/// fewest-used comparator works on a small top-k instead of every tracker.
pub const CANDIDATES_FOR_RELEASING: usize = PAGES_PER_HUGE_PAGE;

const LIST_BUCKETS: usize = PAGES_PER_HUGE_PAGE + 1;

/// Ordering of the densely-accessed regular lists.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DenseTrackerSort {
    /// Index by longest free range, like the sparse lists.
    LongestFreeRangeAndChunks,
    /// Index by outstanding allocations; allocation prefers the fullest
    /// tracker that still fits.
    SpansAllocated,
}

/// Build-time policy knobs. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct FillerConfig {
    pub dense_tracker_sort: DenseTrackerSort,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            dense_tracker_sort: DenseTrackerSort::LongestFreeRangeAndChunks,
        }
    }
}

/// Successful allocation: the owning tracker, the first page, and whether
/// any returned page must be re-backed before use.
#[derive(Clone, Copy, Debug)]
pub struct TryGetResult {
    pub tracker: TrackerId,
    pub page: PageId,
    pub from_released: bool,
}

/// Which lists a release pass harvests from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReleaseSource {
    Regular,
    PartialReleased,
    Donated,
}

/// Packs small page runs into huge pages and keeps each huge page as close
/// to fully-used or fully-free as the request stream allows.
///
/// Every entry point expects the caller's page-heap lock to be held; the
/// filler itself contains no synchronization. The injected unback operation
/// is invoked with that lock held and may block or fail.
pub struct HugePageFiller {
    slab: TrackerSlab,
    regular: [HintedTrackerLists; DENSITY_KINDS],
    donated: HintedTrackerLists,
    partial_released: [HintedTrackerLists; DENSITY_KINDS],
    released_lists: [HintedTrackerLists; DENSITY_KINDS],

    size: usize,
    pages_allocated: [usize; DENSITY_KINDS],
    unmapped: usize,
    /// Release work banked when a subreleased huge page went empty: its
    /// still-mapped free pages vanish with the caller's whole-page unmap,
    /// so the next release request claims them without new syscalls.
    unmapping_unaccounted: usize,
    used_in_partial_released: [usize; DENSITY_KINDS],
    used_in_released: [usize; DENSITY_KINDS],
    previously_released_full: usize,

    clock: Clock,
    config: FillerConfig,
    demand: SubreleaseTracker,
}

fn class_for(t: &PageTracker) -> ListClass {
    if t.donated() {
        ListClass::Donated
    } else if t.released_pages() == 0 {
        ListClass::Regular(t.density())
    } else if t.released_pages() == t.free_pages() {
        ListClass::Released(t.density())
    } else {
        ListClass::PartialReleased(t.density())
    }
}

impl HugePageFiller {
    #[must_use]
    pub fn new(clock: Clock, config: FillerConfig) -> Self {
        let epoch_ticks = clock.ticks_for(1.0).max(1);
        let now = (clock.now)();
        Self {
            slab: TrackerSlab::new(),
            regular: [
                HintedTrackerLists::new(ListClass::Regular(Density::Sparse), LIST_BUCKETS),
                HintedTrackerLists::new(ListClass::Regular(Density::Dense), LIST_BUCKETS),
            ],
            donated: HintedTrackerLists::new(ListClass::Donated, LIST_BUCKETS),
            partial_released: [
                HintedTrackerLists::new(ListClass::PartialReleased(Density::Sparse), LIST_BUCKETS),
                HintedTrackerLists::new(ListClass::PartialReleased(Density::Dense), LIST_BUCKETS),
            ],
            released_lists: [
                HintedTrackerLists::new(ListClass::Released(Density::Sparse), LIST_BUCKETS),
                HintedTrackerLists::new(ListClass::Released(Density::Dense), LIST_BUCKETS),
            ],
            size: 0,
            pages_allocated: [0; DENSITY_KINDS],
            unmapped: 0,
            unmapping_unaccounted: 0,
            used_in_partial_released: [0; DENSITY_KINDS],
            used_in_released: [0; DENSITY_KINDS],
            previously_released_full: 0,
            clock,
            config,
            demand: SubreleaseTracker::new(epoch_ticks, now),
        }
    }

    // -- accessors ---------------------------------------------------------

    /// Number of huge pages currently governed by the filler.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn capacity_pages(&self) -> usize {
        self.size * PAGES_PER_HUGE_PAGE
    }

    #[must_use]
    pub fn pages_allocated(&self) -> usize {
        self.pages_allocated.iter().sum()
    }

    #[must_use]
    pub fn pages_allocated_for(&self, density: Density) -> usize {
        self.pages_allocated[density.index()]
    }

    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.pages_allocated()
    }

    /// Free pages that are still mapped.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.capacity_pages() - self.used_pages() - self.unmapped
    }

    /// Free pages currently returned to the OS.
    #[must_use]
    pub fn unmapped_pages(&self) -> usize {
        self.unmapped
    }

    #[must_use]
    pub fn used_pages_in_released(&self) -> usize {
        self.used_in_released.iter().sum()
    }

    #[must_use]
    pub fn used_pages_in_partial_released(&self) -> usize {
        self.used_in_partial_released.iter().sum()
    }

    #[must_use]
    pub fn used_pages_in_any_subreleased(&self) -> usize {
        self.used_pages_in_released() + self.used_pages_in_partial_released()
    }

    /// Huge pages that are currently full after having been subreleased at
    /// some point in their life.
    #[must_use]
    pub fn previously_released_huge_pages(&self) -> usize {
        self.previously_released_full
    }

    #[must_use]
    pub fn subrelease_stats(&self) -> SubreleaseStats {
        self.demand.stats()
    }

    /// Share of used pages living on huge pages that were never broken by a
    /// subrelease; these remain eligible for a single TLB entry.
    #[must_use]
    pub fn hugepage_frac(&self) -> f64 {
        let used = self.used_pages();
        if used == 0 {
            return 1.0;
        }
        (used - self.used_pages_in_any_subreleased()) as f64 / used as f64
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.size * HUGE_PAGE_SIZE,
            free_bytes: self.free_pages() * PAGE_SIZE,
            unmapped_bytes: self.unmapped * PAGE_SIZE,
        }
    }

    /// Diagnostics-only iteration over every tracker.
    pub fn for_each_huge_page(&self, mut f: impl FnMut(TrackerId, &PageTracker)) {
        for (id, t) in self.slab.iter() {
            f(id, t);
        }
    }

    #[must_use]
    pub fn tracker(&self, id: TrackerId) -> &PageTracker {
        self.slab.get(id)
    }

    /// Span histograms aggregated over every tracker.
    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for (_, t) in self.slab.iter() {
            t.add_span_stats(small, large);
        }
    }

    // -- allocation --------------------------------------------------------

    /// Allocate `len` pages with the best-fitting tracker of the request's
    /// density. `None` asks the caller to contribute a fresh huge page.
    pub fn try_get(&mut self, len: usize, info: SpanAllocInfo) -> Option<TryGetResult> {
        assert!(
            len > 0 && len <= PAGES_PER_HUGE_PAGE,
            "try_get({len}) out of range"
        );
        let id = self.select_tracker(len, info.density)?;
        self.unlink(id);
        let t = self.slab.get_mut(id);
        let released_before = t.released_pages();
        let alloc = t.allocate(len);
        t.set_taken_from_filler();
        let consumed = released_before - t.released_pages();
        self.unmapped -= consumed;
        self.pages_allocated[info.density.index()] += len;
        self.link(id);
        self.sample_demand();
        Some(TryGetResult {
            tracker: id,
            page: alloc.page,
            from_released: alloc.from_released,
        })
    }

    fn select_tracker(&self, len: usize, density: Density) -> Option<TrackerId> {
        let di = density.index();
        let regular = match (density, self.config.dense_tracker_sort) {
            (Density::Dense, DenseTrackerSort::SpansAllocated) => {
                // Fullest-first: highest allocation count that still fits.
                let mut found = None;
                'search: for bucket in self.regular[di].buckets_desc() {
                    for id in self.regular[di].bucket_ids(&self.slab, bucket) {
                        if self.slab.get(id).longest_free_range() >= len {
                            found = Some(id);
                            break 'search;
                        }
                    }
                }
                found
            }
            _ => self.regular[di].peek_least(len),
        };
        if regular.is_some() {
            return regular;
        }
        if let Some(id) = self.partial_released[di].peek_least(len) {
            return Some(id);
        }
        if let Some(id) = self.released_lists[di].peek_least(len) {
            return Some(id);
        }
        // Donated huge pages are a last resort and only ever serve
        // sparsely-accessed spans.
        if density == Density::Sparse {
            return self.donated.peek_least(len);
        }
        None
    }

    /// Accept a freshly-backed huge page. The caller has already carved its
    /// first allocation out of `tracker`.
    pub fn contribute(
        &mut self,
        mut tracker: PageTracker,
        donated: bool,
        info: SpanAllocInfo,
    ) -> TrackerId {
        assert_eq!(tracker.was_donated(), donated, "donation flag mismatch");
        assert!(!tracker.empty(), "contributed tracker carries no allocation");
        assert!(
            !(donated && info.density == Density::Dense),
            "donated huge pages only serve sparsely-accessed spans"
        );
        tracker.set_density(info.density);
        self.pages_allocated[info.density.index()] += tracker.used_pages();
        self.unmapped += tracker.released_pages();
        self.size += 1;
        let id = self.slab.insert(tracker);
        self.link(id);
        self.sample_demand();
        id
    }

    /// Return an allocated range. When the tracker goes empty it is handed
    /// back for recycling of the underlying huge page.
    pub fn put(&mut self, id: TrackerId, r: PageRange) -> Option<PageTracker> {
        self.unlink(id);
        let t = self.slab.get_mut(id);
        let density = t.density();
        t.free(r);
        self.pages_allocated[density.index()] -= r.len;

        if self.slab.get(id).empty() {
            let tracker = self.slab.remove(id);
            self.size -= 1;
            self.unmapped -= tracker.released_pages();
            if tracker.released() {
                // The caller unmaps the whole huge page; count the mapped
                // remainder as release work already done.
                self.unmapping_unaccounted += tracker.free_mapped_pages();
            }
            self.sample_demand();
            return Some(tracker);
        }
        self.link(id);
        self.sample_demand();
        None
    }

    // -- release engine ----------------------------------------------------

    /// Release up to `desired` free pages back to the OS via `unback`.
    ///
    /// Returns the number of pages the caller may consider released, which
    /// can exceed `desired` (a selected tracker is always drained in full)
    /// or fall short (nothing left, or skip-subrelease protection).
    pub fn release_pages(
        &mut self,
        unback: &mut dyn MemoryModify,
        desired: usize,
        intervals: SkipSubreleaseIntervals,
        release_partial_alloc_pages: bool,
        hit_limit: bool,
    ) -> usize {
        let now = (self.clock.now)();
        self.demand.report_demand(now, self.used_pages());

        // Claim banked credit from huge pages that left while subreleased.
        let credit = desired.min(self.unmapping_unaccounted);
        self.unmapping_unaccounted -= credit;
        if credit >= desired {
            return credit;
        }

        let remaining = desired - credit;
        let free = self.free_pages();
        let mut target = remaining.min(free);
        if !hit_limit && intervals.enabled() {
            let required = self
                .demand
                .required_demand(intervals)
                .min(self.capacity_pages());
            let protected = required.saturating_sub(self.used_pages());
            let capped = remaining.min(free.saturating_sub(protected));
            let skipped = target - capped;
            if skipped > 0 {
                self.demand.record_skip(now, skipped, required, intervals);
            }
            target = capped;
        }

        // Priority order: regular trackers first, unconditionally. The free
        // pages of partially-released trackers move only when the caller
        // opted in, and donated huge pages give up their pages last, once
        // everything else is drained.
        let mut engine = 0;
        if engine < target {
            engine +=
                self.release_candidates(unback, ReleaseSource::Regular, target - engine, false, hit_limit);
        }
        if release_partial_alloc_pages && engine < target {
            engine += self.release_candidates(
                unback,
                ReleaseSource::PartialReleased,
                target - engine,
                true,
                hit_limit,
            );
        }
        if engine < target {
            engine +=
                self.release_candidates(unback, ReleaseSource::Donated, target - engine, false, hit_limit);
        }
        credit + engine
    }

    /// Bounded fewest-used-first candidate window over one source. Sparse
    /// lists are scanned first so equal-use ties release sparse trackers
    /// before dense ones.
    fn select_candidates(&self, source: ReleaseSource) -> Vec<TrackerId> {
        let mut candidates: Vec<(usize, usize, TrackerId)> = Vec::new();
        let mut seq = 0;
        let lists: Vec<&HintedTrackerLists> = match source {
            ReleaseSource::Regular => self.regular.iter().collect(),
            ReleaseSource::PartialReleased => self.partial_released.iter().collect(),
            ReleaseSource::Donated => vec![&self.donated],
        };
        for list in lists {
            list.for_each(&self.slab, |id, t| {
                if t.free_mapped_pages() == 0 {
                    return;
                }
                candidates.push((t.used_pages(), seq, id));
                seq += 1;
            });
        }
        candidates.sort_unstable_by_key(|&(used, seq, _)| (used, seq));
        candidates.truncate(CANDIDATES_FOR_RELEASING);
        candidates.into_iter().map(|(_, _, id)| id).collect()
    }

    fn release_candidates(
        &mut self,
        unback: &mut dyn MemoryModify,
        source: ReleaseSource,
        mut remaining: usize,
        count_as_partial: bool,
        hit_limit: bool,
    ) -> usize {
        let mut total = 0;
        while remaining > 0 {
            let candidates = self.select_candidates(source);
            if candidates.is_empty() {
                break;
            }
            let mut progressed = false;
            for id in candidates {
                if remaining == 0 {
                    break;
                }
                let n = self.release_tracker(unback, id, count_as_partial, hit_limit);
                if n > 0 {
                    progressed = true;
                    total += n;
                    remaining = remaining.saturating_sub(n);
                }
            }
            if !progressed {
                break;
            }
        }
        total
    }

    fn release_tracker(
        &mut self,
        unback: &mut dyn MemoryModify,
        id: TrackerId,
        count_as_partial: bool,
        hit_limit: bool,
    ) -> usize {
        self.unlink(id);
        let t = self.slab.get_mut(id);
        let released_before = t.released_pages();
        let newly = t.release_free(unback);
        let released_after = t.released_pages();
        let broken = usize::from(released_before == 0 && released_after > 0);
        if broken > 0 {
            log::debug!(
                "broke huge page at {}: {newly} pages subreleased",
                t.first_page()
            );
        }
        self.unmapped = self.unmapped - released_before + released_after;
        self.link(id);
        self.demand.report_subrelease(
            newly,
            broken,
            if count_as_partial { newly } else { 0 },
            hit_limit,
        );
        newly
    }

    // -- list maintenance --------------------------------------------------

    fn sample_demand(&mut self) {
        let now = (self.clock.now)();
        self.demand.report_demand(now, self.used_pages());
    }

    fn bucket_for(&self, t: &PageTracker, class: ListClass) -> usize {
        match (class, self.config.dense_tracker_sort) {
            (ListClass::Regular(Density::Dense), DenseTrackerSort::SpansAllocated) => {
                t.nallocs().min(PAGES_PER_HUGE_PAGE)
            }
            _ => t.longest_free_range(),
        }
    }

    fn link(&mut self, id: TrackerId) {
        let t = self.slab.get(id);
        let class = class_for(t);
        let bucket = self.bucket_for(t, class);
        let used = t.used_pages();
        let full = t.free_pages() == 0;
        let ever_released = t.ever_released();
        match class {
            ListClass::PartialReleased(d) => {
                self.used_in_partial_released[d.index()] += used;
            }
            ListClass::Released(d) => {
                self.used_in_released[d.index()] += used;
            }
            ListClass::Regular(_) if full && ever_released => {
                self.previously_released_full += 1;
            }
            _ => {}
        }
        let (list, slab) = self.parts(class);
        list.push_front(slab, bucket, id);
    }

    fn unlink(&mut self, id: TrackerId) {
        let t = self.slab.get(id);
        let home = t.home.expect("tracker not linked");
        let used = t.used_pages();
        let full = t.free_pages() == 0;
        let ever_released = t.ever_released();
        match home.class {
            ListClass::PartialReleased(d) => {
                self.used_in_partial_released[d.index()] -= used;
            }
            ListClass::Released(d) => {
                self.used_in_released[d.index()] -= used;
            }
            ListClass::Regular(_) if full && ever_released => {
                self.previously_released_full -= 1;
            }
            _ => {}
        }
        let (list, slab) = self.parts(home.class);
        list.remove(slab, id);
    }

    fn parts(&mut self, class: ListClass) -> (&mut HintedTrackerLists, &mut TrackerSlab) {
        let list = match class {
            ListClass::Regular(d) => &mut self.regular[d.index()],
            ListClass::Donated => &mut self.donated,
            ListClass::PartialReleased(d) => &mut self.partial_released[d.index()],
            ListClass::Released(d) => &mut self.released_lists[d.index()],
        };
        (list, &mut self.slab)
    }

    // -- statistics --------------------------------------------------------

    #[must_use]
    pub fn get_stats(&self) -> FillerStats {
        let mut s = FillerStats::default();
        for d in [Density::Sparse, Density::Dense] {
            let i = d.index();
            self.regular[i].for_each(&self.slab, |_, t| {
                s.n_total[i] += 1;
                if t.free_pages() == 0 {
                    s.n_full[i] += 1;
                } else {
                    s.n_partial[i] += 1;
                }
            });
            self.partial_released[i].for_each(&self.slab, |_, _| {
                s.n_total[i] += 1;
                s.n_partial_released[i] += 1;
            });
            self.released_lists[i].for_each(&self.slab, |_, _| {
                s.n_total[i] += 1;
                s.n_fully_released[i] += 1;
            });
        }
        // Donated huge pages count with the sparse partials.
        self.donated.for_each(&self.slab, |_, _| {
            s.n_total[Density::Sparse.index()] += 1;
            s.n_partial[Density::Sparse.index()] += 1;
        });
        for i in 0..DENSITY_KINDS {
            s.n_total[DENSITY_TOTAL] += s.n_total[i];
            s.n_full[DENSITY_TOTAL] += s.n_full[i];
            s.n_partial[DENSITY_TOTAL] += s.n_partial[i];
            s.n_partial_released[DENSITY_TOTAL] += s.n_partial_released[i];
            s.n_fully_released[DENSITY_TOTAL] += s.n_fully_released[i];
        }
        s
    }

    /// Human-readable report. The summary lines and histogram labels are
    /// scraped by monitoring; their tokens are stable.
    pub fn print(&self, out: &mut String, verbose: bool) {
        let stats = self.get_stats();
        let _ = writeln!(
            out,
            "HugePageFiller: densely pack small requests into hugepages"
        );
        for (label, i) in [
            ("Overall", DENSITY_TOTAL),
            ("those with sparsely-accessed spans", Density::Sparse.index()),
            ("those with densely-accessed spans", Density::Dense.index()),
        ] {
            let _ = writeln!(
                out,
                "HugePageFiller: {label}, {} total, {} full, {} partial, {} released ({} partially), 0 quarantined",
                stats.n_total[i],
                stats.n_full[i],
                stats.n_partial[i],
                stats.n_released(i),
                stats.n_partial_released[i]
            );
        }

        let capacity = self.capacity_pages();
        let free = self.free_pages();
        let _ = writeln!(
            out,
            "HugePageFiller: {free} pages free in {} hugepages, {:.4} free",
            self.size,
            ratio(free, capacity)
        );
        let non_full = stats.n_total[DENSITY_TOTAL] - stats.n_full[DENSITY_TOTAL];
        let _ = writeln!(
            out,
            "HugePageFiller: among non-fulls, {:.4} free",
            ratio(free, non_full * PAGES_PER_HUGE_PAGE)
        );
        let _ = writeln!(
            out,
            "HugePageFiller: {} used pages in subreleased hugepages ({} of them in partially released)",
            self.used_pages_in_any_subreleased(),
            self.used_pages_in_partial_released()
        );
        let n_released = stats.n_released(DENSITY_TOTAL);
        let _ = writeln!(
            out,
            "HugePageFiller: {n_released} hugepages partially released, {:.4} released",
            ratio(self.unmapped, n_released * PAGES_PER_HUGE_PAGE)
        );
        let _ = writeln!(
            out,
            "HugePageFiller: {:.4} of used pages hugepageable",
            self.hugepage_frac()
        );

        let sub = self.demand.stats();
        let _ = writeln!(
            out,
            "HugePageFiller: Since startup, {} pages subreleased, {} hugepages broken, ({} pages, {} hugepages due to reaching memory limit)",
            sub.total_pages_subreleased + sub.num_pages_subreleased,
            sub.total_hugepages_broken + sub.num_hugepages_broken,
            sub.total_pages_subreleased_due_to_limit,
            sub.total_hugepages_broken_due_to_limit
        );
        let _ = writeln!(
            out,
            "HugePageFiller: {} hugepages became full after being previously released, out of which 0 pages are hugepage backed.",
            self.previously_released_full
        );

        if verbose {
            let _ = writeln!(out, "\nHugePageFiller: fullness histograms");
            self.print_histograms(out);
        }

        let ledger = self.demand.ledger_summary();
        let _ = writeln!(
            out,
            "\nHugePageFiller: Since the start of the execution, {} subreleases ({} pages) were skipped due to either recent ({}s) peaks, or the sum of short-term ({}s) fluctuations and long-term ({}s) trends.",
            ledger.total_decisions,
            ledger.total_pages,
            ledger.last_intervals.peak_interval.as_secs(),
            ledger.last_intervals.short_interval.as_secs(),
            ledger.last_intervals.long_interval.as_secs()
        );
        let evaluated = ledger.total_decisions - ledger.pending_decisions;
        let evaluated_pages = ledger.total_pages - ledger.pending_pages;
        let _ = writeln!(
            out,
            "HugePageFiller: {:.4}% of decisions confirmed correct, {} pending ({:.4}% of pages, {} pending), as per anticipated 300s realized fragmentation.",
            percent(ledger.confirmed_decisions, evaluated),
            ledger.pending_decisions,
            percent(ledger.confirmed_pages, evaluated_pages),
            ledger.pending_pages
        );

        let (window_pages, window_partial, window_broken) = self.demand.window_subreleased();
        let _ = writeln!(
            out,
            "HugePageFiller: Subrelease stats last 10 min: total {window_pages} pages subreleased ({window_partial} pages from partial allocs), {window_broken} hugepages broken"
        );
    }

    fn class_lists(&self) -> [(&'static str, &HintedTrackerLists); 7] {
        [
            ("sparsely-accessed regular", &self.regular[0]),
            ("densely-accessed regular", &self.regular[1]),
            ("donated", &self.donated),
            (
                "sparsely-accessed partial released",
                &self.partial_released[0],
            ),
            (
                "densely-accessed partial released",
                &self.partial_released[1],
            ),
            ("sparsely-accessed released", &self.released_lists[0]),
            ("densely-accessed released", &self.released_lists[1]),
        ]
    }

    fn print_histograms(&self, out: &mut String) {
        for (label, list) in self.class_lists() {
            let mut h = PageHisto::new(0);
            list.for_each(&self.slab, |_, t| h.record(t.free_pages()));
            h.print(
                out,
                &format!("# of {label} hps with a<= # of free pages <b"),
            );
        }
        for (label, list) in self.class_lists() {
            if label == "donated" {
                continue;
            }
            let mut h = PageHisto::new(0);
            list.for_each(&self.slab, |_, t| h.record(t.longest_free_range()));
            h.print(
                out,
                &format!("# of {label} hps with a<= longest free range <b"),
            );
        }
        for (label, list) in self.class_lists() {
            if label == "donated" {
                continue;
            }
            let mut h = PageHisto::new(1);
            list.for_each(&self.slab, |_, t| h.record(t.nallocs()));
            h.print(
                out,
                &format!("# of {label} hps with a<= # of allocations <b"),
            );
        }
        let now = (self.clock.now)();
        let freq = (self.clock.freq)();
        for (label, list) in self.class_lists() {
            let mut h = LifetimeHisto::new();
            list.for_each(&self.slab, |_, t| {
                let ms = ((now - t.creation_time()).max(0) as f64 / freq * 1000.0) as usize;
                h.record(ms);
            });
            h.print(
                out,
                &format!("# of {label} hps with lifetime a <= # hps < b"),
            );
        }
    }

    /// Residency histograms: per tracker class, how many native pages of
    /// each huge page the kernel reports as never backed. Only meaningful
    /// when the embedding system supplies a probe.
    pub fn print_residency(&self, out: &mut String, residency: &mut dyn Residency) {
        let native_pages = residency.native_pages_in_huge_page();
        for (label, list) in self.class_lists() {
            let mut h = NativePageHisto::new(native_pages);
            list.for_each(&self.slab, |_, t| {
                if let Some(bitmaps) = residency.unbacked_and_swapped(t.first_page().in_bytes()) {
                    h.record(bitmaps.unbacked.count_ones(..));
                }
            });
            h.print(
                out,
                &format!("# of {label} hps with a <= # of unbacked < b"),
            );
        }
    }

    /// Machine-readable counters in the nested-region text format.
    pub fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_>) {
        let stats = self.get_stats();
        region.print_i64(
            "filler_full_huge_pages",
            stats.n_full[DENSITY_TOTAL] as i64,
        );
        region.print_i64(
            "filler_partial_huge_pages",
            stats.n_partial[DENSITY_TOTAL] as i64,
        );
        region.print_i64(
            "filler_released_huge_pages",
            stats.n_fully_released[DENSITY_TOTAL] as i64,
        );
        region.print_i64(
            "filler_partially_released_huge_pages",
            stats.n_partial_released[DENSITY_TOTAL] as i64,
        );
        region.print_i64("filler_donated_huge_pages", self.donated.len() as i64);
        region.print_i64("filler_free_pages", self.free_pages() as i64);
        region.print_i64("filler_unmapped_bytes", (self.unmapped * PAGE_SIZE) as i64);
        region.print_i64(
            "filler_used_pages_in_subreleased",
            self.used_pages_in_any_subreleased() as i64,
        );
        region.print_i64(
            "filler_used_pages_in_partial_released",
            self.used_pages_in_partial_released() as i64,
        );
        region.print_i64(
            "filler_previously_released_huge_pages",
            self.previously_released_full as i64,
        );
        region.print_double("filler_hugepageable_used_fraction", self.hugepage_frac());

        let sub = self.demand.stats();
        region.print_i64(
            "filler_num_pages_subreleased",
            (sub.total_pages_subreleased + sub.num_pages_subreleased) as i64,
        );
        region.print_i64(
            "filler_num_hugepages_broken",
            (sub.total_hugepages_broken + sub.num_hugepages_broken) as i64,
        );
        region.print_i64(
            "filler_num_pages_subreleased_due_to_limit",
            sub.total_pages_subreleased_due_to_limit as i64,
        );
        region.print_i64(
            "filler_num_hugepages_broken_due_to_limit",
            sub.total_hugepages_broken_due_to_limit as i64,
        );

        let ledger = self.demand.ledger_summary();
        let mut skip = region.sub_region("filler_skipped_subrelease");
        skip.print_i64("skipped_subrelease_count", ledger.total_decisions as i64);
        skip.print_i64("skipped_subrelease_pages", ledger.total_pages as i64);
        skip.print_i64(
            "correctly_skipped_subrelease_count",
            ledger.confirmed_decisions as i64,
        );
        skip.print_i64(
            "correctly_skipped_subrelease_pages",
            ledger.confirmed_pages as i64,
        );
        skip.print_i64(
            "pending_skipped_subrelease_count",
            ledger.pending_decisions as i64,
        );
        skip.print_i64(
            "pending_skipped_subrelease_pages",
            ledger.pending_pages as i64,
        );
    }

    /// Debug sweep of the aggregate accounting against the trackers.
    #[cfg(test)]
    pub(crate) fn check_counters(&self) {
        let mut used = 0;
        let mut released = 0;
        let mut listed = 0;
        for (_, t) in self.slab.iter() {
            t.check_invariants();
            used += t.used_pages();
            released += t.released_pages();
            listed += 1;
        }
        assert_eq!(listed, self.size);
        assert_eq!(used, self.used_pages());
        assert_eq!(released, self.unmapped);
        assert_eq!(
            self.pages_allocated(),
            self.pages_allocated[0] + self.pages_allocated[1]
        );
        assert_eq!(
            self.capacity_pages(),
            self.used_pages() + self.free_pages() + self.unmapped
        );
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn percent(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 * 100.0 / den as f64
    }
}
