use std::collections::VecDeque;
use std::time::Duration;

use crate::stats::SubreleaseStats;

/// Ring capacity. At one-second epochs this gives a ten-minute window, which
/// bounds every configurable skip-subrelease interval.
pub(crate) const EPOCHS: usize = 600;

/// How long a skip decision stays pending before its correctness verdict.
pub(crate) const EVAL_HORIZON: Duration = Duration::from_secs(300);

const MAX_PENDING: usize = 16;

/// Windows consulted before subreleasing. A zero duration means "not used";
/// all-zero disables the heuristic entirely.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct SkipSubreleaseIntervals {
    pub peak_interval: Duration,
    pub short_interval: Duration,
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    #[must_use]
    pub fn enabled(&self) -> bool {
        !self.peak_interval.is_zero()
            || !self.short_interval.is_zero()
            || !self.long_interval.is_zero()
    }
}

/// One ring entry. An epoch with no demand samples stays empty
/// (`min > max`) and is invisible to the window queries; demand standing
/// still while the filler is idle produces no entries.
#[derive(Clone, Copy)]
struct Epoch {
    min_demand: usize,
    max_demand: usize,
    pages_subreleased: usize,
    partial_pages_subreleased: usize,
    hugepages_broken: usize,
}

impl Epoch {
    const EMPTY: Epoch = Epoch {
        min_demand: usize::MAX,
        max_demand: 0,
        pages_subreleased: 0,
        partial_pages_subreleased: 0,
        hugepages_broken: 0,
    };

    fn is_empty(&self) -> bool {
        self.min_demand > self.max_demand
    }
}

struct PendingDecision {
    decided_at: i64,
    /// Demand inside the decision epoch does not count toward the verdict;
    /// only later epochs do.
    decision_epoch_end: i64,
    required: usize,
    pages: usize,
    max_demand_after: usize,
}

/// Summary of the skip-subrelease ledger for text output.
#[derive(Clone, Copy, Default)]
pub(crate) struct SkipLedgerSummary {
    pub total_decisions: usize,
    pub total_pages: usize,
    pub confirmed_decisions: usize,
    pub confirmed_pages: usize,
    pub pending_decisions: usize,
    pub pending_pages: usize,
    pub last_intervals: SkipSubreleaseIntervals,
}

/// Per-epoch demand history plus subrelease accounting.
///
/// All methods take the current tick explicitly; the filler supplies its
/// injected clock's reading, tests supply arbitrary ticks.
pub(crate) struct SubreleaseTracker {
    epoch_ticks: i64,
    ring: Vec<Epoch>,
    current_epoch: i64,
    start_epoch: i64,
    stats: SubreleaseStats,
    pending: VecDeque<PendingDecision>,
    total_skipped_decisions: usize,
    total_skipped_pages: usize,
    confirmed_decisions: usize,
    confirmed_pages: usize,
    last_intervals: SkipSubreleaseIntervals,
}

impl SubreleaseTracker {
    pub fn new(epoch_ticks: i64, now: i64) -> Self {
        assert!(epoch_ticks > 0);
        let epoch = now.div_euclid(epoch_ticks);
        Self {
            epoch_ticks,
            ring: vec![Epoch::EMPTY; EPOCHS],
            current_epoch: epoch,
            start_epoch: epoch,
            stats: SubreleaseStats::default(),
            pending: VecDeque::new(),
            total_skipped_decisions: 0,
            total_skipped_pages: 0,
            confirmed_decisions: 0,
            confirmed_pages: 0,
            last_intervals: SkipSubreleaseIntervals::default(),
        }
    }

    fn slot(&mut self, epoch: i64) -> &mut Epoch {
        let index = epoch.rem_euclid(EPOCHS as i64) as usize;
        &mut self.ring[index]
    }

    fn horizon_ticks(&self) -> i64 {
        EVAL_HORIZON.as_secs() as i64 * self.epoch_ticks
    }

    /// Advance the ring to `now`. Epochs the filler slept through stay
    /// empty; the not-yet-integrated subrelease counters roll into the
    /// totals and are stamped into the epoch the advance lands on.
    fn advance(&mut self, now: i64) {
        let epoch = now.div_euclid(self.epoch_ticks);
        if epoch <= self.current_epoch {
            return;
        }

        let rolled_pages = self.stats.num_pages_subreleased;
        let rolled_partial = self.stats.num_partial_alloc_pages_subreleased;
        let rolled_broken = self.stats.num_hugepages_broken;
        self.stats.total_pages_subreleased += rolled_pages;
        self.stats.total_partial_alloc_pages_subreleased += rolled_partial;
        self.stats.total_hugepages_broken += rolled_broken;
        self.stats.num_pages_subreleased = 0;
        self.stats.num_partial_alloc_pages_subreleased = 0;
        self.stats.num_hugepages_broken = 0;
        self.stats.num_pages_subreleased_due_to_limit = 0;
        self.stats.num_hugepages_broken_due_to_limit = 0;

        let steps = (epoch - self.current_epoch).min(EPOCHS as i64);
        for i in 1..=steps {
            *self.slot(epoch - steps + i) = Epoch::EMPTY;
        }
        let newest = self.slot(epoch);
        newest.pages_subreleased += rolled_pages;
        newest.partial_pages_subreleased += rolled_partial;
        newest.hugepages_broken += rolled_broken;
        self.current_epoch = epoch;
    }

    /// Record a demand sample. Every filler entry point reports here so the
    /// series sees a consistent history.
    pub fn report_demand(&mut self, now: i64, demand: usize) {
        self.advance(now);

        let horizon = self.horizon_ticks();
        for entry in &mut self.pending {
            if now >= entry.decision_epoch_end && now <= entry.decided_at + horizon {
                entry.max_demand_after = entry.max_demand_after.max(demand);
            }
        }
        self.evaluate_pending(now);

        let epoch = self.current_epoch;
        let slot = self.slot(epoch);
        slot.min_demand = slot.min_demand.min(demand);
        slot.max_demand = slot.max_demand.max(demand);
    }

    fn evaluate_pending(&mut self, now: i64) {
        let horizon = self.horizon_ticks();
        while let Some(front) = self.pending.front() {
            if now <= front.decided_at + horizon {
                break;
            }
            let entry = self.pending.pop_front().expect("checked front");
            if entry.max_demand_after >= entry.required {
                self.confirmed_decisions += 1;
                self.confirmed_pages += entry.pages;
            }
        }
    }

    /// Record that `pages` were withheld from a release because recent
    /// demand (`required`) suggested imminent reuse.
    pub fn record_skip(
        &mut self,
        now: i64,
        pages: usize,
        required: usize,
        intervals: SkipSubreleaseIntervals,
    ) {
        self.total_skipped_decisions += 1;
        self.total_skipped_pages += pages;
        self.last_intervals = intervals;
        if self.pending.len() == MAX_PENDING {
            // Ledger full: the oldest decision loses its verdict.
            self.pending.pop_front();
        }
        let epoch = now.div_euclid(self.epoch_ticks);
        self.pending.push_back(PendingDecision {
            decided_at: now,
            decision_epoch_end: (epoch + 1) * self.epoch_ticks,
            required,
            pages,
            max_demand_after: 0,
        });
    }

    pub fn report_subrelease(
        &mut self,
        pages: usize,
        broken: usize,
        partial_pages: usize,
        due_to_limit: bool,
    ) {
        self.stats.num_pages_subreleased += pages;
        self.stats.num_hugepages_broken += broken;
        self.stats.num_partial_alloc_pages_subreleased += partial_pages;
        if due_to_limit {
            self.stats.num_pages_subreleased_due_to_limit += pages;
            self.stats.num_hugepages_broken_due_to_limit += broken;
            self.stats.total_pages_subreleased_due_to_limit += pages;
            self.stats.total_hugepages_broken_due_to_limit += broken;
        }
    }

    #[must_use]
    pub fn stats(&self) -> SubreleaseStats {
        self.stats
    }

    /// Windows reach back `ceil(window)` whole epochs plus the current one.
    fn epochs_in(&self, window: Duration) -> impl Iterator<Item = &Epoch> {
        let back = (window.as_secs_f64().ceil() as i64).clamp(0, EPOCHS as i64 - 1);
        let newest = self.current_epoch;
        let oldest = (newest - back)
            .max(self.start_epoch)
            .max(newest - EPOCHS as i64 + 1);
        (oldest..=newest).map(move |e| {
            let index = e.rem_euclid(EPOCHS as i64) as usize;
            &self.ring[index]
        })
    }

    /// Highest demand sampled inside `window`.
    #[must_use]
    pub fn demand_peak(&self, window: Duration) -> usize {
        self.epochs_in(window)
            .filter(|e| !e.is_empty())
            .map(|e| e.max_demand)
            .max()
            .unwrap_or(0)
    }

    /// Long-term trend: the highest per-epoch demand floor inside `window`.
    #[must_use]
    pub fn demand_trend(&self, window: Duration) -> usize {
        if window.is_zero() {
            return 0;
        }
        self.epochs_in(window)
            .filter(|e| !e.is_empty())
            .map(|e| e.min_demand)
            .max()
            .unwrap_or(0)
    }

    /// Short-term fluctuation: the widest per-epoch demand swing inside
    /// `window`.
    #[must_use]
    pub fn demand_fluctuation(&self, window: Duration) -> usize {
        if window.is_zero() {
            return 0;
        }
        self.epochs_in(window)
            .filter(|e| !e.is_empty())
            .map(|e| e.max_demand - e.min_demand)
            .max()
            .unwrap_or(0)
    }

    /// Demand the skip policy must assume will return, before the filler's
    /// capacity cap. The short+long estimate cannot exceed the demand peak
    /// actually observed over those windows.
    #[must_use]
    pub fn required_demand(&self, intervals: SkipSubreleaseIntervals) -> usize {
        if !intervals.enabled() {
            return 0;
        }
        if !intervals.peak_interval.is_zero() {
            return self.demand_peak(intervals.peak_interval);
        }
        let estimate = self.demand_trend(intervals.long_interval)
            + self.demand_fluctuation(intervals.short_interval);
        let cap_window = intervals.short_interval.max(intervals.long_interval);
        estimate.min(self.demand_peak(cap_window))
    }

    /// Pages/partial-pages/hugepages subreleased inside the ring window,
    /// plus whatever is still accumulating in the current epoch.
    #[must_use]
    pub fn window_subreleased(&self) -> (usize, usize, usize) {
        let mut pages = self.stats.num_pages_subreleased;
        let mut partial = self.stats.num_partial_alloc_pages_subreleased;
        let mut broken = self.stats.num_hugepages_broken;
        let newest = self.current_epoch;
        let oldest = (newest - EPOCHS as i64 + 1).max(self.start_epoch);
        for e in oldest..=newest {
            let epoch = &self.ring[e.rem_euclid(EPOCHS as i64) as usize];
            pages += epoch.pages_subreleased;
            partial += epoch.partial_pages_subreleased;
            broken += epoch.hugepages_broken;
        }
        (pages, partial, broken)
    }

    #[must_use]
    pub fn ledger_summary(&self) -> SkipLedgerSummary {
        SkipLedgerSummary {
            total_decisions: self.total_skipped_decisions,
            total_pages: self.total_skipped_pages,
            confirmed_decisions: self.confirmed_decisions,
            confirmed_pages: self.confirmed_pages,
            pending_decisions: self.pending.len(),
            pending_pages: self.pending.iter().map(|p| p.pages).sum(),
            last_intervals: self.last_intervals,
        }
    }
}
