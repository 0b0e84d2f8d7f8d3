use fixedbitset::FixedBitSet;

use crate::common::Density;
use crate::tracker::PageTracker;

/// Slab index naming a live tracker. Stable for the tracker's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TrackerId(u32);

impl TrackerId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which filler list a tracker currently lives on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ListClass {
    Regular(Density),
    Donated,
    PartialReleased(Density),
    Released(Density),
}

/// Current list membership: class plus the bucket index inside that class's
/// hinted lists. Written on insert, cleared on removal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ListHome {
    pub class: ListClass,
    pub bucket: usize,
}

/// Arena owning every live tracker, addressed by [`TrackerId`]. Freed slots
/// are recycled through a free list.
pub struct TrackerSlab {
    slots: Vec<Option<PageTracker>>,
    free: Vec<u32>,
    len: usize,
}

impl TrackerSlab {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, tracker: PageTracker) -> TrackerId {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            debug_assert!(self.slots[slot as usize].is_none());
            self.slots[slot as usize] = Some(tracker);
            TrackerId(slot)
        } else {
            self.slots.push(Some(tracker));
            TrackerId((self.slots.len() - 1) as u32)
        }
    }

    pub fn remove(&mut self, id: TrackerId) -> PageTracker {
        let tracker = self.slots[id.index()]
            .take()
            .expect("remove of a dead tracker id");
        debug_assert!(tracker.home.is_none(), "tracker removed while still listed");
        self.free.push(id.0);
        self.len -= 1;
        tracker
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: TrackerId) -> &PageTracker {
        self.slots[id.index()].as_ref().expect("dead tracker id")
    }

    #[inline]
    #[must_use]
    pub fn get_mut(&mut self, id: TrackerId) -> &mut PageTracker {
        self.slots[id.index()].as_mut().expect("dead tracker id")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackerId, &PageTracker)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|t| (TrackerId(i as u32), t)))
    }
}

impl Default for TrackerSlab {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of intrusive doubly-linked lists indexed by a fullness statistic,
/// with a bitset hint over the nonempty buckets so both best-fit (lowest
/// adequate bucket) and fullest-first (highest bucket) queries skip empty
/// buckets.
pub(crate) struct HintedTrackerLists {
    class: ListClass,
    heads: Vec<Option<TrackerId>>,
    nonempty: FixedBitSet,
    len: usize,
}

impl HintedTrackerLists {
    pub fn new(class: ListClass, buckets: usize) -> Self {
        Self {
            class,
            heads: vec![None; buckets],
            nonempty: FixedBitSet::with_capacity(buckets),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, slab: &mut TrackerSlab, bucket: usize, id: TrackerId) {
        debug_assert!(bucket < self.heads.len());
        let old_head = self.heads[bucket];
        {
            let t = slab.get_mut(id);
            debug_assert!(t.home.is_none(), "tracker already on a list");
            t.home = Some(ListHome {
                class: self.class,
                bucket,
            });
            t.prev = None;
            t.next = old_head;
        }
        if let Some(h) = old_head {
            slab.get_mut(h).prev = Some(id);
        }
        self.heads[bucket] = Some(id);
        self.nonempty.insert(bucket);
        self.len += 1;
    }

    pub fn remove(&mut self, slab: &mut TrackerSlab, id: TrackerId) {
        let (home, prev, next) = {
            let t = slab.get_mut(id);
            let home = t.home.take().expect("tracker not on a list");
            let prev = t.prev.take();
            let next = t.next.take();
            (home, prev, next)
        };
        debug_assert_eq!(home.class, self.class, "tracker removed from the wrong list");
        match prev {
            Some(p) => slab.get_mut(p).next = next,
            None => {
                debug_assert_eq!(self.heads[home.bucket], Some(id));
                self.heads[home.bucket] = next;
            }
        }
        if let Some(n) = next {
            slab.get_mut(n).prev = prev;
        }
        if self.heads[home.bucket].is_none() {
            self.nonempty.set(home.bucket, false);
        }
        self.len -= 1;
    }

    /// Head of the first nonempty bucket with index `>= min`.
    pub fn peek_least(&self, min: usize) -> Option<TrackerId> {
        self.nonempty
            .ones()
            .find(|&b| b >= min)
            .and_then(|b| self.heads[b])
    }

    /// Nonempty bucket indices in descending order.
    pub fn buckets_desc(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.heads.len())
            .rev()
            .filter(move |&b| self.nonempty.contains(b))
    }

    /// Trackers in one bucket, head first.
    pub fn bucket_ids(&self, slab: &TrackerSlab, bucket: usize) -> Vec<TrackerId> {
        let mut out = Vec::new();
        let mut cursor = self.heads[bucket];
        while let Some(id) = cursor {
            out.push(id);
            cursor = slab.get(id).next;
        }
        out
    }

    /// Visit every tracker, ascending by bucket, head first within a bucket.
    pub fn for_each(&self, slab: &TrackerSlab, mut f: impl FnMut(TrackerId, &PageTracker)) {
        for bucket in self.nonempty.ones() {
            let mut cursor = self.heads[bucket];
            while let Some(id) = cursor {
                let t = slab.get(id);
                f(id, t);
                cursor = t.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;

    fn slab_with(n: usize) -> (TrackerSlab, Vec<TrackerId>) {
        let mut slab = TrackerSlab::new();
        let ids = (0..n)
            .map(|i| slab.insert(PageTracker::new(PageId(i * 256), false, 0)))
            .collect();
        (slab, ids)
    }

    #[test]
    fn test_slab_insert_remove_recycles() {
        let (mut slab, ids) = slab_with(3);
        assert_eq!(slab.len(), 3);
        let t = slab.remove(ids[1]);
        assert_eq!(t.first_page(), PageId(256));
        assert_eq!(slab.len(), 2);
        // The freed slot is reused.
        let id = slab.insert(PageTracker::new(PageId(999), false, 0));
        assert_eq!(id, ids[1]);
        assert_eq!(slab.len(), 3);
        assert_eq!(slab.iter().count(), 3);
    }

    #[test]
    #[should_panic(expected = "dead tracker id")]
    fn test_slab_get_dead_id_panics() {
        let (mut slab, ids) = slab_with(1);
        slab.remove(ids[0]);
        let _ = slab.get(ids[0]);
    }

    #[test]
    fn test_hinted_lists_push_peek_remove() {
        let (mut slab, ids) = slab_with(4);
        let mut lists = HintedTrackerLists::new(ListClass::Regular(Density::Sparse), 257);

        lists.push_front(&mut slab, 10, ids[0]);
        lists.push_front(&mut slab, 10, ids[1]); // new head of bucket 10
        lists.push_front(&mut slab, 40, ids[2]);
        assert_eq!(lists.len(), 3);

        // Best fit: lowest adequate bucket, head first.
        assert_eq!(lists.peek_least(0), Some(ids[1]));
        assert_eq!(lists.peek_least(11), Some(ids[2]));
        assert_eq!(lists.peek_least(41), None);

        // Removing the head promotes its successor; removing the last entry
        // of a bucket clears the hint.
        lists.remove(&mut slab, ids[1]);
        assert_eq!(lists.peek_least(0), Some(ids[0]));
        lists.remove(&mut slab, ids[0]);
        assert_eq!(lists.peek_least(0), Some(ids[2]));
        lists.remove(&mut slab, ids[2]);
        assert!(lists.is_empty());
        assert_eq!(lists.peek_least(0), None);
    }

    #[test]
    fn test_hinted_lists_middle_removal() {
        let (mut slab, ids) = slab_with(3);
        let mut lists = HintedTrackerLists::new(ListClass::Donated, 257);
        for &id in &ids {
            lists.push_front(&mut slab, 5, id);
        }
        // Order in bucket 5 is now ids[2], ids[1], ids[0].
        lists.remove(&mut slab, ids[1]);
        assert_eq!(lists.bucket_ids(&slab, 5), vec![ids[2], ids[0]]);
        assert_eq!(lists.len(), 2);
    }

    #[test]
    fn test_buckets_desc_order() {
        let (mut slab, ids) = slab_with(3);
        let mut lists = HintedTrackerLists::new(ListClass::Regular(Density::Dense), 257);
        lists.push_front(&mut slab, 3, ids[0]);
        lists.push_front(&mut slab, 100, ids[1]);
        lists.push_front(&mut slab, 256, ids[2]);
        let desc: Vec<usize> = lists.buckets_desc().collect();
        assert_eq!(desc, vec![256, 100, 3]);
    }

    #[test]
    fn test_for_each_visits_all() {
        let (mut slab, ids) = slab_with(4);
        let mut lists = HintedTrackerLists::new(ListClass::Released(Density::Sparse), 257);
        lists.push_front(&mut slab, 1, ids[0]);
        lists.push_front(&mut slab, 1, ids[1]);
        lists.push_front(&mut slab, 7, ids[2]);
        lists.push_front(&mut slab, 200, ids[3]);
        let mut seen = Vec::new();
        lists.for_each(&slab, |id, _| seen.push(id));
        assert_eq!(seen, vec![ids[1], ids[0], ids[2], ids[3]]);
    }
}
