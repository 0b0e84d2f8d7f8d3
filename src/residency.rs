use fixedbitset::FixedBitSet;

/// Per-native-page residency report for one huge page.
///
/// Native pages are the kernel's unit and may be finer or coarser than the
/// tracker's page unit; both bitsets have one bit per native page.
pub struct SinglePageBitmaps {
    /// Native pages the kernel never backed.
    pub unbacked: FixedBitSet,
    /// Native pages currently swapped out.
    pub swapped: FixedBitSet,
}

impl SinglePageBitmaps {
    #[must_use]
    pub fn empty(native_pages: usize) -> Self {
        Self {
            unbacked: FixedBitSet::with_capacity(native_pages),
            swapped: FixedBitSet::with_capacity(native_pages),
        }
    }
}

/// Optional probe into the OS view of which pages inside a huge page are
/// resident. Only consumed by residency statistics; the allocator itself
/// never depends on it.
pub trait Residency {
    /// Residency bitmaps for the huge page starting at `first_page_addr`.
    /// `None` when the probe has no data for the region.
    fn unbacked_and_swapped(&mut self, first_page_addr: usize) -> Option<SinglePageBitmaps>;

    /// Number of native pages covered by one huge page on this system.
    fn native_pages_in_huge_page(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bitmaps_sized() {
        let b = SinglePageBitmaps::empty(512);
        assert_eq!(b.unbacked.len(), 512);
        assert_eq!(b.swapped.len(), 512);
        assert_eq!(b.unbacked.count_ones(..), 0);
    }
}
