//! Work-item views for the simple and hierarchical dispatch paths.
//!
//! Views are pure projections over coordinates computed by the dispatcher;
//! they own nothing and borrow nothing mutable. The nd-range counterpart
//! lives in [`crate::group`].

use crate::coord::{linear_index, Id, Range};

/// A single point of a (range, offset) dispatch, or one of the coordinate
/// facets of an [`NdItem`](crate::group::NdItem).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item<const D: usize> {
    id: Id<D>,
    range: Range<D>,
    offset: Id<D>,
}

impl<const D: usize> Item<D> {
    pub(crate) fn new(id: Id<D>, range: Range<D>) -> Self {
        Self {
            id,
            range,
            offset: Id::zero(),
        }
    }

    pub(crate) fn with_offset(id: Id<D>, range: Range<D>, offset: Id<D>) -> Self {
        Self { id, range, offset }
    }

    /// The item's id, including any dispatch offset.
    #[inline(always)]
    pub fn id(&self) -> Id<D> {
        self.id
    }

    #[inline(always)]
    pub fn id_in_dimension(&self, dimension: usize) -> usize {
        self.id[dimension]
    }

    #[inline(always)]
    pub fn range(&self) -> Range<D> {
        self.range
    }

    #[inline(always)]
    pub fn offset(&self) -> Id<D> {
        self.offset
    }

    /// Row-major linear id within the range, not counting the offset.
    #[inline]
    pub fn linear_id(&self) -> usize {
        linear_index(self.id - self.offset, self.range)
    }
}

/// A work-item of a hierarchical (work-group) dispatch.
///
/// Distinguishes the *logical* local coordinate (within the flexible range
/// of a `parallel_for_work_item` invocation) from the *physical* one (within
/// the work-group's actual extent). Without a flexible range the two
/// coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HItem<const D: usize> {
    global: Item<D>,
    logical_local: Item<D>,
    physical_local: Item<D>,
}

impl<const D: usize> HItem<D> {
    pub(crate) fn new(global: Item<D>, logical_local: Item<D>, physical_local: Item<D>) -> Self {
        Self {
            global,
            logical_local,
            physical_local,
        }
    }

    #[inline(always)]
    pub fn global(&self) -> Item<D> {
        self.global
    }

    #[inline(always)]
    pub fn logical_local(&self) -> Item<D> {
        self.logical_local
    }

    #[inline(always)]
    pub fn physical_local(&self) -> Item<D> {
        self.physical_local
    }

    #[inline(always)]
    pub fn local(&self) -> Item<D> {
        self.logical_local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_id_ignores_offset() {
        let item = Item::with_offset(Id::new([3, 4]), Range::new([4, 8]), Id::new([1, 2]));
        assert_eq!(item.id(), Id::new([3, 4]));
        assert_eq!(item.linear_id(), 2 * 8 + 2);
    }

    #[test]
    fn facets_of_h_item() {
        let global = Item::new(Id::new([5]), Range::new([16]));
        let local = Item::new(Id::new([1]), Range::new([4]));
        let h_item = HItem::new(global, local, local);
        assert_eq!(h_item.global().linear_id(), 5);
        assert_eq!(h_item.local(), h_item.physical_local());
    }
}
