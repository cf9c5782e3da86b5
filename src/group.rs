//! Work-group, sub-group and nd-item views over the concurrent records.
//!
//! One [`ConcurrentGroup`]/[`ConcurrentSubGroup`]/[`ConcurrentItem`] record
//! exists per fiber-pool slot and is reused as fibers advance through group
//! instances. The public [`Group`], [`SubGroup`] and [`NdItem`] views are
//! cheap projections handed to the user kernel; they combine the static
//! coordinates of the calling work-item with a shared handle on the
//! concurrent record so that collectives can rendezvous.
//!
//! All sharing is `Rc`/`RefCell`/`Cell` based: the simulator is single
//! threaded and control only changes hands at explicit fiber switches.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::arena::Allocation;
use crate::coord::{linear_index_to_id, Id, Range};
use crate::group_op::{GroupLike, GroupOperationRecord, MemoryScope};
use crate::item::{HItem, Item};

pub(crate) mod sealed {
    pub trait Sealed {}
}

////////////////////////////////////////////////////////////////////////////////
// Concurrent records
////////////////////////////////////////////////////////////////////////////////

/// Per-fiber mutable state, reused across all group instances the fiber
/// executes.
#[derive(Debug, Default)]
pub(crate) struct ConcurrentItem {
    /// Number of work-group operations entered in the current group
    /// instance.
    pub group_ops_reached: Cell<usize>,
    /// Number of sub-group operations entered in the current sub-group
    /// instance.
    pub sub_group_ops_reached: Cell<usize>,
}

/// State of one work-group *instance* (one `group_linear_id`).
#[derive(Debug, Default)]
pub(crate) struct GroupInstance {
    pub group_linear_id: usize,
    /// Work-items that have finished the kernel body for this instance.
    pub items_exited: usize,
    /// Operation log, indexed by arrival order.
    pub operations: Vec<GroupOperationRecord>,
}

impl GroupInstance {
    pub fn new(group_linear_id: usize) -> Self {
        Self {
            group_linear_id,
            ..Self::default()
        }
    }
}

/// Shared state of one concurrent work-group slot.
#[derive(Debug)]
pub(crate) struct ConcurrentGroup {
    pub instance: RefCell<GroupInstance>,
    /// One allocation per local-memory requirement, owned for the whole
    /// dispatch and reused by every instance this slot executes.
    pub allocations: Vec<Allocation>,
}

impl ConcurrentGroup {
    pub fn new(allocations: Vec<Allocation>) -> Self {
        Self {
            instance: RefCell::new(GroupInstance::default()),
            allocations,
        }
    }
}

/// State of one sub-group *instance*.
#[derive(Debug, Default)]
pub(crate) struct SubGroupInstance {
    pub sub_group_linear_id: usize,
    pub operations: Vec<GroupOperationRecord>,
}

impl SubGroupInstance {
    pub fn new(sub_group_linear_id: usize) -> Self {
        Self {
            sub_group_linear_id,
            operations: Vec::new(),
        }
    }
}

/// Shared state of one concurrent sub-group slot.
#[derive(Debug, Default)]
pub(crate) struct ConcurrentSubGroup {
    pub instance: RefCell<SubGroupInstance>,
}

////////////////////////////////////////////////////////////////////////////////
// Group
////////////////////////////////////////////////////////////////////////////////

/// A work-group, as seen from one of its work-items.
#[derive(Clone)]
pub struct Group<const D: usize> {
    local_item: Item<D>,
    global_item: Item<D>,
    group_item: Item<D>,
    concurrent: Rc<ConcurrentGroup>,
    item: Rc<ConcurrentItem>,
}

impl<const D: usize> Group<D> {
    pub(crate) fn new(
        local_item: Item<D>,
        global_item: Item<D>,
        group_item: Item<D>,
        concurrent: Rc<ConcurrentGroup>,
        item: Rc<ConcurrentItem>,
    ) -> Self {
        Self {
            local_item,
            global_item,
            group_item,
            concurrent,
            item,
        }
    }

    /// Id of this group within the group range.
    #[inline(always)]
    pub fn group_id(&self) -> Id<D> {
        self.group_item.id()
    }

    #[inline]
    pub fn group_linear_id(&self) -> usize {
        self.group_item.linear_id()
    }

    #[inline(always)]
    pub fn group_range(&self) -> Range<D> {
        self.group_item.range()
    }

    /// Id of the calling work-item within this group.
    #[inline(always)]
    pub fn local_id(&self) -> Id<D> {
        self.local_item.id()
    }

    #[inline]
    pub fn local_linear_id(&self) -> usize {
        self.local_item.linear_id()
    }

    #[inline(always)]
    pub fn local_range(&self) -> Range<D> {
        self.local_item.range()
    }

    #[inline(always)]
    pub fn max_local_range(&self) -> Range<D> {
        self.local_range()
    }

    #[inline(always)]
    pub fn global_range(&self) -> Range<D> {
        self.global_item.range()
    }

    /// True for exactly one work-item of the group.
    #[inline]
    pub fn leader(&self) -> bool {
        self.local_linear_id() == 0
    }
}

impl<const D: usize> std::fmt::Debug for Group<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("group_id", &self.group_id())
            .field("local_range", &self.local_range())
            .finish_non_exhaustive()
    }
}

impl<const D: usize> sealed::Sealed for Group<D> {}

impl<const D: usize> GroupLike for Group<D> {
    const FENCE_SCOPE: MemoryScope = MemoryScope::WorkGroup;

    #[inline]
    fn local_linear_id(&self) -> usize {
        Group::local_linear_id(self)
    }

    #[inline]
    fn local_range_len(&self) -> usize {
        self.local_range().size()
    }

    fn ops_counter(&self) -> &Cell<usize> {
        &self.item.group_ops_reached
    }

    fn with_operations<R>(&self, f: impl FnOnce(&mut Vec<GroupOperationRecord>) -> R) -> R {
        f(&mut self.concurrent.instance.borrow_mut().operations)
    }

    fn kind(&self) -> &'static str {
        "work-group"
    }
}

////////////////////////////////////////////////////////////////////////////////
// SubGroup
////////////////////////////////////////////////////////////////////////////////

/// A sub-group: a contiguous slice of a work-group's local linear ids.
///
/// `local_range` is the *actual* lane count, which for the trailing
/// sub-group of a work-group whose size is not a multiple of
/// [`max_local_range`](Self::max_local_range) is smaller than the maximum
/// width.
#[derive(Clone)]
pub struct SubGroup {
    local_id: Id<1>,
    local_range: Range<1>,
    max_local_range: Range<1>,
    group_id: Id<1>,
    group_range: Range<1>,
    concurrent: Rc<ConcurrentSubGroup>,
    item: Rc<ConcurrentItem>,
}

impl SubGroup {
    pub(crate) fn new(
        local_id: Id<1>,
        local_range: Range<1>,
        max_local_range: Range<1>,
        group_id: Id<1>,
        group_range: Range<1>,
        concurrent: Rc<ConcurrentSubGroup>,
        item: Rc<ConcurrentItem>,
    ) -> Self {
        Self {
            local_id,
            local_range,
            max_local_range,
            group_id,
            group_range,
            concurrent,
            item,
        }
    }

    /// Lane of the calling work-item within this sub-group.
    #[inline(always)]
    pub fn local_id(&self) -> Id<1> {
        self.local_id
    }

    #[inline(always)]
    pub fn local_linear_id(&self) -> usize {
        self.local_id[0]
    }

    /// Actual lane count of this sub-group.
    #[inline(always)]
    pub fn local_range(&self) -> Range<1> {
        self.local_range
    }

    /// The device's sub-group width; lane counts never exceed it.
    #[inline(always)]
    pub fn max_local_range(&self) -> Range<1> {
        self.max_local_range
    }

    /// Index of this sub-group within its work-group.
    #[inline(always)]
    pub fn group_id(&self) -> Id<1> {
        self.group_id
    }

    #[inline(always)]
    pub fn group_linear_id(&self) -> usize {
        self.group_id[0]
    }

    /// Number of sub-groups per work-group.
    #[inline(always)]
    pub fn group_range(&self) -> Range<1> {
        self.group_range
    }

    #[inline]
    pub fn leader(&self) -> bool {
        self.local_linear_id() == 0
    }
}

impl std::fmt::Debug for SubGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SubGroup")
            .field("group_id", &self.group_id)
            .field("local_range", &self.local_range)
            .finish_non_exhaustive()
    }
}

impl sealed::Sealed for SubGroup {}

impl GroupLike for SubGroup {
    const FENCE_SCOPE: MemoryScope = MemoryScope::SubGroup;

    #[inline]
    fn local_linear_id(&self) -> usize {
        SubGroup::local_linear_id(self)
    }

    #[inline]
    fn local_range_len(&self) -> usize {
        self.local_range.size()
    }

    fn ops_counter(&self) -> &Cell<usize> {
        &self.item.sub_group_ops_reached
    }

    fn with_operations<R>(&self, f: impl FnOnce(&mut Vec<GroupOperationRecord>) -> R) -> R {
        f(&mut self.concurrent.instance.borrow_mut().operations)
    }

    fn kind(&self) -> &'static str {
        "sub-group"
    }
}

////////////////////////////////////////////////////////////////////////////////
// NdItem
////////////////////////////////////////////////////////////////////////////////

/// The view handed to nd-range kernels: one work-item with its work-group
/// and sub-group.
#[derive(Clone)]
pub struct NdItem<const D: usize> {
    global_item: Item<D>,
    local_item: Item<D>,
    group: Group<D>,
    sub_group: SubGroup,
}

impl<const D: usize> NdItem<D> {
    pub(crate) fn new(
        global_item: Item<D>,
        local_item: Item<D>,
        group: Group<D>,
        sub_group: SubGroup,
    ) -> Self {
        Self {
            global_item,
            local_item,
            group,
            sub_group,
        }
    }

    #[inline(always)]
    pub fn global_id(&self) -> Id<D> {
        self.global_item.id()
    }

    #[inline]
    pub fn global_linear_id(&self) -> usize {
        self.global_item.linear_id()
    }

    #[inline(always)]
    pub fn global_range(&self) -> Range<D> {
        self.global_item.range()
    }

    #[inline(always)]
    pub fn local_id(&self) -> Id<D> {
        self.local_item.id()
    }

    #[inline]
    pub fn local_linear_id(&self) -> usize {
        self.local_item.linear_id()
    }

    #[inline(always)]
    pub fn local_range(&self) -> Range<D> {
        self.local_item.range()
    }

    #[inline(always)]
    pub fn group(&self) -> &Group<D> {
        &self.group
    }

    #[inline]
    pub fn group_linear_id(&self) -> usize {
        self.group.group_linear_id()
    }

    #[inline(always)]
    pub fn sub_group(&self) -> &SubGroup {
        &self.sub_group
    }

    #[inline(always)]
    pub fn offset(&self) -> Id<D> {
        self.global_item.offset()
    }
}

impl<const D: usize> std::fmt::Debug for NdItem<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NdItem")
            .field("global_id", &self.global_id())
            .field("local_id", &self.local_id())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// WorkGroup (hierarchical dispatch)
////////////////////////////////////////////////////////////////////////////////

/// The view handed to hierarchical (work-group) kernels.
///
/// Code at this level runs once per work-group;
/// [`parallel_for_work_item`](Self::parallel_for_work_item) descends to
/// per-item scope. There is no concurrent state: hierarchical dispatch has
/// no collectives and executes its work-items sequentially.
#[derive(Debug, Clone, Copy)]
pub struct WorkGroup<const D: usize> {
    group_item: Item<D>,
    local_range: Range<D>,
    global_range: Range<D>,
}

impl<const D: usize> WorkGroup<D> {
    pub(crate) fn new(group_item: Item<D>, local_range: Range<D>, global_range: Range<D>) -> Self {
        Self {
            group_item,
            local_range,
            global_range,
        }
    }

    #[inline(always)]
    pub fn group_id(&self) -> Id<D> {
        self.group_item.id()
    }

    #[inline]
    pub fn group_linear_id(&self) -> usize {
        self.group_item.linear_id()
    }

    #[inline(always)]
    pub fn group_range(&self) -> Range<D> {
        self.group_item.range()
    }

    #[inline(always)]
    pub fn local_range(&self) -> Range<D> {
        self.local_range
    }

    /// Run `f` once for every work-item of this group.
    pub fn parallel_for_work_item(&self, f: impl Fn(&HItem<D>)) {
        self.parallel_for_work_item_in(self.local_range, f);
    }

    /// Run `f` once for every id in `flexible_range`, mapping logical ids
    /// onto physical work-items round-robin.
    pub fn parallel_for_work_item_in(&self, flexible_range: Range<D>, f: impl Fn(&HItem<D>)) {
        for logical_linear in 0..flexible_range.size() {
            let logical_id = linear_index_to_id(flexible_range, logical_linear);
            let physical_id = logical_id % Id::from(self.local_range);
            let global_id = self.group_id() * Id::from(self.local_range) + physical_id;
            let h_item = HItem::new(
                Item::new(global_id, self.global_range),
                Item::new(logical_id, flexible_range),
                Item::new(physical_id, self.local_range),
            );
            f(&h_item);
        }
    }
}
