//! Group-operation rendezvous engine.
//!
//! Every collective routes through [`perform_group_operation`]. Work-items
//! of one group arrive at the same operation index in their group's
//! operation log; the first arrival creates the record, later arrivals are
//! validated against it and contribute their datum, and the last arrival
//! completes the rendezvous without yielding. A record whose arrival count
//! has reached the expected participant count is frozen: its payload is only
//! read from that point on.
//!
//! Any disagreement between participants (operation id, participant count,
//! element type, op-specific parameters) marks the record invalid and
//! reports a diagnostic through [`crate::check`], naming the offending
//! work-item.

use std::any::Any;
use std::cell::Cell;

use crate::check::group_check;
use crate::fiber;
use crate::ops::LaneValue;

////////////////////////////////////////////////////////////////////////////////
// Operation ids
////////////////////////////////////////////////////////////////////////////////

/// Identifies which collective a group operation record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupOperationId {
    Broadcast,
    Barrier,
    JointAnyOf,
    AnyOf,
    JointAllOf,
    AllOf,
    JointNoneOf,
    NoneOf,
    ShiftLeft,
    ShiftRight,
    PermuteByXor,
    Select,
    JointReduce,
    Reduce,
    JointExclusiveScan,
    ExclusiveScan,
    JointInclusiveScan,
    InclusiveScan,
    /// Implicit operation injected after the kernel body returns; catches
    /// work-items diverging on the last explicit collective.
    Exit,
}

impl GroupOperationId {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Barrier => "barrier",
            Self::JointAnyOf => "joint_any_of",
            Self::AnyOf => "any_of",
            Self::JointAllOf => "joint_all_of",
            Self::AllOf => "all_of",
            Self::JointNoneOf => "joint_none_of",
            Self::NoneOf => "none_of",
            Self::ShiftLeft => "shift_left",
            Self::ShiftRight => "shift_right",
            Self::PermuteByXor => "permute_by_xor",
            Self::Select => "select",
            Self::JointReduce => "joint_reduce",
            Self::Reduce => "reduce",
            Self::JointExclusiveScan => "joint_exclusive_scan",
            Self::ExclusiveScan => "exclusive_scan",
            Self::JointInclusiveScan => "joint_inclusive_scan",
            Self::InclusiveScan => "inclusive_scan",
            Self::Exit => "exit",
        }
    }
}

impl std::fmt::Display for GroupOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory scope of a group barrier fence; carried only to cross-check that
/// all participants requested the same scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    WorkItem,
    SubGroup,
    WorkGroup,
    Device,
    System,
}

////////////////////////////////////////////////////////////////////////////////
// Lane vectors
////////////////////////////////////////////////////////////////////////////////

/// Per-lane value storage with the element type erased.
///
/// Slots start out as [`LaneValue::unspecified`] so lane-referential
/// operations reading a slot that was never contributed (only possible on an
/// already-diverged record) still observe a deterministic value.
pub(crate) struct LaneVector {
    len: usize,
    values: Box<dyn Any>,
}

impl LaneVector {
    pub fn new<T: LaneValue>(len: usize) -> Self {
        Self {
            len,
            values: Box::new(vec![T::unspecified(); len]),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Store `value` at `lane`; `false` if the vector holds a different
    /// element type (a divergence the caller reports).
    pub fn set<T: LaneValue>(&mut self, lane: usize, value: T) -> bool {
        match self.values.downcast_mut::<Vec<T>>() {
            Some(values) => {
                values[lane] = value;
                true
            }
            None => false,
        }
    }

    pub fn as_slice<T: LaneValue>(&self) -> Option<&[T]> {
        self.values.downcast_ref::<Vec<T>>().map(Vec::as_slice)
    }

    /// Value at `lane`, or the unspecified sentinel when `lane` is out of
    /// range. `None` on an element type mismatch.
    pub fn get_or_unspecified<T: LaneValue>(&self, lane: usize) -> Option<T> {
        let values = self.values.downcast_ref::<Vec<T>>()?;
        Some(values.get(lane).copied().unwrap_or_else(T::unspecified))
    }
}

impl std::fmt::Debug for LaneVector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LaneVector").field("len", &self.len).finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Operation records
////////////////////////////////////////////////////////////////////////////////

/// Op-specific payload of a [`GroupOperationRecord`].
pub(crate) enum OpPayload {
    /// Barrier-like operations carrying no per-item data (`exit`).
    None,
    Barrier {
        fence_scope: MemoryScope,
    },
    Broadcast {
        origin_lane: usize,
        values: LaneVector,
    },
    /// `any_of` / `all_of` / `none_of` predicate outcomes per lane.
    LaneBools {
        values: Vec<bool>,
    },
    Shift {
        delta: usize,
        values: LaneVector,
    },
    Permute {
        mask: usize,
        values: LaneVector,
    },
    Select {
        values: LaneVector,
    },
    /// `reduce` and the group scans: per-lane contributions plus the
    /// operation tag (and optional init) every participant must agree on.
    Reduction {
        op_tag: std::any::TypeId,
        with_init: bool,
        values: LaneVector,
    },
    /// Joint operations over shared buffers: participants are validated to
    /// pass the same buffers and to compute the same result.
    Joint {
        input_base: usize,
        input_len: usize,
        output_base: usize,
        output_len: usize,
        op_tag: Option<std::any::TypeId>,
        result: Box<dyn Any>,
    },
}

impl std::fmt::Debug for OpPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let variant = match self {
            Self::None => "None",
            Self::Barrier { .. } => "Barrier",
            Self::Broadcast { .. } => "Broadcast",
            Self::LaneBools { .. } => "LaneBools",
            Self::Shift { .. } => "Shift",
            Self::Permute { .. } => "Permute",
            Self::Select { .. } => "Select",
            Self::Reduction { .. } => "Reduction",
            Self::Joint { .. } => "Joint",
        };
        f.write_str(variant)
    }
}

/// One entry of a group's operation log.
#[derive(Debug)]
pub struct GroupOperationRecord {
    pub id: GroupOperationId,
    pub expected_participants: usize,
    pub arrivals: usize,
    pub valid: bool,
    pub(crate) payload: OpPayload,
}

impl GroupOperationRecord {
    fn new(id: GroupOperationId, expected_participants: usize, payload: OpPayload) -> Self {
        Self {
            id,
            expected_participants,
            arrivals: 1,
            valid: true,
            payload,
        }
    }

    /// True once every expected participant has arrived; the record is
    /// read-only from this point on.
    #[inline(always)]
    pub fn is_frozen(&self) -> bool {
        self.arrivals >= self.expected_participants
    }
}

////////////////////////////////////////////////////////////////////////////////
// Rendezvous
////////////////////////////////////////////////////////////////////////////////

/// Group or sub-group as seen by the rendezvous engine.
///
/// Implemented by [`Group`](crate::group::Group) and
/// [`SubGroup`](crate::group::SubGroup); the hidden methods expose the
/// shared operation log and the per-item arrival counter and are not
/// intended for user code.
pub trait GroupLike: crate::group::sealed::Sealed {
    /// Fence scope a plain `group_barrier` over this group uses.
    const FENCE_SCOPE: MemoryScope;

    /// Position of the calling work-item within this group.
    fn local_linear_id(&self) -> usize;

    /// Actual number of work-items in this group. For a trailing sub-group
    /// this is smaller than the maximum sub-group width.
    fn local_range_len(&self) -> usize;

    #[doc(hidden)]
    fn ops_counter(&self) -> &Cell<usize>;

    #[doc(hidden)]
    fn with_operations<R>(&self, f: impl FnOnce(&mut Vec<GroupOperationRecord>) -> R) -> R;

    #[doc(hidden)]
    fn kind(&self) -> &'static str;
}

/// Ids of all operations recorded by the calling work-item's current group
/// instance, in arrival order. Intended for tests asserting op sequences.
pub fn recorded_operation_ids<G: GroupLike>(g: &G) -> Vec<GroupOperationId> {
    g.with_operations(|ops| ops.iter().map(|op| op.id).collect())
}

/// Validate a non-first arrival against the existing record.
///
/// Mirrors are kept in the record: any mismatch clears `valid` before the
/// diagnostic is reported, so that in non-throwing check modes the other
/// participants can observe the invalidation.
fn check_arrival_compatibility(
    lane: usize,
    kind: &'static str,
    new_id: GroupOperationId,
    new_expected: usize,
    record: &mut GroupOperationRecord,
) {
    let id_matches = record.id == new_id;
    let count_matches = record.expected_participants == new_expected;
    let still_open = !record.is_frozen();
    let was_valid = record.valid;
    record.valid = record.valid && id_matches && count_matches && still_open;

    group_check!(
        id_matches,
        "{kind} operation id mismatch: the {kind} recorded operation \"{}\", but work-item #{lane} is trying to perform \"{}\"",
        record.id,
        new_id,
    );
    group_check!(
        count_matches,
        "{kind} operation participant count mismatch: the {kind} recorded operation \"{}\" with {} participants, but work-item #{lane} is trying to perform \"{}\" with {} participants",
        record.id,
        record.expected_participants,
        new_id,
        new_expected,
    );
    group_check!(
        still_open,
        "{kind} operation already complete: the {kind} completed operation \"{}\" with {} participants, but work-item #{lane} is trying to enter it",
        record.id,
        record.expected_participants,
    );
    group_check!(
        !was_valid || record.valid,
        "{kind} operation \"{}\" is already invalid when work-item #{lane} arrives",
        record.id,
    );
}

/// Drive one work-item through one collective.
///
/// * `init` produces the payload when this item is the first arrival.
/// * `reached` is invoked for every later arrival with the existing record;
///   it cross-checks op-specific parameters and contributes the item's
///   datum.
/// * `complete` extracts this item's result once all participants have
///   arrived; it must not mutate the (frozen) record.
///
/// The calling fiber yields to the scheduler while the record is open unless
/// it is the last arrival, which never yields.
pub(crate) fn perform_group_operation<G, R>(
    g: &G,
    id: GroupOperationId,
    init: impl FnOnce() -> OpPayload,
    reached: impl FnOnce(&mut GroupOperationRecord),
    complete: impl FnOnce(&GroupOperationRecord) -> R,
) -> R
where
    G: GroupLike,
{
    let index = g.ops_counter().get();
    let lane = g.local_linear_id();
    let expected = g.local_range_len();

    g.with_operations(|ops| {
        debug_assert!(index <= ops.len(), "work-item skipped a group operation");
        if index == ops.len() {
            ops.push(GroupOperationRecord::new(id, expected, init()));
        } else {
            let record = &mut ops[index];
            check_arrival_compatibility(lane, g.kind(), id, expected, record);
            reached(record);
            record.arrivals += 1;
        }
    });
    g.ops_counter().set(index + 1);

    // Wait for the remaining participants. The last arrival observes a
    // frozen record right away and falls through without yielding.
    let mut reported_invalid = false;
    loop {
        let frozen = g.with_operations(|ops| {
            let record = &ops[index];
            if !record.valid && !reported_invalid {
                reported_invalid = true;
                group_check!(
                    record.valid,
                    "{} operation \"{}\" was invalidated while work-item #{lane} was waiting on it",
                    g.kind(),
                    record.id,
                );
            }
            record.is_frozen()
        });
        if frozen {
            break;
        }
        fiber::yield_to_scheduler().expect("group operation rendezvous outside a work-item fiber");
    }

    g.with_operations(|ops| complete(&ops[index]))
}

/// Record the implicit trailing operation after the kernel body returned.
pub(crate) fn perform_exit_operation<G: GroupLike>(g: &G) {
    perform_group_operation(g, GroupOperationId::Exit, || OpPayload::None, |_| {}, |_| ());
}
