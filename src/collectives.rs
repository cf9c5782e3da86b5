//! Collective operations over work-groups and sub-groups.
//!
//! Every function here must be called by *all* work-items of the group in
//! lockstep, with identical parameters; the rendezvous engine
//! ([`crate::group_op`]) validates this and reports divergence through the
//! active check mode. Lane-referential operations (broadcast, shift,
//! permute, select) that name a lane outside the group return
//! [`LaneValue::unspecified`].
//!
//! Reductions and scans take their combining operation as a
//! [`BinaryOp`] function object (see [`crate::ops`]); the scan variants
//! without an init value additionally require a [`KnownIdentity`].

use std::cell::Cell;

use crate::check::group_check;
use crate::fiber;
use crate::group::SubGroup;
use crate::group_op::{
    perform_group_operation, GroupLike, GroupOperationId, GroupOperationRecord, LaneVector,
    MemoryScope, OpPayload,
};
use crate::ops::{BinaryOp, KnownIdentity, LaneValue};

#[inline(always)]
fn record_parts(record: &mut GroupOperationRecord) -> (&mut OpPayload, &mut bool) {
    (&mut record.payload, &mut record.valid)
}

////////////////////////////////////////////////////////////////////////////////
// Barrier & fences
////////////////////////////////////////////////////////////////////////////////

/// Synchronize all work-items of `g`, with the group's default fence scope.
#[inline]
pub fn group_barrier<G: GroupLike>(g: &G) {
    group_barrier_with_scope(g, G::FENCE_SCOPE);
}

/// Synchronize all work-items of `g`. The fence scope carries no
/// synchronization meaning in the simulator but is cross-checked between
/// participants.
pub fn group_barrier_with_scope<G: GroupLike>(g: &G, fence_scope: MemoryScope) {
    let lane = g.local_linear_id();
    perform_group_operation(
        g,
        GroupOperationId::Barrier,
        || OpPayload::Barrier { fence_scope },
        |record| {
            let (payload, valid) = record_parts(record);
            if let OpPayload::Barrier {
                fence_scope: recorded,
            } = payload
            {
                let scope_matches = *recorded == fence_scope;
                *valid = *valid && scope_matches;
                group_check!(
                    scope_matches,
                    "barrier fence scope mismatch: the group recorded {:?}, but work-item #{lane} specified {:?}",
                    recorded,
                    fence_scope,
                );
            }
        },
        |_| (),
    )
}

/// Hint that lets the schedule policy interleave other work-items.
///
/// Fences have no observable effect in a single-threaded simulator; the only
/// behavior is a cooperative yield when called from inside a kernel.
#[inline]
pub fn atomic_fence() {
    fiber::maybe_yield_to_scheduler();
}

////////////////////////////////////////////////////////////////////////////////
// Broadcast
////////////////////////////////////////////////////////////////////////////////

/// Every work-item receives the value contributed by `origin_lane`.
///
/// `origin_lane` must agree across participants and must name an existing
/// lane of `g` (in particular, for a trailing sub-group it must be below the
/// actual lane count).
pub fn group_broadcast<G: GroupLike, T: LaneValue>(g: &G, x: T, origin_lane: usize) -> T {
    let lane = g.local_linear_id();
    let len = g.local_range_len();
    group_check!(
        origin_lane < len,
        "broadcast origin lane {origin_lane} does not exist in a {} of {len} work-items (work-item #{lane})",
        g.kind(),
    );
    perform_group_operation(
        g,
        GroupOperationId::Broadcast,
        || {
            let mut values = LaneVector::new::<T>(len);
            values.set(lane, x);
            OpPayload::Broadcast { origin_lane, values }
        },
        |record| {
            let (payload, valid) = record_parts(record);
            if let OpPayload::Broadcast {
                origin_lane: recorded,
                values,
            } = payload
            {
                let origin_matches = *recorded == origin_lane;
                *valid = *valid && origin_matches;
                group_check!(
                    origin_matches,
                    "broadcast origin mismatch: other work-items specified lane {}, but work-item #{lane} specified lane {origin_lane}",
                    recorded,
                );
                let type_matches = values.set(lane, x);
                *valid = *valid && type_matches;
                group_check!(
                    type_matches,
                    "broadcast element type mismatch at work-item #{lane}",
                );
            }
        },
        |record| match &record.payload {
            OpPayload::Broadcast {
                origin_lane: recorded,
                values,
            } => values
                .get_or_unspecified(*recorded)
                .unwrap_or_else(T::unspecified),
            _ => T::unspecified(),
        },
    )
}

////////////////////////////////////////////////////////////////////////////////
// any_of / all_of / none_of
////////////////////////////////////////////////////////////////////////////////

fn lane_bool_op<G: GroupLike>(
    g: &G,
    id: GroupOperationId,
    pred: bool,
    fold: impl FnOnce(&[bool]) -> bool,
) -> bool {
    let lane = g.local_linear_id();
    let len = g.local_range_len();
    perform_group_operation(
        g,
        id,
        || {
            let mut values = vec![false; len];
            values[lane] = pred;
            OpPayload::LaneBools { values }
        },
        |record| {
            if let OpPayload::LaneBools { values } = &mut record.payload {
                values[lane] = pred;
            }
        },
        |record| match &record.payload {
            OpPayload::LaneBools { values } => fold(values),
            _ => false,
        },
    )
}

/// True for all work-items if `pred` holds on at least one of them.
pub fn any_of_group<G: GroupLike>(g: &G, pred: bool) -> bool {
    lane_bool_op(g, GroupOperationId::AnyOf, pred, |values| {
        values.iter().any(|&v| v)
    })
}

/// True for all work-items if `pred` holds on every one of them.
pub fn all_of_group<G: GroupLike>(g: &G, pred: bool) -> bool {
    lane_bool_op(g, GroupOperationId::AllOf, pred, |values| {
        values.iter().all(|&v| v)
    })
}

/// True for all work-items if `pred` holds on none of them.
pub fn none_of_group<G: GroupLike>(g: &G, pred: bool) -> bool {
    lane_bool_op(g, GroupOperationId::NoneOf, pred, |values| {
        !values.iter().any(|&v| v)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Joint predicates
////////////////////////////////////////////////////////////////////////////////

// The joint operations evaluate the whole shared buffer on every work-item
// and cross-check that all participants passed the same buffer and computed
// the same outcome. This is as close as the simulator can get to the
// requirement that the predicate be immutable and identical across the
// group.

fn joint_rendezvous<G: GroupLike, T, R>(
    g: &G,
    id: GroupOperationId,
    input: &[T],
    output: (usize, usize),
    op_tag: Option<std::any::TypeId>,
    result: R,
) -> R
where
    R: Copy + PartialEq + std::fmt::Debug + 'static,
{
    let lane = g.local_linear_id();
    let input_base = input.as_ptr() as usize;
    let input_len = input.len();
    perform_group_operation(
        g,
        id,
        || OpPayload::Joint {
            input_base,
            input_len,
            output_base: output.0,
            output_len: output.1,
            op_tag,
            result: Box::new(result),
        },
        |record| {
            let (payload, valid) = record_parts(record);
            if let OpPayload::Joint {
                input_base: recorded_base,
                input_len: recorded_len,
                output_base: recorded_out_base,
                output_len: recorded_out_len,
                op_tag: recorded_tag,
                result: recorded_result,
            } = payload
            {
                let buffers_match = *recorded_base == input_base
                    && *recorded_len == input_len
                    && *recorded_out_base == output.0
                    && *recorded_out_len == output.1;
                *valid = *valid && buffers_match;
                group_check!(
                    buffers_match,
                    "{} operation \"{id}\" buffer mismatch: work-item #{lane} passed a different input or output range than the first arrival",
                    g.kind(),
                );
                let tag_matches = *recorded_tag == op_tag;
                *valid = *valid && tag_matches;
                group_check!(
                    tag_matches,
                    "{} operation \"{id}\" binary operation mismatch at work-item #{lane}",
                    g.kind(),
                );
                let result_matches = recorded_result.downcast_ref::<R>() == Some(&result);
                *valid = *valid && result_matches;
                group_check!(
                    result_matches,
                    "{} operation \"{id}\" result mismatch at work-item #{lane}: expected {:?}, computed {result:?}",
                    g.kind(),
                    recorded_result.downcast_ref::<R>(),
                );
            }
        },
        |_| (),
    );
    result
}

/// True if `pred` holds on at least one element of `values`, which must be
/// the same buffer on every work-item of `g`.
pub fn joint_any_of<G: GroupLike, T>(g: &G, values: &[T], pred: impl Fn(&T) -> bool) -> bool {
    let result = values.iter().any(&pred);
    joint_rendezvous(g, GroupOperationId::JointAnyOf, values, (0, 0), None, result)
}

/// True if `pred` holds on every element of `values`.
pub fn joint_all_of<G: GroupLike, T>(g: &G, values: &[T], pred: impl Fn(&T) -> bool) -> bool {
    let result = values.iter().all(&pred);
    joint_rendezvous(g, GroupOperationId::JointAllOf, values, (0, 0), None, result)
}

/// True if `pred` holds on no element of `values`.
pub fn joint_none_of<G: GroupLike, T>(g: &G, values: &[T], pred: impl Fn(&T) -> bool) -> bool {
    let result = !values.iter().any(&pred);
    joint_rendezvous(g, GroupOperationId::JointNoneOf, values, (0, 0), None, result)
}

////////////////////////////////////////////////////////////////////////////////
// Shuffles (sub-group only)
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy)]
enum ShuffleKind {
    ShiftLeft { delta: usize },
    ShiftRight { delta: usize },
    PermuteByXor { mask: usize },
    Select { remote_lane: usize },
}

impl ShuffleKind {
    fn operation_id(&self) -> GroupOperationId {
        match self {
            Self::ShiftLeft { .. } => GroupOperationId::ShiftLeft,
            Self::ShiftRight { .. } => GroupOperationId::ShiftRight,
            Self::PermuteByXor { .. } => GroupOperationId::PermuteByXor,
            Self::Select { .. } => GroupOperationId::Select,
        }
    }

    fn payload(&self, values: LaneVector) -> OpPayload {
        match *self {
            Self::ShiftLeft { delta } | Self::ShiftRight { delta } => {
                OpPayload::Shift { delta, values }
            }
            Self::PermuteByXor { mask } => OpPayload::Permute { mask, values },
            Self::Select { .. } => OpPayload::Select { values },
        }
    }

    /// Lane this work-item reads its result from, `None` when it refers
    /// outside the sub-group. Shifts and permutes use the delta/mask
    /// recorded by the first arrival; `select` uses the caller's own lane
    /// argument, which legitimately differs between work-items.
    fn source_lane(&self, lane: usize, payload: &OpPayload) -> Option<usize> {
        match (self, payload) {
            (Self::ShiftLeft { .. }, OpPayload::Shift { delta, .. }) => lane.checked_add(*delta),
            (Self::ShiftRight { .. }, OpPayload::Shift { delta, .. }) => lane.checked_sub(*delta),
            (Self::PermuteByXor { .. }, OpPayload::Permute { mask, .. }) => Some(lane ^ *mask),
            (Self::Select { remote_lane }, OpPayload::Select { .. }) => Some(*remote_lane),
            _ => None,
        }
    }
}

fn sub_group_shuffle<T: LaneValue>(sg: &SubGroup, kind: ShuffleKind, x: T) -> T {
    let id = kind.operation_id();
    let lane = GroupLike::local_linear_id(sg);
    let len = sg.local_range_len();
    perform_group_operation(
        sg,
        id,
        || {
            let mut values = LaneVector::new::<T>(len);
            values.set(lane, x);
            kind.payload(values)
        },
        |record| {
            let (payload, valid) = record_parts(record);
            match (kind, &*payload) {
                (ShuffleKind::ShiftLeft { delta } | ShuffleKind::ShiftRight { delta },
                    OpPayload::Shift { delta: recorded, .. }) => {
                    let matches = *recorded == delta;
                    *valid = *valid && matches;
                    group_check!(
                        matches,
                        "sub-group {id} delta mismatch: other work-items specified {recorded}, but work-item #{lane} specified {delta}",
                    );
                }
                (ShuffleKind::PermuteByXor { mask }, OpPayload::Permute { mask: recorded, .. }) => {
                    let matches = *recorded == mask;
                    *valid = *valid && matches;
                    group_check!(
                        matches,
                        "sub-group {id} mask mismatch: other work-items specified {recorded}, but work-item #{lane} specified {mask}",
                    );
                }
                _ => {}
            }
            let values = match payload {
                OpPayload::Shift { values, .. }
                | OpPayload::Permute { values, .. }
                | OpPayload::Select { values } => values,
                _ => return,
            };
            let type_matches = values.set(lane, x);
            *valid = *valid && type_matches;
            group_check!(
                type_matches,
                "sub-group {id} element type mismatch at work-item #{lane}",
            );
        },
        |record| {
            let values = match &record.payload {
                OpPayload::Shift { values, .. }
                | OpPayload::Permute { values, .. }
                | OpPayload::Select { values } => values,
                _ => return T::unspecified(),
            };
            match kind.source_lane(lane, &record.payload) {
                Some(source) if source < values.len() => values
                    .get_or_unspecified(source)
                    .unwrap_or_else(T::unspecified),
                _ => T::unspecified(),
            }
        },
    )
}

/// Value of lane `i + delta`, or the unspecified sentinel when that lane
/// does not exist.
pub fn shift_group_left<T: LaneValue>(sg: &SubGroup, x: T, delta: usize) -> T {
    sub_group_shuffle(sg, ShuffleKind::ShiftLeft { delta }, x)
}

/// Value of lane `i - delta`, or the unspecified sentinel when that lane
/// does not exist.
pub fn shift_group_right<T: LaneValue>(sg: &SubGroup, x: T, delta: usize) -> T {
    sub_group_shuffle(sg, ShuffleKind::ShiftRight { delta }, x)
}

/// Value of lane `i ^ mask`, or the unspecified sentinel when that lane does
/// not exist.
pub fn permute_group_by_xor<T: LaneValue>(sg: &SubGroup, x: T, mask: usize) -> T {
    sub_group_shuffle(sg, ShuffleKind::PermuteByXor { mask }, x)
}

/// Value contributed by `remote_lane`, which unlike the other shuffles may
/// differ between work-items. Out-of-range lanes yield the unspecified
/// sentinel.
pub fn select_from_group<T: LaneValue>(sg: &SubGroup, x: T, remote_lane: usize) -> T {
    sub_group_shuffle(sg, ShuffleKind::Select { remote_lane }, x)
}

////////////////////////////////////////////////////////////////////////////////
// Reductions & scans over a group
////////////////////////////////////////////////////////////////////////////////

fn group_value_fold<G, T, O, R>(
    g: &G,
    id: GroupOperationId,
    x: T,
    op: O,
    with_init: bool,
    complete: impl FnOnce(&[T]) -> R,
) -> R
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
    R: LaneValue,
{
    let lane = g.local_linear_id();
    let len = g.local_range_len();
    perform_group_operation(
        g,
        id,
        || {
            let mut values = LaneVector::new::<T>(len);
            values.set(lane, x);
            OpPayload::Reduction {
                op_tag: op.tag(),
                with_init,
                values,
            }
        },
        |record| {
            let (payload, valid) = record_parts(record);
            if let OpPayload::Reduction {
                op_tag,
                with_init: recorded_with_init,
                values,
            } = payload
            {
                let op_matches = *op_tag == op.tag() && *recorded_with_init == with_init;
                *valid = *valid && op_matches;
                group_check!(
                    op_matches,
                    "{} operation \"{id}\" binary operation mismatch at work-item #{lane}",
                    g.kind(),
                );
                let type_matches = values.set(lane, x);
                *valid = *valid && type_matches;
                group_check!(
                    type_matches,
                    "{} operation \"{id}\" element type mismatch at work-item #{lane}",
                    g.kind(),
                );
            }
        },
        |record| match &record.payload {
            OpPayload::Reduction { values, .. } => match values.as_slice::<T>() {
                Some(values) => complete(values),
                None => R::unspecified(),
            },
            _ => R::unspecified(),
        },
    )
}

/// Combine the `x` values of all work-items with `op`; all work-items
/// receive the combined value.
pub fn reduce_over_group<G, T, O>(g: &G, x: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    group_value_fold(g, GroupOperationId::Reduce, x, op, false, |values| {
        let mut acc = values[0];
        for &value in &values[1..] {
            acc = op.apply(acc, value);
        }
        acc
    })
}

/// [`reduce_over_group`] seeded with `init`.
pub fn reduce_over_group_with_init<G, T, O>(g: &G, x: T, init: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    group_value_fold(g, GroupOperationId::Reduce, x, op, true, |values| {
        values.iter().fold(init, |acc, &value| op.apply(acc, value))
    })
}

/// Exclusive prefix combination: lane `i` receives
/// `op(identity, x_0, ..., x_{i-1})`; lane 0 receives the identity.
pub fn exclusive_scan_over_group<G, T, O>(g: &G, x: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: KnownIdentity<T>,
{
    let lane = g.local_linear_id();
    group_value_fold(g, GroupOperationId::ExclusiveScan, x, op, false, |values| {
        values[..lane]
            .iter()
            .fold(op.identity(), |acc, &value| op.apply(acc, value))
    })
}

/// [`exclusive_scan_over_group`] seeded with `init` instead of the
/// operation's identity.
pub fn exclusive_scan_over_group_with_init<G, T, O>(g: &G, x: T, init: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    let lane = g.local_linear_id();
    group_value_fold(g, GroupOperationId::ExclusiveScan, x, op, true, |values| {
        values[..lane]
            .iter()
            .fold(init, |acc, &value| op.apply(acc, value))
    })
}

/// Inclusive prefix combination: lane `i` receives `op(x_0, ..., x_i)`.
pub fn inclusive_scan_over_group<G, T, O>(g: &G, x: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    let lane = g.local_linear_id();
    group_value_fold(g, GroupOperationId::InclusiveScan, x, op, false, |values| {
        let mut acc = values[0];
        for &value in &values[1..=lane] {
            acc = op.apply(acc, value);
        }
        acc
    })
}

/// [`inclusive_scan_over_group`] seeded with `init`.
pub fn inclusive_scan_over_group_with_init<G, T, O>(g: &G, x: T, init: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    let lane = g.local_linear_id();
    group_value_fold(g, GroupOperationId::InclusiveScan, x, op, true, |values| {
        values[..=lane]
            .iter()
            .fold(init, |acc, &value| op.apply(acc, value))
    })
}

////////////////////////////////////////////////////////////////////////////////
// Joint reductions & scans
////////////////////////////////////////////////////////////////////////////////

/// Combine all elements of `input` (the same buffer on every work-item)
/// with `op`.
pub fn joint_reduce<G, T, O>(g: &G, input: &[T], op: O) -> T
where
    G: GroupLike,
    T: LaneValue + PartialEq + std::fmt::Debug,
    O: BinaryOp<T>,
{
    let mut acc = match input.first() {
        Some(&first) => first,
        None => T::unspecified(),
    };
    for &value in input.iter().skip(1) {
        acc = op.apply(acc, value);
    }
    joint_rendezvous(g, GroupOperationId::JointReduce, input, (0, 0), Some(op.tag()), acc)
}

/// [`joint_reduce`] seeded with `init`.
pub fn joint_reduce_with_init<G, T, O>(g: &G, input: &[T], init: T, op: O) -> T
where
    G: GroupLike,
    T: LaneValue + PartialEq + std::fmt::Debug,
    O: BinaryOp<T>,
{
    let acc = input.iter().fold(init, |acc, &value| op.apply(acc, value));
    joint_rendezvous(g, GroupOperationId::JointReduce, input, (0, 0), Some(op.tag()), acc)
}

fn write_scan_output<T: LaneValue>(output: &[Cell<T>], results: &[T]) {
    for (slot, &value) in output.iter().zip(results) {
        slot.set(value);
    }
}

fn joint_scan<G, T, O>(
    g: &G,
    id: GroupOperationId,
    input: &[T],
    output: &[Cell<T>],
    op: O,
    seed: Option<T>,
    inclusive: bool,
) where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    let mut results = Vec::with_capacity(input.len());
    if inclusive {
        let mut acc = T::unspecified();
        for (i, &value) in input.iter().enumerate() {
            acc = match (i, seed) {
                (0, Some(seed)) => op.apply(seed, value),
                (0, None) => value,
                _ => op.apply(acc, value),
            };
            results.push(acc);
        }
    } else {
        let mut acc = seed.expect("exclusive scan requires a seed");
        for &value in input {
            results.push(acc);
            acc = op.apply(acc, value);
        }
    }

    let out_range = (output.as_ptr() as usize, output.len());
    joint_rendezvous(g, id, input, out_range, Some(op.tag()), ());
    write_scan_output(output, &results);
}

/// Exclusive prefix combination of `input` into `output`; both buffers must
/// be the same on every work-item. `output[0]` receives the operation's
/// identity.
pub fn joint_exclusive_scan<G, T, O>(g: &G, input: &[T], output: &[Cell<T>], op: O)
where
    G: GroupLike,
    T: LaneValue,
    O: KnownIdentity<T>,
{
    joint_scan(
        g,
        GroupOperationId::JointExclusiveScan,
        input,
        output,
        op,
        Some(op.identity()),
        false,
    );
}

/// [`joint_exclusive_scan`] seeded with `init`.
pub fn joint_exclusive_scan_with_init<G, T, O>(
    g: &G,
    input: &[T],
    output: &[Cell<T>],
    init: T,
    op: O,
) where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    joint_scan(
        g,
        GroupOperationId::JointExclusiveScan,
        input,
        output,
        op,
        Some(init),
        false,
    );
}

/// Inclusive prefix combination of `input` into `output`.
pub fn joint_inclusive_scan<G, T, O>(g: &G, input: &[T], output: &[Cell<T>], op: O)
where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    joint_scan(
        g,
        GroupOperationId::JointInclusiveScan,
        input,
        output,
        op,
        None,
        true,
    );
}

/// [`joint_inclusive_scan`] seeded with `init`.
pub fn joint_inclusive_scan_with_init<G, T, O>(
    g: &G,
    input: &[T],
    output: &[Cell<T>],
    op: O,
    init: T,
) where
    G: GroupLike,
    T: LaneValue,
    O: BinaryOp<T>,
{
    joint_scan(
        g,
        GroupOperationId::JointInclusiveScan,
        input,
        output,
        op,
        Some(init),
        true,
    );
}
