//! Schedule policies and kernel dispatchers.
//!
//! The dispatchers are the entry points of the simulator:
//!
//! * [`dispatch_nd_range`] drives an nd-range kernel cooperatively: one
//!   fiber per concurrent work-item, group operations rendezvousing through
//!   [`crate::group_op`], local memory rebound before every resume.
//! * [`dispatch_range`] runs a simple (range, offset) kernel without any
//!   fiber machinery; there are no collectives at that level, so the only
//!   concurrency-relevant behavior is the deterministic permutation of
//!   execution order.
//! * [`dispatch_work_groups`] runs a hierarchical kernel, one work-group at
//!   a time.
//!
//! The order in which runnable fibers (or simple work-items) are resumed is
//! delegated to a [`CooperativeSchedule`]: [`RoundRobinSchedule`] preserves
//! the natural SPMD order, [`ShuffleSchedule`] permutes it pseudo-randomly
//! from a seed, which makes schedule-dependent data races reproducible.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::arena::{Allocation, LocalMemoryRequirement};
use crate::coord::{linear_index_to_id, Id, NdRange, Range};
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::group::{
    ConcurrentGroup, ConcurrentItem, ConcurrentSubGroup, Group, GroupInstance, NdItem, SubGroup,
    SubGroupInstance, WorkGroup,
};
use crate::group_op::perform_exit_operation;
use crate::item::Item;
use crate::system::DeviceConfig;

////////////////////////////////////////////////////////////////////////////////
// Schedule policies
////////////////////////////////////////////////////////////////////////////////

/// Opaque state threaded through a policy's [`init`](CooperativeSchedule::init)
/// and [`update`](CooperativeSchedule::update) calls.
pub type ScheduleState = u64;

/// Controls the order in which runnable work-items are resumed.
///
/// `init` must write a permutation of `0..order.len()` into `order`;
/// `update` is called after every sweep and must preserve the permutation
/// property. Policies are stateless between dispatches unless explicitly
/// seeded.
pub trait CooperativeSchedule {
    fn init(&self, order: &mut [usize]) -> ScheduleState;
    fn update(&self, state: ScheduleState, order: &mut [usize]) -> ScheduleState;
}

/// Resumes work-items in their natural (ascending linear id) order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinSchedule;

impl CooperativeSchedule for RoundRobinSchedule {
    fn init(&self, order: &mut [usize]) -> ScheduleState {
        for (i, slot) in order.iter_mut().enumerate() {
            *slot = i;
        }
        0
    }

    fn update(&self, state: ScheduleState, _order: &mut [usize]) -> ScheduleState {
        state
    }
}

/// Resumes work-items in a seeded pseudo-random order, re-shuffled after
/// every sweep.
///
/// The same seed always produces the same sequence of interleavings, so a
/// race surfaced by one seed can be replayed.
#[derive(Debug, Clone, Copy)]
pub struct ShuffleSchedule {
    seed: u64,
}

impl ShuffleSchedule {
    pub const DEFAULT_SEED: u64 = 1234567890;

    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Default for ShuffleSchedule {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEED)
    }
}

impl CooperativeSchedule for ShuffleSchedule {
    fn init(&self, order: &mut [usize]) -> ScheduleState {
        let mut rng = StdRng::seed_from_u64(self.seed);
        for (i, slot) in order.iter_mut().enumerate() {
            *slot = i;
        }
        order.shuffle(&mut rng);
        rng.gen()
    }

    fn update(&self, state: ScheduleState, order: &mut [usize]) -> ScheduleState {
        let mut rng = StdRng::seed_from_u64(state);
        order.shuffle(&mut rng);
        rng.gen()
    }
}

/// Parsed form of the `SIMSYCL_SCHEDULE` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleSpec {
    RoundRobin,
    Shuffle { seed: Option<u64> },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid schedule specification {0:?}, expected \"round_robin\" or \"shuffle[:<seed>]\"")]
pub struct ScheduleParseError(pub String);

impl FromStr for ScheduleSpec {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, ScheduleParseError> {
        match s.trim() {
            "round_robin" => Ok(Self::RoundRobin),
            "shuffle" => Ok(Self::Shuffle { seed: None }),
            other => match other.strip_prefix("shuffle:") {
                Some(seed) => seed
                    .parse()
                    .map(|seed| Self::Shuffle { seed: Some(seed) })
                    .map_err(|_| ScheduleParseError(s.to_owned())),
                None => Err(ScheduleParseError(s.to_owned())),
            },
        }
    }
}

impl ScheduleSpec {
    pub fn into_schedule(self) -> Box<dyn CooperativeSchedule + Send + Sync> {
        match self {
            Self::RoundRobin => Box::new(RoundRobinSchedule),
            Self::Shuffle { seed: None } => Box::new(ShuffleSchedule::default()),
            Self::Shuffle { seed: Some(seed) } => Box::new(ShuffleSchedule::new(seed)),
        }
    }
}

fn is_permutation(order: &[usize]) -> bool {
    let mut seen = vec![false; order.len()];
    order
        .iter()
        .all(|&i| i < seen.len() && !std::mem::replace(&mut seen[i], true))
}

////////////////////////////////////////////////////////////////////////////////
// Simple dispatch
////////////////////////////////////////////////////////////////////////////////

// Bounds the index buffer handed to the schedule policy.
const MAX_SCHEDULE_CHUNK_SIZE: usize = 16 << 10;

/// Run `kernel` for every id in `range`, shifted by `offset`.
///
/// Work-items are invoked serially in chunks of at most 16 Ki ids, each
/// chunk permuted by `schedule`. Panics propagate to the caller directly.
pub fn dispatch_range<const D: usize, K>(
    schedule: &dyn CooperativeSchedule,
    range: Range<D>,
    offset: Id<D>,
    kernel: K,
) where
    K: Fn(&Item<D>),
{
    let linear_range = range.size();
    if linear_range == 0 {
        return;
    }

    let chunk_size = linear_range.min(MAX_SCHEDULE_CHUNK_SIZE);
    let mut order = vec![0; chunk_size];
    let mut state = schedule.init(&mut order);
    debug_assert!(is_permutation(&order));

    let mut chunk_offset = 0;
    while chunk_offset < linear_range {
        for &slot in &order {
            let linear_id = chunk_offset + slot;
            if linear_id < linear_range {
                let id = linear_index_to_id(range, linear_id) + offset;
                kernel(&Item::with_offset(id, range, offset));
            }
        }
        state = schedule.update(state, &mut order);
        debug_assert!(is_permutation(&order));
        chunk_offset += MAX_SCHEDULE_CHUNK_SIZE;
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cooperative nd-range dispatch
////////////////////////////////////////////////////////////////////////////////

fn div_ceil(dividend: usize, divisor: usize) -> usize {
    (dividend + divisor - 1) / divisor
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "work-item panicked with a non-string payload".to_owned()
    }
}

fn validate_nd_range<const D: usize>(
    device: &DeviceConfig,
    range: &NdRange<D>,
    local_memory: &[LocalMemoryRequirement],
) -> Result<()> {
    if D as u32 > device.max_work_item_dimensions {
        return Err(Error::NdRange(format!(
            "work-item dimensionality {} exceeds device limit {}",
            D, device.max_work_item_dimensions,
        )));
    }

    let required_local_memory: u64 = local_memory.iter().map(|req| req.size_bytes as u64).sum();
    if required_local_memory > device.local_mem_size {
        return Err(Error::Accessor(format!(
            "total required local memory ({} B) exceeds device limit ({} B)",
            required_local_memory, device.local_mem_size,
        )));
    }

    if range.global_range().size() > 0 && !range.is_uniform() {
        return Err(Error::NdRange(format!(
            "global range {:?} is not divisible by local range {:?}",
            range.global_range(),
            range.local_range(),
        )));
    }

    let local_range = range.local_range();
    let exceeds_per_dimension =
        (0..D).any(|d| local_range[d] > device.max_work_item_size(D, d));
    if local_range.size() > device.max_work_group_size || exceeds_per_dimension {
        return Err(Error::NdRange(format!(
            "work-group size {:?} exceeds device limit",
            local_range,
        )));
    }

    let sub_groups_per_group = div_ceil(local_range.size(), device.sub_group_max_size());
    if sub_groups_per_group as u64 > device.max_num_sub_groups as u64 {
        return Err(Error::NdRange(format!(
            "number of sub-groups per work-group ({}) exceeds device limit ({})",
            sub_groups_per_group, device.max_num_sub_groups,
        )));
    }

    Ok(())
}

/// Drive an nd-range kernel to completion.
///
/// Validates `range` and `local_memory` against `device`, builds a fiber
/// pool of `min(total_groups, device.max_compute_units)` concurrent
/// work-groups, and resumes fibers in the order produced by `schedule` until
/// every work-item of every group instance has finished.
///
/// Panics thrown by work-items (including divergence diagnostics under the
/// `throw` check mode) do not stop their peers; they are captured per fiber
/// and reported afterwards as [`Error::Kernel`], in the order they were
/// caught.
pub fn dispatch_nd_range<const D: usize, K>(
    device: &DeviceConfig,
    schedule: &dyn CooperativeSchedule,
    range: NdRange<D>,
    local_memory: &[LocalMemoryRequirement],
    kernel: K,
) -> Result<()>
where
    K: Fn(&NdItem<D>),
{
    validate_nd_range(device, &range, local_memory)?;

    let global_range = range.global_range();
    if global_range.size() == 0 {
        return Ok(());
    }
    let local_range = range.local_range();
    let local_linear_range = local_range.size();
    let group_range = range.group_range();
    let group_linear_range = group_range.size();
    let offset = range.offset();

    let sub_group_max_size = device.sub_group_max_size();
    let sub_groups_per_group = div_ceil(local_linear_range, sub_group_max_size);

    // Bound the fiber pool by the device's compute units; fibers iterate
    // over group instances `num_concurrent_groups` apart.
    let max_concurrent_groups = (device.max_compute_units as usize).max(1);
    let num_concurrent_groups = group_linear_range.min(max_concurrent_groups);
    let num_concurrent_sub_groups = num_concurrent_groups * sub_groups_per_group;
    let num_concurrent_items = num_concurrent_groups * local_linear_range;

    log::trace!(
        "dispatching nd-range kernel: {group_linear_range} group(s) of {local_linear_range} item(s), {num_concurrent_groups} concurrent",
    );

    let concurrent_groups: Vec<Rc<ConcurrentGroup>> = (0..num_concurrent_groups)
        .map(|_| {
            let allocations: Vec<Allocation> = local_memory
                .iter()
                .map(|req| Allocation::new(req.size_bytes, req.align_bytes))
                .collect();
            Rc::new(ConcurrentGroup::new(allocations))
        })
        .collect();
    let concurrent_sub_groups: Vec<Rc<ConcurrentSubGroup>> = (0..num_concurrent_sub_groups)
        .map(|_| Rc::new(ConcurrentSubGroup::default()))
        .collect();
    let concurrent_items: Vec<Rc<ConcurrentItem>> = (0..num_concurrent_items)
        .map(|_| Rc::new(ConcurrentItem::default()))
        .collect();

    let items_exited = Rc::new(Cell::new(0usize));
    let caught_panics: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let kernel = &kernel;

    let mut fibers: Vec<Fiber> = Vec::with_capacity(num_concurrent_items);
    for concurrent_global_idx in 0..num_concurrent_items {
        // All of these stay fixed while the fiber iterates over groups.
        let local_linear_id = concurrent_global_idx % local_linear_range;
        let local_id = linear_index_to_id(local_range, local_linear_id);
        let sub_group_index_in_group = local_linear_id / sub_group_max_size;
        let lane_in_sub_group = local_linear_id % sub_group_max_size;
        let concurrent_group_idx = concurrent_global_idx / local_linear_range;
        let concurrent_sub_group_idx =
            concurrent_group_idx * sub_groups_per_group + sub_group_index_in_group;
        // The trailing sub-group is narrower when the group size is not a
        // multiple of the sub-group width.
        let sub_group_local_range = sub_group_max_size
            .min(local_linear_range - sub_group_index_in_group * sub_group_max_size);

        let concurrent_group = Rc::clone(&concurrent_groups[concurrent_group_idx]);
        let concurrent_sub_group = Rc::clone(&concurrent_sub_groups[concurrent_sub_group_idx]);
        let concurrent_item = Rc::clone(&concurrent_items[concurrent_global_idx]);
        let items_exited = Rc::clone(&items_exited);
        let caught_panics = Rc::clone(&caught_panics);

        fibers.push(Fiber::spawn(move || {
            // Yield before any user code so the scheduling loop can patch
            // local memory pointers.
            fiber::yield_to_scheduler().expect("work-item fiber failed its initial yield");

            let mut group_linear_id = concurrent_group_idx;
            while group_linear_id < group_linear_range {
                concurrent_item.group_ops_reached.set(0);
                concurrent_item.sub_group_ops_reached.set(0);

                // The first item to arrive in a group or sub-group creates
                // the fresh instance; everyone else observes it.
                {
                    let mut instance = concurrent_group.instance.borrow_mut();
                    if instance.group_linear_id != group_linear_id {
                        *instance = GroupInstance::new(group_linear_id);
                    }
                }
                let sub_group_linear_id =
                    group_linear_id * sub_groups_per_group + sub_group_index_in_group;
                {
                    let mut instance = concurrent_sub_group.instance.borrow_mut();
                    if instance.sub_group_linear_id != sub_group_linear_id {
                        *instance = SubGroupInstance::new(sub_group_linear_id);
                    }
                }

                let group_id = linear_index_to_id(group_range, group_linear_id);
                let global_id = group_id * Id::from(local_range) + local_id + offset;

                let global_item = Item::with_offset(global_id, global_range, offset);
                let local_item = Item::new(local_id, local_range);
                let group_item = Item::new(group_id, group_range);

                let group = Group::new(
                    local_item,
                    global_item,
                    group_item,
                    Rc::clone(&concurrent_group),
                    Rc::clone(&concurrent_item),
                );
                let sub_group = SubGroup::new(
                    Id::from(lane_in_sub_group),
                    Range::from(sub_group_local_range),
                    Range::from(sub_group_max_size),
                    Id::from(sub_group_index_in_group),
                    Range::from(sub_groups_per_group),
                    Rc::clone(&concurrent_sub_group),
                    Rc::clone(&concurrent_item),
                );
                let nd_item = NdItem::new(global_item, local_item, group, sub_group);

                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    kernel(&nd_item);
                    // The implicit trailing operations catch work-items
                    // diverging on the last explicit collective.
                    perform_exit_operation(nd_item.group());
                    perform_exit_operation(nd_item.sub_group());
                }));
                if let Err(payload) = outcome {
                    caught_panics.borrow_mut().push(panic_message(&*payload));
                }

                // Wait for all items of this group before advancing;
                // otherwise a later group instance could race this one on
                // the shared arena. If the recorded group id moves on,
                // another fiber already completed the hand-over.
                concurrent_group.instance.borrow_mut().items_exited += 1;
                loop {
                    {
                        let instance = concurrent_group.instance.borrow();
                        if instance.group_linear_id != group_linear_id
                            || instance.items_exited >= local_linear_range
                        {
                            break;
                        }
                    }
                    fiber::yield_to_scheduler()
                        .expect("work-item fiber failed to yield between group instances");
                }

                group_linear_id += num_concurrent_groups;
            }

            items_exited.set(items_exited.get() + 1);
        }));
    }

    let mut order = vec![0; num_concurrent_items];
    let mut state = schedule.init(&mut order);
    debug_assert!(is_permutation(&order));

    // Run until all fibers have terminated (the last sweep finds nothing
    // left to resume).
    let mut dbg_sweep = 0u64;
    while items_exited.get() < num_concurrent_items {
        dbg_sweep += 1;
        if dbg_sweep <= 5 {
            eprintln!("DBG sweep={dbg_sweep} items_exited={} / {}", items_exited.get(), num_concurrent_items);
        }
        for position in 0..order.len() {
            let concurrent_global_idx = order[position];
            if fibers[concurrent_global_idx].is_terminated() {
                continue;
            }

            // Rebind local memory to the resumed fiber's group before
            // switching; user code captures the slots by reference.
            let concurrent_group_idx = concurrent_global_idx / local_linear_range;
            let allocations = &concurrent_groups[concurrent_group_idx].allocations;
            for (requirement, allocation) in local_memory.iter().zip(allocations) {
                requirement.slot.set(allocation.as_ptr());
            }

            if let Err(err) = fibers[concurrent_global_idx].resume() {
                panic!("fiber protocol violation in the scheduler loop: {err}");
            }
        }
        state = schedule.update(state, &mut order);
        debug_assert!(is_permutation(&order));
    }

    let panics = caught_panics.take();
    if panics.is_empty() {
        Ok(())
    } else {
        Err(Error::Kernel(panics))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hierarchical dispatch
////////////////////////////////////////////////////////////////////////////////

/// Run a hierarchical kernel: once per work-group, with
/// [`WorkGroup::parallel_for_work_item`] descending to per-item scope.
///
/// Work-groups execute sequentially and their items have no collectives, so
/// no fibers are involved. Local memory is allocated once and bound for the
/// whole dispatch.
pub fn dispatch_work_groups<const D: usize, K>(
    device: &DeviceConfig,
    num_work_groups: Range<D>,
    work_group_size: Option<Range<D>>,
    local_memory: &[LocalMemoryRequirement],
    kernel: K,
) -> Result<()>
where
    K: Fn(&WorkGroup<D>),
{
    if D as u32 > device.max_work_item_dimensions {
        return Err(Error::NdRange(format!(
            "work-item dimensionality {} exceeds device limit {}",
            D, device.max_work_item_dimensions,
        )));
    }

    let required_local_memory: u64 = local_memory.iter().map(|req| req.size_bytes as u64).sum();
    if required_local_memory > device.local_mem_size {
        return Err(Error::Accessor(format!(
            "total required local memory ({} B) exceeds device limit ({} B)",
            required_local_memory, device.local_mem_size,
        )));
    }

    if let Some(local_range) = work_group_size {
        let exceeds_per_dimension =
            (0..D).any(|d| local_range[d] > device.max_work_item_size(D, d));
        if local_range.size() > device.max_work_group_size || exceeds_per_dimension {
            return Err(Error::NdRange(format!(
                "work-group size {:?} exceeds device limit",
                local_range,
            )));
        }
    }

    let local_allocations: Vec<Allocation> = local_memory
        .iter()
        .map(|req| Allocation::new(req.size_bytes, req.align_bytes))
        .collect();
    for (requirement, allocation) in local_memory.iter().zip(&local_allocations) {
        requirement.slot.set(allocation.as_ptr());
    }

    let local_range = work_group_size.unwrap_or_else(Range::unit);
    let global_range = local_range * num_work_groups;
    for group_linear_id in 0..num_work_groups.size() {
        let group_id = linear_index_to_id(num_work_groups, group_linear_id);
        let work_group = WorkGroup::new(
            Item::new(group_id, num_work_groups),
            local_range,
            global_range,
        );
        kernel(&work_group);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_produces_the_identity_permutation() {
        let mut order = vec![0; 8];
        let schedule = RoundRobinSchedule;
        let state = schedule.init(&mut order);
        assert_eq!(order, (0..8).collect::<Vec<_>>());
        schedule.update(state, &mut order);
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_produces_permutations() {
        let schedule = ShuffleSchedule::default();
        let mut order = vec![0; 64];
        let mut state = schedule.init(&mut order);
        for _ in 0..4 {
            assert!(is_permutation(&order));
            state = schedule.update(state, &mut order);
        }
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let mut first = vec![0; 32];
        let mut second = vec![0; 32];
        ShuffleSchedule::new(7).init(&mut first);
        ShuffleSchedule::new(7).init(&mut second);
        assert_eq!(first, second);

        let mut other = vec![0; 32];
        ShuffleSchedule::new(8).init(&mut other);
        assert_ne!(first, other);
    }

    #[test]
    fn schedule_specs_parse() {
        assert_eq!("round_robin".parse::<ScheduleSpec>().unwrap(), ScheduleSpec::RoundRobin);
        assert_eq!(
            "shuffle".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Shuffle { seed: None }
        );
        assert_eq!(
            "shuffle:42".parse::<ScheduleSpec>().unwrap(),
            ScheduleSpec::Shuffle { seed: Some(42) }
        );
        assert!("fifo".parse::<ScheduleSpec>().is_err());
        assert!("shuffle:x".parse::<ScheduleSpec>().is_err());
    }
}
