//! Collective operations: barriers, broadcasts, reductions, scans, shuffles,
//! joint operations and divergence detection.

use std::cell::{Cell, RefCell};

use pretty_assertions::assert_eq;
use simsycl::collectives::{
    all_of_group, any_of_group, atomic_fence, exclusive_scan_over_group,
    exclusive_scan_over_group_with_init, group_barrier, group_broadcast, inclusive_scan_over_group,
    inclusive_scan_over_group_with_init, joint_all_of, joint_any_of, joint_exclusive_scan,
    joint_inclusive_scan, joint_none_of, joint_reduce, joint_reduce_with_init, none_of_group,
    permute_group_by_xor, reduce_over_group, reduce_over_group_with_init, select_from_group,
    shift_group_left, shift_group_right,
};
use simsycl::group_op::{recorded_operation_ids, GroupOperationId};
use simsycl::ops::{LaneValue, Maximum, Plus};
use simsycl::schedule::dispatch_nd_range;
use simsycl::system::DeviceConfig;
use simsycl::{Error, NdRange, RoundRobinSchedule, ShuffleSchedule};

fn test_device() -> DeviceConfig {
    simsycl::system::builtin_device()
}

fn device_with_sub_group_size(size: usize) -> DeviceConfig {
    let mut device = test_device();
    device.sub_group_sizes = vec![size];
    device
}

/// Run the kernel under both builtin schedules.
fn for_all_schedules(f: impl Fn(&dyn simsycl::CooperativeSchedule)) {
    f(&RoundRobinSchedule);
    f(&ShuffleSchedule::default());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Checkpoint {
    A,
    B,
    C,
}

fn check_barrier_ordering(records: &[(Checkpoint, usize)], groups: &[Vec<usize>]) {
    for group in groups {
        let positions = |checkpoint: Checkpoint| -> Vec<usize> {
            records
                .iter()
                .enumerate()
                .filter(|(_, &(c, id))| c == checkpoint && group.contains(&id))
                .map(|(position, _)| position)
                .collect()
        };
        let a = positions(Checkpoint::A);
        let b = positions(Checkpoint::B);
        let c = positions(Checkpoint::C);
        assert_eq!(a.len(), group.len());
        assert_eq!(b.len(), group.len());
        assert_eq!(c.len(), group.len());
        // All A records of a group precede all its B records, which precede
        // all its C records.
        assert!(a.iter().max() < b.iter().min());
        assert!(b.iter().max() < c.iter().min());
    }
}

#[test]
fn group_barriers_separate_checkpoints() {
    for_all_schedules(|schedule| {
        let records = RefCell::new(Vec::new());

        dispatch_nd_range(
            &test_device(),
            schedule,
            NdRange::new([4], [2]),
            &[],
            |item| {
                let id = item.global_linear_id();
                records.borrow_mut().push((Checkpoint::A, id));
                group_barrier(item.group());
                records.borrow_mut().push((Checkpoint::B, id));
                group_barrier(item.group());
                records.borrow_mut().push((Checkpoint::C, id));

                let mut ids = recorded_operation_ids(item.group());
                if ids.last() == Some(&GroupOperationId::Exit) {
                    ids.pop();
                }
                assert_eq!(ids, [GroupOperationId::Barrier, GroupOperationId::Barrier]);
            },
        )
        .unwrap();

        check_barrier_ordering(&records.into_inner(), &[vec![0, 1], vec![2, 3]]);
    });
}

#[test]
fn sub_group_barriers_separate_checkpoints() {
    for_all_schedules(|schedule| {
        let records = RefCell::new(Vec::new());

        dispatch_nd_range(
            &device_with_sub_group_size(2),
            schedule,
            NdRange::new([4], [4]),
            &[],
            |item| {
                let id = item.global_linear_id();
                let sg = item.sub_group();
                records.borrow_mut().push((Checkpoint::A, id));
                group_barrier(sg);
                records.borrow_mut().push((Checkpoint::B, id));
                group_barrier(sg);
                records.borrow_mut().push((Checkpoint::C, id));
            },
        )
        .unwrap();

        check_barrier_ordering(&records.into_inner(), &[vec![0, 1], vec![2, 3]]);
    });
}

#[test]
fn group_broadcast_distributes_the_origin_lane_value() {
    for_all_schedules(|schedule| {
        let results: Vec<Cell<i32>> = (0..8).map(|_| Cell::new(0)).collect();

        dispatch_nd_range(
            &test_device(),
            schedule,
            NdRange::new([8], [4]),
            &[],
            |item| {
                let value =
                    group_broadcast(item.group(), 40 + item.global_linear_id() as i32, 2);
                results[item.global_linear_id()].set(value);
            },
        )
        .unwrap();

        let results: Vec<i32> = results.iter().map(Cell::get).collect();
        assert_eq!(results, [42, 42, 42, 42, 46, 46, 46, 46]);
    });
}

#[test]
fn broadcast_from_a_nonexistent_lane_is_diagnosed() {
    let err = dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            group_broadcast(item.group(), 1, 7);
        },
    )
    .unwrap_err();

    match err {
        Error::Kernel(panics) => {
            assert!(panics[0].contains("origin lane 7"));
            assert!(panics[0].contains("4 work-items"));
        }
        other => panic!("expected a kernel error, got {other}"),
    }
}

#[test]
fn scans_over_group_match_known_sequences() {
    for_all_schedules(|schedule| {
        let exclusive_plus: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(-1)).collect();
        let inclusive_plus: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(-1)).collect();
        let exclusive_max: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(-1)).collect();

        dispatch_nd_range(
            &test_device(),
            schedule,
            NdRange::new([4], [4]),
            &[],
            |item| {
                let lane = item.local_linear_id();
                let x = lane as i32 + 1; // [1, 2, 3, 4]
                exclusive_plus[lane].set(exclusive_scan_over_group(item.group(), x, Plus));
                inclusive_plus[lane].set(inclusive_scan_over_group(item.group(), x, Plus));
                exclusive_max[lane].set(exclusive_scan_over_group(item.group(), x, Maximum));
            },
        )
        .unwrap();

        let collect = |cells: &[Cell<i32>]| cells.iter().map(Cell::get).collect::<Vec<_>>();
        assert_eq!(collect(&exclusive_plus), [0, 1, 3, 6]);
        assert_eq!(collect(&inclusive_plus), [1, 3, 6, 10]);
        assert_eq!(collect(&exclusive_max), [i32::MIN, 1, 2, 3]);
    });
}

#[test]
fn exclusive_scan_followed_by_the_op_equals_inclusive_scan() {
    let agreement = Cell::new(true);

    dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([8], [8]),
        &[],
        |item| {
            let x = (item.local_linear_id() as i32 + 3) * 7 % 13;
            let exclusive = exclusive_scan_over_group(item.group(), x, Plus);
            let inclusive = inclusive_scan_over_group(item.group(), x, Plus);
            if exclusive + x != inclusive {
                agreement.set(false);
            }
        },
    )
    .unwrap();

    assert!(agreement.get());
}

#[test]
fn scans_with_init_are_seeded() {
    let exclusive: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(0)).collect();
    let inclusive: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let lane = item.local_linear_id();
            let x = lane as i32 + 1;
            exclusive[lane].set(exclusive_scan_over_group_with_init(item.group(), x, 100, Plus));
            inclusive[lane].set(inclusive_scan_over_group_with_init(item.group(), x, 100, Plus));
        },
    )
    .unwrap();

    assert_eq!(exclusive.iter().map(Cell::get).collect::<Vec<_>>(), [100, 101, 103, 106]);
    assert_eq!(inclusive.iter().map(Cell::get).collect::<Vec<_>>(), [101, 103, 106, 110]);
}

#[test]
fn reduce_over_group_equals_a_sequential_fold() {
    for_all_schedules(|schedule| {
        let results: Vec<Cell<i32>> = (0..8).map(|_| Cell::new(0)).collect();
        let seeded: Vec<Cell<i32>> = (0..8).map(|_| Cell::new(0)).collect();

        dispatch_nd_range(
            &test_device(),
            schedule,
            NdRange::new([8], [4]),
            &[],
            |item| {
                let x = item.global_linear_id() as i32 + 1;
                let linear = item.global_linear_id();
                results[linear].set(reduce_over_group(item.group(), x, Plus));
                seeded[linear].set(reduce_over_group_with_init(item.group(), x, 1000, Plus));
            },
        )
        .unwrap();

        // Group 0 holds [1,2,3,4], group 1 holds [5,6,7,8].
        for linear in 0..8 {
            let expected = if linear < 4 { 10 } else { 26 };
            assert_eq!(results[linear].get(), expected);
            assert_eq!(seeded[linear].get(), expected + 1000);
        }
    });
}

#[test]
fn shifts_reference_neighboring_lanes() {
    let device = device_with_sub_group_size(4);
    let left: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(0)).collect();
    let right: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &device,
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let sg = item.sub_group();
            let lane = sg.local_linear_id();
            let x = 10 * (lane as i32 + 1);
            left[lane].set(shift_group_left(sg, x, 1));
            right[lane].set(shift_group_right(sg, x, 2));
        },
    )
    .unwrap();

    let unspecified = i32::unspecified();
    assert_eq!(
        left.iter().map(Cell::get).collect::<Vec<_>>(),
        [20, 30, 40, unspecified]
    );
    assert_eq!(
        right.iter().map(Cell::get).collect::<Vec<_>>(),
        [unspecified, unspecified, 10, 20]
    );
}

#[test]
fn permute_by_xor_pairs_lanes() {
    let device = device_with_sub_group_size(4);
    let results: Vec<Cell<u32>> = (0..4).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &device,
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let sg = item.sub_group();
            let lane = sg.local_linear_id();
            results[lane].set(permute_group_by_xor(sg, 100 + lane as u32, 0b01));
        },
    )
    .unwrap();

    assert_eq!(
        results.iter().map(Cell::get).collect::<Vec<_>>(),
        [101, 100, 103, 102]
    );
}

#[test]
fn select_reads_an_arbitrary_lane_per_item() {
    let device = device_with_sub_group_size(4);
    let results: Vec<Cell<u32>> = (0..4).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &device,
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let sg = item.sub_group();
            let lane = sg.local_linear_id();
            // Everyone reads its left neighbor, lane 0 wraps around.
            let remote = (lane + 3) % 4;
            results[lane].set(select_from_group(sg, 100 + lane as u32, remote));
        },
    )
    .unwrap();

    assert_eq!(
        results.iter().map(Cell::get).collect::<Vec<_>>(),
        [103, 100, 101, 102]
    );
}

#[test]
fn trailing_sub_groups_use_their_actual_lane_count() {
    let device = device_with_sub_group_size(4);
    let lane_counts: Vec<Cell<usize>> = (0..6).map(|_| Cell::new(0)).collect();
    let sums: Vec<Cell<usize>> = (0..6).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &device,
        &RoundRobinSchedule,
        NdRange::new([6], [6]),
        &[],
        |item| {
            let sg = item.sub_group();
            let linear = item.global_linear_id();
            assert_eq!(sg.max_local_range().size(), 4);
            assert_eq!(sg.group_range().size(), 2);
            lane_counts[linear].set(sg.local_range().size());
            // A collective over the trailing sub-group must expect exactly
            // its actual lanes, or this would diverge and hang or throw.
            sums[linear].set(reduce_over_group(sg, 1usize, Plus));
        },
    )
    .unwrap();

    let lane_counts: Vec<usize> = lane_counts.iter().map(Cell::get).collect();
    let sums: Vec<usize> = sums.iter().map(Cell::get).collect();
    assert_eq!(lane_counts, [4, 4, 4, 4, 2, 2]);
    assert_eq!(sums, [4, 4, 4, 4, 2, 2]);
}

#[test]
fn predicate_collectives_combine_lane_votes() {
    let results = RefCell::new(Vec::new());

    dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let lane = item.local_linear_id();
            let any = any_of_group(item.group(), lane == 2);
            let all = all_of_group(item.group(), lane < 4);
            let none = none_of_group(item.group(), lane > 10);
            let none_failing = none_of_group(item.group(), lane == 0);
            results.borrow_mut().push((any, all, none, none_failing));
        },
    )
    .unwrap();

    for entry in results.into_inner() {
        assert_eq!(entry, (true, true, true, false));
    }
}

#[test]
fn joint_collectives_operate_on_shared_buffers() {
    let input = [1, 5, 2, 8, 3];
    let results = RefCell::new(Vec::new());

    dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let g = item.group();
            let any = joint_any_of(g, &input, |&x| x > 7);
            let all = joint_all_of(g, &input, |&x| x > 0);
            let none = joint_none_of(g, &input, |&x| x > 100);
            let sum = joint_reduce(g, &input, Plus);
            let seeded = joint_reduce_with_init(g, &input, 100, Plus);
            results.borrow_mut().push((any, all, none, sum, seeded));
        },
    )
    .unwrap();

    for entry in results.into_inner() {
        assert_eq!(entry, (true, true, true, 19, 119));
    }
}

#[test]
fn joint_scans_write_the_shared_output_buffer() {
    let input = [1, 2, 3, 4];
    let exclusive: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(-1)).collect();
    let inclusive: Vec<Cell<i32>> = (0..4).map(|_| Cell::new(-1)).collect();

    dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            joint_exclusive_scan(item.group(), &input, &exclusive, Plus);
            joint_inclusive_scan(item.group(), &input, &inclusive, Plus);
        },
    )
    .unwrap();

    assert_eq!(exclusive.iter().map(Cell::get).collect::<Vec<_>>(), [0, 1, 3, 6]);
    assert_eq!(inclusive.iter().map(Cell::get).collect::<Vec<_>>(), [1, 3, 6, 10]);
}

#[test]
fn atomic_fences_are_yield_points_only() {
    let visits: Vec<Cell<u32>> = (0..8).map(|_| Cell::new(0)).collect();

    dispatch_nd_range(
        &test_device(),
        &ShuffleSchedule::default(),
        NdRange::new([8], [4]),
        &[],
        |item| {
            atomic_fence();
            let linear = item.global_linear_id();
            visits[linear].set(visits[linear].get() + 1);
            atomic_fence();
        },
    )
    .unwrap();

    assert!(visits.iter().all(|count| count.get() == 1));
}

#[test]
fn diverging_operation_ids_are_diagnosed_with_the_offending_lane() {
    let err = dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            let lane = item.local_linear_id();
            if lane < 2 {
                any_of_group(item.group(), true);
            } else {
                all_of_group(item.group(), true);
            }
        },
    )
    .unwrap_err();

    match err {
        Error::Kernel(panics) => {
            // Lane 2 is the first to disagree with the recorded op.
            assert!(panics[0].contains("operation id mismatch"), "{}", panics[0]);
            assert!(panics[0].contains("any_of"), "{}", panics[0]);
            assert!(panics[0].contains("all_of"), "{}", panics[0]);
            assert!(panics[0].contains("#2"), "{}", panics[0]);
        }
        other => panic!("expected a kernel error, got {other}"),
    }
}

#[test]
fn work_items_skipping_the_last_collective_are_diagnosed_at_exit() {
    let err = dispatch_nd_range(
        &test_device(),
        &RoundRobinSchedule,
        NdRange::new([4], [4]),
        &[],
        |item| {
            // Lanes 2 and 3 return early; their implicit exit operation
            // collides with the barrier the others are waiting in.
            if item.local_linear_id() < 2 {
                group_barrier(item.group());
            }
        },
    )
    .unwrap_err();

    match err {
        Error::Kernel(panics) => {
            assert!(panics[0].contains("barrier"), "{}", panics[0]);
            assert!(panics[0].contains("exit"), "{}", panics[0]);
        }
        other => panic!("expected a kernel error, got {other}"),
    }
}
