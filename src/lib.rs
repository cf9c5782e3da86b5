//! SimSYCL execution core: a single-threaded, deterministic simulator for
//! SYCL 2020 nd-range kernels.
//!
//! Kernels run on stackful [fibers](fiber), one per simulated work-item,
//! driven by a cooperative scheduler on one OS thread. Group operations
//! (barriers, broadcasts, reductions, scans, shuffles — see [`collectives`])
//! rendezvous through a per-group operation log that detects work-items
//! diverging from lockstep; what happens on divergence is governed by the
//! [check mode](check). The resume order of work-items is pluggable
//! ([`schedule::CooperativeSchedule`]): round-robin preserves the natural
//! SPMD order, a seeded shuffle reproducibly surfaces schedule-dependent
//! data races.
//!
//! ```
//! use std::cell::Cell;
//! use simsycl::{collectives, schedule, system, NdRange};
//!
//! let visited: Vec<Cell<i32>> = (0..8).map(|_| Cell::new(0)).collect();
//! schedule::dispatch_nd_range(
//!     system::default_device(),
//!     &schedule::RoundRobinSchedule,
//!     NdRange::new([8], [4]),
//!     &[],
//!     |item| {
//!         let sum = collectives::reduce_over_group(
//!             item.group(),
//!             item.local_linear_id() as i32,
//!             simsycl::ops::Plus,
//!         );
//!         visited[item.global_linear_id()].set(sum);
//!     },
//! )
//! .unwrap();
//! assert!(visited.iter().all(|v| v.get() == 0 + 1 + 2 + 3));
//! ```
//!
//! ### Environment
//!
//! * `SIMSYCL_SCHEDULE=round_robin | shuffle[:seed]` selects the default
//!   schedule policy returned by [`system::default_schedule`].
//! * `SIMSYCL_SYSTEM=path/to/system.json` replaces the builtin device
//!   configuration returned by [`system::default_system_config`].
//!
//! ### Check modes
//!
//! Divergence diagnostics are ignored, logged, raised as panics at the
//! offending work-item, or abort the process, depending on the `check-*`
//! cargo feature compiled in (`check-throw` by default). Tests can override
//! the mode for a scope with [`check::CheckModeGuard`].

pub mod arena;
pub mod check;
pub mod collectives;
pub mod coord;
pub mod error;
pub mod fiber;
pub mod group;
pub mod group_op;
pub mod item;
pub mod ops;
pub mod schedule;
pub mod system;

pub use arena::LocalMemoryRequirement;
pub use coord::{Id, NdRange, Range};
pub use error::{Error, Result};
pub use group::{Group, NdItem, SubGroup, WorkGroup};
pub use item::{HItem, Item};
pub use schedule::{
    dispatch_nd_range, dispatch_range, dispatch_work_groups, CooperativeSchedule,
    RoundRobinSchedule, ShuffleSchedule,
};

pub type StdResult<T, E> = std::result::Result<T, E>;
