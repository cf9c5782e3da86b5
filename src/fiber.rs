//! Stackful cooperative fibers.
//!
//! Every simulated work-item runs on its own fiber so that user kernels can
//! suspend from arbitrarily deep call stacks (a group barrier may sit many
//! frames below the kernel entry point, which rules out a stackless
//! state-machine transform of opaque user code). The whole simulator runs on
//! a single OS thread; at most one fiber is executing at any moment and
//! control only changes hands at explicit [`resume`](Fiber::resume) /
//! [`yield_to_scheduler`] pairs.
//!
//! The scheduler side holds a [`Fiber`] handle per work-item. The fiber side
//! never sees its own handle; it suspends through the free functions of this
//! module, which track the active fiber in thread-local storage.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// Violations of the fiber control-flow contract.
///
/// These are not user errors: every variant indicates a bug in the calling
/// code, and the scheduler treats them as fatal.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FiberError {
    #[error("attempted to yield to the scheduler from outside a fiber")]
    YieldOutsideFiber,

    #[error("attempted to resume a terminated fiber")]
    ResumeTerminated,

    #[error("attempted to resume a fiber from within another fiber")]
    NestedResume,
}

/// State reported by [`Fiber::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// The fiber suspended via [`yield_to_scheduler`] and can be resumed
    /// again.
    Suspended,
    /// The fiber ran off the end of its entry function and must not be
    /// resumed again.
    Terminated,
}

thread_local! {
    // Yielder of the currently executing fiber, if any. Set on fiber entry
    // and around every suspension so that `yield_to_scheduler` can be called
    // from anywhere below the entry function.
    static ACTIVE_FIBER: Cell<Option<NonNull<Yielder<(), ()>>>> = Cell::new(None);
}

/// A suspended user computation with its own stack.
///
/// Created in the suspended state: [`spawn`](Fiber::spawn) does not run any
/// user code, the first [`resume`](Fiber::resume) enters the entry function.
pub struct Fiber<'a> {
    coroutine: Coroutine<(), (), (), DefaultStack>,
    // `coroutine` is created via `with_stack_unchecked`, which lifts the
    // `'static` bound normally required on the entry closure; this marker
    // ties the borrows captured by that closure back to `'a` so they can't
    // outlive the `Fiber`.
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> Fiber<'a> {
    /// Create a fiber that will execute `entry` once resumed.
    pub fn spawn<F>(entry: F) -> Self
    where
        F: FnOnce() + 'a,
    {
        // SAFETY: `entry` (and anything it borrows) is kept alive for at
        // least `'a` by the caller, and the `Fiber` is bound by the same
        // `'a` via `_marker`, so the closure cannot outlive its captures.
        let coroutine = unsafe {
            Coroutine::with_stack_unchecked(
                DefaultStack::default(),
                move |yielder: &Yielder<(), ()>, ()| {
                    ACTIVE_FIBER.with(|active| active.set(Some(NonNull::from(yielder))));
                    entry();
                    ACTIVE_FIBER.with(|active| active.set(None));
                },
            )
        };
        Self {
            coroutine,
            _marker: PhantomData,
        }
    }

    /// Transfer control into the fiber until it suspends or terminates.
    pub fn resume(&mut self) -> Result<FiberState, FiberError> {
        if self.coroutine.done() {
            return Err(FiberError::ResumeTerminated);
        }
        if ACTIVE_FIBER.with(|active| active.get()).is_some() {
            return Err(FiberError::NestedResume);
        }
        match self.coroutine.resume(()) {
            CoroutineResult::Yield(()) => Ok(FiberState::Suspended),
            CoroutineResult::Return(()) => Ok(FiberState::Terminated),
        }
    }

    /// True once the entry function has returned.
    #[inline(always)]
    pub fn is_terminated(&self) -> bool {
        self.coroutine.done()
    }
}

impl std::fmt::Debug for Fiber<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("started", &self.coroutine.started())
            .field("terminated", &self.coroutine.done())
            .finish()
    }
}

/// Suspend the current fiber and return control to the matching
/// [`Fiber::resume`].
///
/// Returns [`FiberError::YieldOutsideFiber`] when no fiber is executing.
pub fn yield_to_scheduler() -> Result<(), FiberError> {
    let yielder = ACTIVE_FIBER
        .with(|active| active.get())
        .ok_or(FiberError::YieldOutsideFiber)?;
    ACTIVE_FIBER.with(|active| active.set(None));
    // SAFETY: the yielder was registered by the running fiber's entry
    // wrapper and stays valid until that fiber returns; it is unregistered
    // for the duration of the suspension so no one else can observe it.
    unsafe { yielder.as_ref() }.suspend(());
    ACTIVE_FIBER.with(|active| active.set(Some(yielder)));
    Ok(())
}

/// Suspend if called from inside a fiber, otherwise do nothing.
///
/// This is the cooperative-yield hint behind `atomic_fence`: fences carry no
/// synchronization meaning in a single-threaded simulator, but yielding here
/// lets the schedule policy interleave other work-items.
#[inline]
pub fn maybe_yield_to_scheduler() {
    if ACTIVE_FIBER.with(|active| active.get()).is_some() {
        let _ = yield_to_scheduler();
    }
}

/// True while executing on a fiber spawned by this module.
#[inline]
pub fn in_fiber() -> bool {
    ACTIVE_FIBER.with(|active| active.get()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn spawn_does_not_run_user_code() {
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        let mut fiber = Fiber::spawn(move || ran_clone.set(true));
        assert!(!ran.get());
        assert_eq!(fiber.resume().unwrap(), FiberState::Terminated);
        assert!(ran.get());
    }

    #[test]
    fn resume_and_yield_alternate() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let trace_clone = trace.clone();
        let mut fiber = Fiber::spawn(move || {
            trace_clone.borrow_mut().push("a");
            yield_to_scheduler().unwrap();
            trace_clone.borrow_mut().push("b");
            yield_to_scheduler().unwrap();
            trace_clone.borrow_mut().push("c");
        });

        assert_eq!(fiber.resume().unwrap(), FiberState::Suspended);
        trace.borrow_mut().push("x");
        assert_eq!(fiber.resume().unwrap(), FiberState::Suspended);
        trace.borrow_mut().push("y");
        assert_eq!(fiber.resume().unwrap(), FiberState::Terminated);
        assert!(fiber.is_terminated());
        assert_eq!(*trace.borrow(), ["a", "x", "b", "y", "c"]);
    }

    #[test]
    fn resuming_a_terminated_fiber_fails() {
        let mut fiber = Fiber::spawn(|| {});
        assert_eq!(fiber.resume().unwrap(), FiberState::Terminated);
        assert!(matches!(fiber.resume(), Err(FiberError::ResumeTerminated)));
    }

    #[test]
    fn yielding_outside_a_fiber_fails() {
        assert!(!in_fiber());
        assert!(matches!(
            yield_to_scheduler(),
            Err(FiberError::YieldOutsideFiber)
        ));
    }

    #[test]
    fn maybe_yield_is_a_no_op_outside_fibers() {
        maybe_yield_to_scheduler();
    }

    #[test]
    fn fibers_interleave_deterministically() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut fibers: Vec<Fiber> = (0..3)
            .map(|i| {
                let log = log.clone();
                Fiber::spawn(move || {
                    for step in 0..2 {
                        log.borrow_mut().push((i, step));
                        yield_to_scheduler().unwrap();
                    }
                })
            })
            .collect();

        while fibers.iter().any(|f| !f.is_terminated()) {
            for fiber in &mut fibers {
                if !fiber.is_terminated() {
                    fiber.resume().unwrap();
                }
            }
        }
        assert_eq!(
            *log.borrow(),
            [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]
        );
    }
}
