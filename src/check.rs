//! Lockstep-violation checks.
//!
//! The group-operation engine validates that all work-items of a group agree
//! on the collective they are executing. What happens when a check fails is
//! governed by a [`CheckMode`]: the build-time default is selected through
//! the `check-*` cargo features, and tests can override it for a scope with
//! a [`CheckModeGuard`].

use std::cell::Cell;
use std::fmt;

/// How detected protocol violations are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Violations are ignored.
    None,
    /// Violations are logged through the `log` facade and execution
    /// continues.
    Log,
    /// Violations raise a panic at the offending work-item; the dispatcher
    /// captures it like any other kernel panic.
    Throw,
    /// Violations abort the process.
    Abort,
}

/// Check mode compiled in through cargo features. When several features are
/// enabled the strictest wins.
pub const DEFAULT_CHECK_MODE: CheckMode = if cfg!(feature = "check-abort") {
    CheckMode::Abort
} else if cfg!(feature = "check-throw") {
    CheckMode::Throw
} else if cfg!(feature = "check-log") {
    CheckMode::Log
} else if cfg!(feature = "check-none") {
    CheckMode::None
} else {
    CheckMode::Throw
};

thread_local! {
    static CHECK_MODE_OVERRIDE: Cell<Option<CheckMode>> = Cell::new(None);
}

/// The mode checks currently report under.
#[inline]
pub fn active_check_mode() -> CheckMode {
    CHECK_MODE_OVERRIDE
        .with(|cell| cell.get())
        .unwrap_or(DEFAULT_CHECK_MODE)
}

/// Overrides the check mode on the current thread for the guard's lifetime.
///
/// Guards nest; dropping one restores the previously active override.
#[must_use = "the override only lasts while the guard is alive"]
pub struct CheckModeGuard {
    previous: Option<CheckMode>,
}

impl CheckModeGuard {
    pub fn new(mode: CheckMode) -> Self {
        let previous = CHECK_MODE_OVERRIDE.with(|cell| cell.replace(Some(mode)));
        Self { previous }
    }
}

impl Drop for CheckModeGuard {
    fn drop(&mut self) {
        CHECK_MODE_OVERRIDE.with(|cell| cell.set(self.previous));
    }
}

/// Report a failed check according to the active mode.
#[track_caller]
pub(crate) fn report_violation(message: fmt::Arguments) {
    match active_check_mode() {
        CheckMode::None => {}
        CheckMode::Log => log::error!("{message}"),
        CheckMode::Throw => std::panic::panic_any(message.to_string()),
        CheckMode::Abort => {
            eprintln!("{message}");
            std::process::abort();
        }
    }
}

/// Evaluate a lockstep condition; on failure report the formatted diagnostic
/// under the active [`CheckMode`].
macro_rules! group_check {
    ($condition:expr, $($arg:tt)+) => {
        if !$condition {
            $crate::check::report_violation(format_args!($($arg)+));
        }
    };
}

pub(crate) use group_check;
