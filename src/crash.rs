//! Thread crash protection.
//!
//! Runs a callback such that a failure in it (a `panic!`, standing in for
//! the faults the runtime's handlers funnel here) aborts the callback and
//! resumes at the protector instead of terminating the process.  The
//! unwinding is best effort: the callback's partial side effects remain.
//! Unlike a longjmp-based protector, Rust unwinding does run destructors
//! along the aborted path.  Diagnostics use only.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static PROTECTION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Payload used by [`CrashProtection::unwind_if_protected`].
struct UnwindToken;

pub struct CrashProtection;

impl CrashProtection {
    /// Invoke `callback` within a protected scope.  Returns true if the
    /// invocation completes normally, false if it was aborted.  Scopes
    /// nest; an aborted inner scope does not disturb the outer one.
    pub fn call<F: FnOnce()>(callback: F) -> bool {
        let depth = PROTECTION_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });
        let result = panic::catch_unwind(AssertUnwindSafe(callback));
        // Restore the protection chain whichever way the callback ended.
        PROTECTION_DEPTH.with(|d| d.set(depth));
        result.is_ok()
    }

    /// Whether the current thread is within a protected scope.
    pub fn is_protected() -> bool {
        PROTECTION_DEPTH.with(|d| d.get()) > 0
    }

    /// Abort the protected callback, resuming at the protector.  Does
    /// nothing when the current thread is not protected.
    pub fn unwind_if_protected() {
        if Self::is_protected() {
            panic::panic_any(UnwindToken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_completion_reports_true() {
        let mut ran = false;
        assert!(CrashProtection::call(|| ran = true));
        assert!(ran);
    }

    #[test]
    fn aborted_callback_reports_false() {
        let hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let ok = CrashProtection::call(|| {
            CrashProtection::unwind_if_protected();
            unreachable!();
        });
        panic::set_hook(hook);
        assert!(!ok);
        assert!(!CrashProtection::is_protected());
    }

    #[test]
    fn scopes_nest() {
        let hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let outer = CrashProtection::call(|| {
            assert!(CrashProtection::is_protected());
            let inner = CrashProtection::call(|| panic!("inner fault"));
            assert!(!inner);
            assert!(CrashProtection::is_protected());
        });
        panic::set_hook(hook);
        assert!(outer);
    }

    #[test]
    fn unprotected_unwind_is_a_no_op() {
        assert!(!CrashProtection::is_protected());
        CrashProtection::unwind_if_protected();
    }
}
