//! Busy-wait primitives for hardware status bits.

use core::ops::ControlFlow;

use crate::idle::IdleHook;
use crate::serial::Cancelled;

/// A bounded wait ran out of polls before the condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimedOut;

/// Spin until `ready` returns `true`. There is no way out if it never does.
#[inline]
pub fn spin_until(mut ready: impl FnMut() -> bool) {
    while !ready() {
        core::hint::spin_loop();
    }
}

/// Spin until `ready` returns `true`, polling `hook` after every miss.
///
/// The condition is always checked before the hook, so a condition that
/// already holds completes without consulting the hook at all.
#[inline]
pub fn spin_until_or_cancel<H: IdleHook + ?Sized>(
    mut ready: impl FnMut() -> bool,
    hook: &mut H,
) -> Result<(), Cancelled> {
    while !ready() {
        if let ControlFlow::Break(()) = hook.on_idle() {
            return Err(Cancelled);
        }
    }
    Ok(())
}

/// Spin until `ready` returns `true`, giving up after `max_polls` misses.
#[inline]
pub fn spin_until_bounded(mut ready: impl FnMut() -> bool, max_polls: u32) -> Result<(), TimedOut> {
    let mut misses = 0;
    while !ready() {
        if misses == max_polls {
            return Err(TimedOut);
        }
        misses += 1;
        core::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::idle::{FnHook, NoHook};

    #[test]
    fn ready_condition_skips_hook() {
        let mut polls = 0;
        let mut hook = FnHook(|| {
            polls += 1;
            ControlFlow::Break(())
        });
        assert_eq!(spin_until_or_cancel(|| true, &mut hook), Ok(()));
        drop(hook);
        assert_eq!(polls, 0);
    }

    #[test]
    fn hook_is_polled_once_per_miss() {
        let mut checks = 0;
        let mut polls = 0;
        let mut hook = FnHook(|| {
            polls += 1;
            ControlFlow::Continue(())
        });
        let r = spin_until_or_cancel(
            || {
                checks += 1;
                checks == 4
            },
            &mut hook,
        );
        drop(hook);
        assert_eq!(r, Ok(()));
        assert_eq!(checks, 4);
        assert_eq!(polls, 3);
    }

    #[test]
    fn cancel_stops_checking() {
        let mut checks = 0;
        let mut hook = FnHook(|| ControlFlow::Break(()));
        let r = spin_until_or_cancel(
            || {
                checks += 1;
                false
            },
            &mut hook,
        );
        assert_eq!(r, Err(Cancelled));
        assert_eq!(checks, 1);
    }

    #[test]
    fn no_hook_waits_for_condition() {
        let mut checks = 0;
        let r = spin_until_or_cancel(
            || {
                checks += 1;
                checks > 100
            },
            &mut NoHook,
        );
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn bounded_wait_counts_misses() {
        let mut checks = 0;
        let r = spin_until_bounded(
            || {
                checks += 1;
                checks == 6
            },
            5,
        );
        assert_eq!(r, Ok(()));

        let mut checks = 0;
        let r = spin_until_bounded(
            || {
                checks += 1;
                false
            },
            5,
        );
        assert_eq!(r, Err(TimedOut));
        assert_eq!(checks, 6);
    }

    #[test]
    fn unbounded_wait_returns_when_ready() {
        let mut checks = 0;
        spin_until(|| {
            checks += 1;
            checks == 10
        });
        assert_eq!(checks, 10);
    }
}
