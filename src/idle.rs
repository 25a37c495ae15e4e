//! Hooks polled while a blocking operation waits on the hardware.

use core::ops::ControlFlow;

/// Called on every unsuccessful poll of a cancellable wait.
///
/// Returning [`ControlFlow::Break`] cancels the wait. The hook may do any
/// incidental work it likes (toggling a heartbeat LED, feeding a watchdog),
/// but it runs with the driver mutably borrowed, so it cannot re-enter it.
pub trait IdleHook {
    /// One poll of the wait loop.
    fn on_idle(&mut self) -> ControlFlow<()>;
}

/// A hook that never cancels and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl IdleHook for NoHook {
    #[inline]
    fn on_idle(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// An absent hook behaves like [`NoHook`], so `None` clears an installed hook.
impl<H: IdleHook> IdleHook for Option<H> {
    #[inline]
    fn on_idle(&mut self) -> ControlFlow<()> {
        match self {
            Some(hook) => hook.on_idle(),
            None => ControlFlow::Continue(()),
        }
    }
}

impl<H: IdleHook + ?Sized> IdleHook for &mut H {
    #[inline]
    fn on_idle(&mut self) -> ControlFlow<()> {
        (**self).on_idle()
    }
}

/// Adapts a closure into an [`IdleHook`].
pub struct FnHook<F>(pub F);

impl<F: FnMut() -> ControlFlow<()>> IdleHook for FnHook<F> {
    #[inline]
    fn on_idle(&mut self) -> ControlFlow<()> {
        (self.0)()
    }
}

/// A plain function paired with the context it operates on.
pub struct ContextHook<C> {
    fun: fn(&mut C) -> ControlFlow<()>,
    context: C,
}

impl<C> ContextHook<C> {
    /// Pair `fun` with `context`.
    pub const fn new(fun: fn(&mut C) -> ControlFlow<()>, context: C) -> Self {
        ContextHook { fun, context }
    }

    /// The context handed to `fun`.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Give back the context.
    pub fn into_context(self) -> C {
        self.context
    }
}

impl<C> IdleHook for ContextHook<C> {
    #[inline]
    fn on_idle(&mut self) -> ControlFlow<()> {
        (self.fun)(&mut self.context)
    }
}

/// Cancels once it has been polled a fixed number of times.
///
/// This turns any cancellable wait into a bounded one. The budget is shared
/// by every wait it is polled from until it is [reset](SpinBudget::reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinBudget {
    limit: u32,
    remaining: u32,
}

impl SpinBudget {
    /// Allow `polls` polls before cancelling.
    pub const fn new(polls: u32) -> Self {
        SpinBudget {
            limit: polls,
            remaining: polls,
        }
    }

    /// Polls left before the next one cancels.
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Restore the full budget.
    pub fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

impl IdleHook for SpinBudget {
    fn on_idle(&mut self) -> ControlFlow<()> {
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(()),
        }
    }
}
