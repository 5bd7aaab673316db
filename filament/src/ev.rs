//! Host event loop contract.
//!
//! The runtime does not own an event loop; it plugs into one the embedder
//! already runs. Three capabilities are consumed: a monotonic clock, one-shot
//! timers, and an async wake-up handle used to drain the pending-fiber queue.
//! Any loop able to provide them can host the runtime; a deterministic
//! virtual-clock implementation lives in [`crate::test_utils`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::fiber::wait::EvState;
use crate::fiber::FiberId;

/// Callback invoked by the loop when a one-shot timer started via
/// [`EventLoop::start_timer`] fires.
pub type TimerCallback = Box<dyn Fn(&dyn EvHandle)>;

/// Callback invoked by the loop when an async handle registered via
/// [`EventLoop::register_async`] has been sent.
pub type AsyncCallback = Box<dyn Fn()>;

/// The host event loop as seen by the runtime.
pub trait EventLoop {
    /// Current monotonic time of the loop. The base point is arbitrary.
    fn now(&self) -> Duration;

    /// Start a one-shot timer. The returned handle is active until it fires
    /// or is stopped.
    fn start_timer(&self, after: Duration, cb: TimerCallback) -> Rc<dyn EvHandle>;

    /// Register an async wake-up handle. `cb` runs on the loop thread some
    /// time after [`EvAsync::send`], coalescing multiple sends.
    fn register_async(&self, cb: AsyncCallback) -> Rc<dyn EvAsync>;
}

/// A waitable handle owned by the host loop (timer, I/O watcher, ...).
///
/// The embedder arranges for the handle's loop callback to call
/// [`Context::handle_event`] with the handle; the runtime then resumes
/// whichever fiber armed the handle's [`WaitSlot`].
///
/// [`Context::handle_event`]: crate::fiber::Context::handle_event
pub trait EvHandle {
    /// Whether the handle is started. Waiting on an inactive handle is
    /// refused with `InvalidArgument`.
    fn is_active(&self) -> bool;

    /// Storage the runtime uses to reach the waiting fiber.
    fn wait_slot(&self) -> &WaitSlot;

    /// Deactivate the handle. The default is a no-op for handles the
    /// embedder stops by other means.
    fn stop(&self) {}
}

/// The async wake-up handle driving the pending-fiber queue.
pub trait EvAsync {
    /// Request a callback invocation on the next loop turn.
    fn send(&self);

    /// An unreferenced handle does not keep the loop alive. The runtime
    /// references the handle exactly while the pending queue is non-empty.
    fn set_referenced(&self, referenced: bool);
}

////////////////////////////////////////////////////////////////////////////////
// WaitSlot
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
pub(crate) struct ArmedWaiter {
    pub id: FiberId,
    pub ev: Rc<EvState>,
}

enum SlotState {
    /// No fiber is waiting on the handle.
    Idle,
    /// A fiber suspended on the handle; the callback must resume it.
    Armed(ArmedWaiter),
    /// The wait completed. A callback still firing for the handle means the
    /// embedder forgot to stop it; that is fatal.
    Poisoned,
}

/// Per-handle waiter storage.
///
/// Replaces the untyped user-data pointer a C loop would carry: the runtime
/// arms it while a fiber waits on the handle and poisons it once the wait is
/// over, so a stray callback fails loudly instead of chasing a dangling
/// pointer.
pub struct WaitSlot {
    state: RefCell<SlotState>,
}

impl WaitSlot {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(SlotState::Idle),
        }
    }

    pub(crate) fn arm(&self, waiter: ArmedWaiter) {
        *self.state.borrow_mut() = SlotState::Armed(waiter);
    }

    pub(crate) fn poison(&self) {
        *self.state.borrow_mut() = SlotState::Poisoned;
    }

    /// `None` for an idle slot, `Some(Err(()))` for a poisoned one.
    pub(crate) fn armed(&self) -> Option<std::result::Result<ArmedWaiter, ()>> {
        match &*self.state.borrow() {
            SlotState::Idle => None,
            SlotState::Armed(w) => Some(Ok(w.clone())),
            SlotState::Poisoned => Some(Err(())),
        }
    }
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self::new()
    }
}
