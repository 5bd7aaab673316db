//! Test helpers.
//!
//! [`SimLoop`] is a deterministic, virtual-clock implementation of the
//! [`ev`](crate::ev) contract: timers fire in deadline order by jumping the
//! clock forward, async sends are drained in registration order, and the
//! referenced state of every handle is observable. It exists for the test
//! suite but is a complete host loop: anything the runtime asks of a real
//! event loop works here, minus actual waiting.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::ev::{AsyncCallback, EvAsync, EvHandle, EventLoop, TimerCallback, WaitSlot};
use crate::fiber::Context;

struct SimTimer {
    deadline: Duration,
    seq: u64,
    active: Cell<bool>,
    cb: TimerCallback,
    slot: WaitSlot,
}

impl EvHandle for SimTimer {
    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn wait_slot(&self) -> &WaitSlot {
        &self.slot
    }

    fn stop(&self) {
        self.active.set(false);
    }
}

struct SimAsync {
    cb: AsyncCallback,
    sent: Cell<bool>,
    referenced: Cell<bool>,
}

impl EvAsync for SimAsync {
    fn send(&self) {
        self.sent.set(true);
    }

    fn set_referenced(&self, referenced: bool) {
        self.referenced.set(referenced);
    }
}

pub struct SimLoop {
    now: Cell<Duration>,
    timers: RefCell<Vec<Rc<SimTimer>>>,
    asyncs: RefCell<Vec<Rc<SimAsync>>>,
    seq: Cell<u64>,
}

impl SimLoop {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            timers: RefCell::new(Vec::new()),
            asyncs: RefCell::new(Vec::new()),
            seq: Cell::new(0),
        }
    }

    /// Run until no sent async and no active timer remains.
    ///
    /// Sent asyncs are serviced before timers, timers in (deadline, start
    /// order); firing a timer advances the virtual clock to its deadline.
    pub fn run(&self) {
        loop {
            let sent = self
                .asyncs
                .borrow()
                .iter()
                .find(|a| a.sent.get())
                .cloned();
            if let Some(handle) = sent {
                handle.sent.set(false);
                (handle.cb)();
                continue;
            }

            let due = self
                .timers
                .borrow()
                .iter()
                .filter(|t| t.active.get())
                .min_by_key(|t| (t.deadline, t.seq))
                .cloned();
            if let Some(timer) = due {
                if timer.deadline > self.now.get() {
                    self.now.set(timer.deadline);
                }
                timer.active.set(false);
                (timer.cb)(&*timer);
                continue;
            }

            break;
        }
        self.timers.borrow_mut().retain(|t| t.active.get());
    }

    /// Whether any async handle currently keeps the loop alive.
    pub fn async_referenced(&self) -> bool {
        self.asyncs.borrow().iter().any(|a| a.referenced.get())
    }

    /// Number of timers that have been started and not yet fired/stopped.
    pub fn active_timers(&self) -> usize {
        self.timers.borrow().iter().filter(|t| t.active.get()).count()
    }
}

impl Default for SimLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for SimLoop {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn start_timer(&self, after: Duration, cb: TimerCallback) -> Rc<dyn EvHandle> {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        let timer = Rc::new(SimTimer {
            deadline: self.now.get() + after,
            seq,
            active: Cell::new(true),
            cb,
            slot: WaitSlot::new(),
        });
        self.timers.borrow_mut().push(timer.clone());
        timer
    }

    fn register_async(&self, cb: AsyncCallback) -> Rc<dyn EvAsync> {
        let handle = Rc::new(SimAsync {
            cb,
            sent: Cell::new(false),
            referenced: Cell::new(false),
        });
        self.asyncs.borrow_mut().push(handle.clone());
        handle
    }
}

/// Drive the loop, then re-raise any panic captured at a fiber boundary so
/// fiber-side assertions fail the calling test.
pub fn run(lp: &SimLoop, ctx: &Context) {
    lp.run();
    if let Some(payload) = ctx.take_fiber_panic() {
        std::panic::resume_unwind(payload);
    }
}
