//! Wait-event engine.
//!
//! Every blocking operation of the runtime funnels through the same
//! three-phase protocol: *prepare* each awaited event (enqueue on the
//! relevant waiter queue, or arm the host handle's wait slot), suspend until
//! at least one arrival is posted, then *finish* the arrived events and
//! *cancel* the rest. Preparation always registers a [`Destructor`] that
//! unlinks the queue entry from whatever queue currently holds it, which is
//! what makes reclaiming a suspended fiber safe: the entry removes itself
//! and no queue is left pointing at a dead waiter.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::ev::{ArmedWaiter, EvHandle};
use crate::fiber::{Cond, Context, ContextInner, Destructor, FiberId, Mutex};
use crate::{Error, Result};

////////////////////////////////////////////////////////////////////////////////
// Queue items
////////////////////////////////////////////////////////////////////////////////

/// A waiter queue: mutex pending lists, cond waiting lists and the
/// scheduler's pending-fiber queue all share this shape.
pub(crate) type ItemQueue = RefCell<VecDeque<Rc<QueueItem>>>;

/// One queue entry. `head` names the queue currently containing the entry
/// (entries migrate from a cond's waiting list to the pending queue on
/// signal), so the unlink destructor always finds it.
pub(crate) struct QueueItem {
    pub(crate) id: FiberId,
    pub(crate) ev: RefCell<Option<Rc<EvState>>>,
    pub(crate) head: RefCell<Option<Weak<ItemQueue>>>,
}

/// Link `item` at the tail of `queue` and record the back-reference.
pub(crate) fn enqueue(queue: &Rc<ItemQueue>, item: Rc<QueueItem>) {
    *item.head.borrow_mut() = Some(Rc::downgrade(queue));
    queue.borrow_mut().push_back(item);
}

////////////////////////////////////////////////////////////////////////////////
// Event
////////////////////////////////////////////////////////////////////////////////

/// Shared state of one event, reachable both from the waiter and from the
/// queue entry (or wait slot) a waker posts through.
pub(crate) struct EvState {
    pub(crate) arrived: Cell<bool>,
    item: RefCell<Option<Rc<QueueItem>>>,
    dtor: RefCell<Option<Destructor>>,
}

enum EvKind<'a> {
    /// A host handle (timer, I/O watcher) expected to fire via
    /// [`Context::handle_event`].
    Handle(&'a dyn EvHandle),
    /// Acquisition of a mutex.
    Mutex(&'a Mutex),
    /// A condition variable, optionally tied to a mutex which is released
    /// for the duration of the wait.
    Cond {
        cond: &'a Cond,
        mutex: Option<&'a Mutex>,
    },
}

/// One awaitable condition, built on the waiter's stack and passed to
/// [`Context::wait`] or one of its variants.
pub struct Event<'a> {
    kind: EvKind<'a>,
    state: Rc<EvState>,
}

impl<'a> Event<'a> {
    fn new(kind: EvKind<'a>) -> Self {
        Self {
            kind,
            state: Rc::new(EvState {
                arrived: Cell::new(false),
                item: RefCell::new(None),
                dtor: RefCell::new(None),
            }),
        }
    }

    /// Wait for a host handle to fire. The handle must be active.
    pub fn handle(handle: &'a dyn EvHandle) -> Self {
        Self::new(EvKind::Handle(handle))
    }

    /// Wait to acquire `mutex`.
    pub fn mutex(mutex: &'a Mutex) -> Self {
        Self::new(EvKind::Mutex(mutex))
    }

    /// Wait for `cond` to be signalled. When `mutex` is supplied it must be
    /// locked; it is released before suspension and reacquired before the
    /// wait returns.
    pub fn cond(cond: &'a Cond, mutex: Option<&'a Mutex>) -> Self {
        Self::new(EvKind::Cond { cond, mutex })
    }

    /// Whether this event fired during the wait it was passed to.
    pub fn arrived(&self) -> bool {
        self.state.arrived.get()
    }
}

enum Hint {
    Registered,
    Arrived,
    Invalid,
}

////////////////////////////////////////////////////////////////////////////////
// Engine
////////////////////////////////////////////////////////////////////////////////

impl ContextInner {
    fn unlink_dtor(item: &Rc<QueueItem>) -> Destructor {
        let item = item.clone();
        Destructor::new(move || {
            let head = item.head.borrow_mut().take();
            if let Some(queue) = head.and_then(|w| w.upgrade()) {
                queue.borrow_mut().retain(|i| !Rc::ptr_eq(i, &item));
            }
        })
    }

    fn prepare_ev(&self, ev: &Event<'_>) -> Hint {
        let id = self.current_id();
        ev.state.arrived.set(false);
        let item = Rc::new(QueueItem {
            id,
            ev: RefCell::new(None),
            head: RefCell::new(None),
        });
        let dtor = Self::unlink_dtor(&item);
        self.destructor_add(&dtor);
        *ev.state.dtor.borrow_mut() = Some(dtor.clone());
        *ev.state.item.borrow_mut() = Some(item.clone());

        match &ev.kind {
            EvKind::Handle(handle) => {
                if !handle.is_active() {
                    self.destructor_remove(&dtor, false);
                    return Hint::Invalid;
                }
                handle.wait_slot().arm(ArmedWaiter {
                    id,
                    ev: ev.state.clone(),
                });
            }
            EvKind::Mutex(mutex) => {
                if mutex.locked_by().is_none() {
                    // Uncontended: claim it right away, no suspension. The
                    // destructor stays registered until finish, where its
                    // unlink finds nothing to do.
                    mutex.set_locked_by(Some(id));
                    return Hint::Arrived;
                }
                *item.ev.borrow_mut() = Some(ev.state.clone());
                enqueue(mutex.pending(), item);
            }
            EvKind::Cond { cond, mutex } => {
                if let Some(mutex) = mutex {
                    if mutex.locked_by().is_none() {
                        self.destructor_remove(&dtor, false);
                        return Hint::Invalid;
                    }
                }
                *item.ev.borrow_mut() = Some(ev.state.clone());
                enqueue(cond.waiting(), item);
                if let Some(mutex) = mutex {
                    self.mutex_unlock(mutex);
                }
            }
        }
        Hint::Registered
    }

    fn finish_ev(&self, ev: &Event<'_>) {
        if let Some(dtor) = ev.state.dtor.borrow_mut().take() {
            self.destructor_remove(&dtor, true);
        }
        ev.state.item.borrow_mut().take();
        match &ev.kind {
            EvKind::Cond {
                mutex: Some(mutex), ..
            } => {
                // Reacquisition may well suspend again if the mutex is
                // contended.
                self.mutex_lock(mutex);
            }
            EvKind::Handle(handle) => {
                // A callback still firing for this handle now aborts loudly
                // instead of resuming a finished wait.
                handle.wait_slot().poison();
            }
            _ => {}
        }
    }

    fn cancel_ev(&self, ev: &Event<'_>) {
        if let Some(dtor) = ev.state.dtor.borrow_mut().take() {
            self.destructor_remove(&dtor, true);
        }
        ev.state.item.borrow_mut().take();
    }

    pub(crate) fn wait_impl(&self, events: &[&Event<'_>]) -> Result<usize> {
        let fiber = self.current();
        fiber.ev_arrived.set(false);
        fiber.ev_waiting.set(true);

        for (i, ev) in events.iter().enumerate() {
            match self.prepare_ev(ev) {
                Hint::Registered => {}
                Hint::Arrived => {
                    fiber.ev_arrived.set(true);
                    ev.state.arrived.set(true);
                }
                Hint::Invalid => {
                    // Unwind the part of the set that is already registered.
                    // An immediately-claimed mutex stays claimed.
                    for prev in &events[..i] {
                        if prev.state.arrived.get() {
                            self.finish_ev(prev);
                        } else {
                            self.cancel_ev(prev);
                        }
                    }
                    return Err(Error::InvalidArgument);
                }
            }
        }

        while !fiber.ev_arrived.get() {
            self.yield_now();
        }

        let mut num = 0;
        for ev in events {
            if ev.state.arrived.get() {
                num += 1;
                self.finish_ev(ev);
            } else {
                self.cancel_ev(ev);
            }
        }
        Ok(num)
    }

    pub(crate) fn wait_one_impl(&self, ev: &Event<'_>) -> Result<()> {
        let fiber = self.current();
        fiber.ev_arrived.set(false);
        fiber.ev_waiting.set(true);

        match self.prepare_ev(ev) {
            Hint::Registered => {
                // Wait on the event's own flag: an arrival posted to some
                // enclosing wait of the same fiber must not end this one.
                while !ev.state.arrived.get() {
                    self.yield_now();
                }
            }
            Hint::Arrived => {}
            Hint::Invalid => return Err(Error::InvalidArgument),
        }
        self.finish_ev(ev);
        Ok(())
    }

    fn start_timer(&self, after: Duration) -> Rc<dyn EvHandle> {
        let weak = self.weak_self.clone();
        self.ev_loop.start_timer(
            after,
            Box::new(move |handle| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_event(handle);
                }
            }),
        )
    }

    pub(crate) fn wait_timeout_impl(
        &self,
        events: &[&Event<'_>],
        timeout: Duration,
    ) -> Result<usize> {
        let timer = self.start_timer(timeout);
        let stop = {
            let timer = timer.clone();
            Destructor::new(move || timer.stop())
        };
        self.destructor_add(&stop);
        let timer_ev = Event::handle(&*timer);

        let mut all: Vec<&Event<'_>> = Vec::with_capacity(events.len() + 1);
        for &ev in events {
            all.push(ev);
        }
        all.push(&timer_ev);
        let rv = self.wait_impl(&all);
        self.destructor_remove(&stop, true);

        let mut num = rv?;
        if timer_ev.arrived() {
            num -= 1;
        }
        Ok(num)
    }

    pub(crate) fn wait_one_timeout_impl(&self, ev: &Event<'_>, timeout: Duration) -> Result<()> {
        let timer = self.start_timer(timeout);
        let stop = {
            let timer = timer.clone();
            Destructor::new(move || timer.stop())
        };
        self.destructor_add(&stop);
        let timer_ev = Event::handle(&*timer);

        let rv = self.wait_impl(&[ev, &timer_ev]);
        self.destructor_remove(&stop, true);

        match rv {
            Ok(_) if ev.arrived() => Ok(()),
            _ => Err(Error::TimedOut),
        }
    }

    pub(crate) fn sleep_impl(&self, duration: Duration) -> Duration {
        let expected = self.ev_loop.now() + duration;
        let timer = self.start_timer(duration);
        let stop = {
            let timer = timer.clone();
            Destructor::new(move || timer.stop())
        };
        self.destructor_add(&stop);

        let timer_ev = Event::handle(&*timer);
        self.wait_one_impl(&timer_ev)
            .expect("a fresh timer is always active");

        self.destructor_remove(&stop, false);
        timer.stop();
        expected.saturating_sub(self.ev_loop.now())
    }
}

impl Context {
    /// Suspend the current fiber until at least one of `events` arrives.
    /// Arrived events are finished, the rest are cancelled; the number of
    /// arrived events is returned.
    pub fn wait(&self, events: &[Event<'_>]) -> Result<usize> {
        let refs: Vec<&Event<'_>> = events.iter().collect();
        self.inner.wait_impl(&refs)
    }

    /// Suspend the current fiber until `ev` arrives.
    pub fn wait_one(&self, ev: &Event<'_>) -> Result<()> {
        self.inner.wait_one_impl(ev)
    }

    /// [`wait`](Self::wait) bounded by a timeout. On timeout the count of
    /// arrived real events (possibly zero) is returned; the internal timer
    /// is never counted.
    pub fn wait_timeout(&self, events: &[Event<'_>], timeout: Duration) -> Result<usize> {
        let refs: Vec<&Event<'_>> = events.iter().collect();
        self.inner.wait_timeout_impl(&refs, timeout)
    }

    /// [`wait_one`](Self::wait_one) bounded by a timeout; [`Error::TimedOut`]
    /// when the event did not arrive in time.
    pub fn wait_one_timeout(&self, ev: &Event<'_>, timeout: Duration) -> Result<()> {
        self.inner.wait_one_timeout_impl(ev, timeout)
    }

    /// Suspend the current fiber for `duration`. Returns how much of it was
    /// left when the fiber woke up (normally zero).
    pub fn sleep(&self, duration: Duration) -> Duration {
        self.inner.sleep_impl(duration)
    }
}
