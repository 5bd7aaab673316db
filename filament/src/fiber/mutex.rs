//! Fiber-aware mutex.
//!
//! Cooperative scheduling makes this much simpler than an OS mutex: there
//! is no contention to speak of between suspension points, so the lock is a
//! plain owner field plus a strictly FIFO queue of waiting fibers. What the
//! type buys is *ordering across suspension points*: a fiber that holds the
//! lock can yield, wait or sleep and still be the only one inside the
//! critical section until it unlocks.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::wait::{Event, ItemQueue};
use super::{Context, ContextInner, FiberId};

pub struct Mutex {
    locked_by: Cell<Option<FiberId>>,
    pending: Rc<ItemQueue>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            locked_by: Cell::new(None),
            pending: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Acquire the mutex, suspending the current fiber while another fiber
    /// holds it. Waiters acquire in FIFO order.
    ///
    /// # Panics
    ///
    /// When the current fiber already holds the lock (cooperative
    /// self-deadlock).
    pub fn lock(&self, ctx: &Context) {
        ctx.inner.mutex_lock(self);
    }

    /// Acquire the mutex only if that needs no suspension.
    pub fn try_lock(&self, ctx: &Context) -> bool {
        ctx.inner.mutex_trylock(self)
    }

    /// Release the mutex, handing it to the first waiter in line (which is
    /// scheduled through the pending queue) or leaving it free.
    ///
    /// # Panics
    ///
    /// When the current fiber is not the owner.
    pub fn unlock(&self, ctx: &Context) {
        ctx.inner.mutex_unlock(self);
    }

    /// Id of the owning fiber, if any.
    pub fn locked_by(&self) -> Option<FiberId> {
        self.locked_by.get()
    }

    pub(crate) fn set_locked_by(&self, id: Option<FiberId>) {
        self.locked_by.set(id);
    }

    pub(crate) fn pending(&self) -> &Rc<ItemQueue> {
        &self.pending
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextInner {
    pub(crate) fn mutex_lock(&self, mutex: &Mutex) {
        let id = self.current_id();
        assert!(
            mutex.locked_by.get() != Some(id),
            "mutex is already locked by the current fiber"
        );
        let ev = Event::mutex(mutex);
        self.wait_one_impl(&ev)
            .expect("a mutex event always prepares");
        debug_assert_eq!(mutex.locked_by.get(), Some(id));
    }

    pub(crate) fn mutex_trylock(&self, mutex: &Mutex) -> bool {
        if mutex.locked_by.get().is_none() {
            mutex.locked_by.set(Some(self.current_id()));
            return true;
        }
        false
    }

    pub(crate) fn mutex_unlock(&self, mutex: &Mutex) {
        let id = self.current_id();
        assert_eq!(
            mutex.locked_by.get(),
            Some(id),
            "can't unlock a mutex locked by another fiber"
        );

        // Hand over to the first waiter whose fiber still exists.
        // Reclamation unlinks queue entries, so a stale one is unexpected.
        let item = loop {
            let item = mutex.pending.borrow_mut().pop_front();
            match item {
                None => {
                    mutex.locked_by.set(None);
                    return;
                }
                Some(item) => match self.get(item.id) {
                    Ok(_) => break item,
                    Err(e) => {
                        log::error!("unexpected error finding a pending locker by id: {}", e);
                    }
                },
            }
        };

        mutex.locked_by.set(Some(item.id));
        let fiber = self.get(item.id).expect("checked just above");
        let ev = item
            .ev
            .borrow()
            .clone()
            .expect("a pending locker always carries an event");
        self.post_ev(&fiber, &ev);
        self.transfer_later(item);
    }
}
