//! Condition variable.
//!
//! A FIFO list of waiting fibers. `signal` moves the first waiter onto the
//! scheduler's pending queue; `broadcast` splices the whole waiting list
//! over in one step, so the waiters resume in exactly the order they began
//! waiting and a waiter that enqueues afterwards is untouched.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::wait::{Event, ItemQueue};
use super::{Context, ContextInner, Mutex};
use crate::Result;

pub struct Cond {
    waiting: Rc<ItemQueue>,
}

impl Cond {
    pub fn new() -> Self {
        Self {
            waiting: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Suspend the current fiber until the cond is signalled.
    ///
    /// When `mutex` is supplied it must currently be locked
    /// (`InvalidArgument` otherwise); it is released before the suspension
    /// and locked again before this returns, so between those two points
    /// other fibers are free to take it.
    pub fn wait(&self, ctx: &Context, mutex: Option<&Mutex>) -> Result<()> {
        ctx.inner.cond_wait(self, mutex)
    }

    /// Wake the first waiter, if any.
    pub fn signal(&self, ctx: &Context) {
        ctx.inner.cond_signal(self);
    }

    /// Wake every current waiter, preserving their waiting order.
    pub fn broadcast(&self, ctx: &Context) {
        ctx.inner.cond_broadcast(self);
    }

    /// Number of fibers currently waiting.
    pub fn waiters(&self) -> usize {
        self.waiting.borrow().len()
    }

    pub(crate) fn waiting(&self) -> &Rc<ItemQueue> {
        &self.waiting
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextInner {
    pub(crate) fn cond_wait(&self, cond: &Cond, mutex: Option<&Mutex>) -> Result<()> {
        if let Some(mutex) = mutex {
            if mutex.locked_by().is_none() {
                return Err(crate::Error::InvalidArgument);
            }
        }
        let ev = Event::cond(cond, mutex);
        self.wait_one_impl(&ev)
    }

    pub(crate) fn cond_signal(&self, cond: &Cond) {
        let item = match cond.waiting.borrow().front() {
            None => return,
            Some(item) => item.clone(),
        };
        let fiber = match self.get(item.id) {
            Ok(fiber) => fiber,
            // Cannot normally happen: reclamation unlinks the entry.
            Err(_) => return,
        };
        let ev = item
            .ev
            .borrow()
            .clone()
            .expect("a cond waiter always carries an event");
        self.post_ev(&fiber, &ev);

        cond.waiting.borrow_mut().pop_front();
        self.transfer_later(item);
    }

    pub(crate) fn cond_broadcast(&self, cond: &Cond) {
        if cond.waiting.borrow().is_empty() {
            return;
        }
        for item in cond.waiting.borrow().iter() {
            let fiber = match self.get(item.id) {
                Ok(fiber) => fiber,
                Err(_) => continue,
            };
            let ev = item
                .ev
                .borrow()
                .clone()
                .expect("a cond waiter always carries an event");
            self.post_ev(&fiber, &ev);
        }
        self.transfer_later_queue(&cond.waiting);
    }
}
