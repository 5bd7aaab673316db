//! Bounded message queue.
//!
//! A fixed-size ring of slots with one slot permanently reserved to tell a
//! full ring from an empty one. Producers and consumers are fibers; the two
//! condition variables carry the flow control, with no mutex, since
//! cooperative scheduling means the ring indices cannot be observed
//! mid-update.

use std::cell::{Cell, RefCell};

use super::{Cond, Context};

pub struct Channel<T> {
    ctx: Context,
    rb: RefCell<Vec<Option<T>>>,
    /// Ring length; one more than the usable capacity.
    max: usize,
    head: Cell<usize>,
    tail: Cell<usize>,
    bytes_available_cond: Cond,
    bytes_freed_cond: Cond,
}

impl<T> Channel<T> {
    /// A queue holding up to `size` messages.
    pub fn new(ctx: &Context, size: usize) -> Self {
        let max = size + 1;
        Self {
            ctx: ctx.clone(),
            rb: RefCell::new((0..max).map(|_| None).collect()),
            max,
            head: Cell::new(0),
            tail: Cell::new(0),
            bytes_available_cond: Cond::new(),
            bytes_freed_cond: Cond::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max - 1
    }

    pub fn len(&self) -> usize {
        (self.head.get() + self.max - self.tail.get()) % self.max
    }

    pub fn is_empty(&self) -> bool {
        self.head.get() == self.tail.get()
    }

    pub fn is_full(&self) -> bool {
        self.next(self.head.get()) == self.tail.get()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.max
    }

    /// Append a message, suspending the current fiber while the ring is
    /// full.
    pub fn push(&self, obj: T) {
        while self.is_full() {
            self.bytes_freed_cond
                .wait(&self.ctx, None)
                .expect("wait without a mutex cannot fail");
        }
        self.rb.borrow_mut()[self.head.get()] = Some(obj);
        self.head.set(self.next(self.head.get()));
        self.bytes_available_cond.signal(&self.ctx);
    }

    /// Append a message without suspending; hands the message back when the
    /// ring is full.
    pub fn try_push(&self, obj: T) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(obj);
        }
        self.rb.borrow_mut()[self.head.get()] = Some(obj);
        self.head.set(self.next(self.head.get()));
        self.bytes_available_cond.signal(&self.ctx);
        Ok(())
    }

    /// Suspend until the ring has room, without pushing anything.
    pub fn wait_push(&self) {
        while self.is_full() {
            self.bytes_freed_cond
                .wait(&self.ctx, None)
                .expect("wait without a mutex cannot fail");
        }
    }

    fn do_pop(&self) -> T {
        let obj = self.rb.borrow_mut()[self.tail.get()]
            .take()
            .expect("a non-empty ring holds a message at the tail");
        self.tail.set(self.next(self.tail.get()));
        self.bytes_freed_cond.signal(&self.ctx);
        obj
    }

    /// Take the oldest message, suspending the current fiber while the ring
    /// is empty.
    pub fn pop(&self) -> T {
        while self.is_empty() {
            self.bytes_available_cond
                .wait(&self.ctx, None)
                .expect("wait without a mutex cannot fail");
        }
        self.do_pop()
    }

    /// Take the oldest message without suspending.
    pub fn try_pop(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        Some(self.do_pop())
    }

    /// Suspend until the ring has a message, without popping it.
    pub fn wait_pop(&self) {
        while self.is_empty() {
            self.bytes_available_cond
                .wait(&self.ctx, None)
                .expect("wait without a mutex cannot fail");
        }
    }

    /// Drop every queued message and reset the ring, optionally waking
    /// writers blocked on a full ring.
    pub fn clear(&self, wake_up_writers: bool) {
        for slot in self.rb.borrow_mut().iter_mut() {
            slot.take();
        }
        self.head.set(0);
        self.tail.set(0);
        if wake_up_writers {
            self.bytes_freed_cond.signal(&self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{run, SimLoop};
    use std::rc::Rc;

    fn ctx() -> (Rc<SimLoop>, Context) {
        let lp = Rc::new(SimLoop::new());
        let ctx = Context::new(lp.clone());
        (lp, ctx)
    }

    #[test]
    fn fifo_order() {
        let (_lp, ctx) = ctx();
        let q = Channel::new(&ctx, 4);
        for i in 0..4 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.len(), 4);
        for i in 0..4 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn try_push_fails_when_full() {
        let (_lp, ctx) = ctx();
        let q = Channel::new(&ctx, 2);
        q.try_push('a').unwrap();
        q.try_push('b').unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_push('c'), Err('c'));
        assert_eq!(q.try_pop(), Some('a'));
        q.try_push('c').unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn push_suspends_until_a_pop() {
        let (lp, ctx) = ctx();
        let q = Rc::new(Channel::new(&ctx, 2));
        q.try_push(0).unwrap();
        q.try_push(1).unwrap();

        let pushed = Rc::new(Cell::new(false));
        let writer = {
            let q = q.clone();
            let pushed = pushed.clone();
            ctx.spawn("writer", move || {
                q.push(2);
                pushed.set(true);
            })
            .unwrap()
        };
        ctx.transfer(writer).unwrap();
        assert!(!pushed.get());

        assert_eq!(q.try_pop(), Some(0));
        run(&lp, &ctx);
        assert!(pushed.get());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
    }

    #[test]
    fn pop_suspends_until_a_push() {
        let (lp, ctx) = ctx();
        let q = Rc::new(Channel::new(&ctx, 2));
        let got = Rc::new(Cell::new(None));
        let reader = {
            let q = q.clone();
            let got = got.clone();
            ctx.spawn("reader", move || {
                got.set(Some(q.pop()));
            })
            .unwrap()
        };
        ctx.transfer(reader).unwrap();
        assert_eq!(got.get(), None);

        q.try_push(7).unwrap();
        run(&lp, &ctx);
        assert_eq!(got.get(), Some(7));
    }

    #[test]
    fn clear_resets_and_wakes_writers() {
        let (lp, ctx) = ctx();
        let q = Rc::new(Channel::new(&ctx, 1));
        q.try_push(0).unwrap();

        let pushed = Rc::new(Cell::new(false));
        let writer = {
            let q = q.clone();
            let pushed = pushed.clone();
            ctx.spawn("writer", move || {
                q.push(1);
                pushed.set(true);
            })
            .unwrap()
        };
        ctx.transfer(writer).unwrap();
        assert!(!pushed.get());

        q.clear(true);
        run(&lp, &ctx);
        assert!(pushed.get());
        assert_eq!(q.try_pop(), Some(1));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn messages_are_dropped_on_clear() {
        let (_lp, ctx) = ctx();
        let q = Channel::new(&ctx, 3);
        let marker = Rc::new(());
        q.try_push(marker.clone()).unwrap();
        q.try_push(marker.clone()).unwrap();
        assert_eq!(Rc::strong_count(&marker), 3);
        q.clear(false);
        assert_eq!(Rc::strong_count(&marker), 1);
        assert!(q.is_empty());
    }
}
