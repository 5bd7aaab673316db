//! Producer/consumer pipe over the virtual ring buffer.
//!
//! The writer side reserves a contiguous window with [`alloc_prepare`],
//! fills it in place and publishes it with [`alloc_commit`] (or backs out
//! with [`alloc_abort`]); the reader side maps the oldest `n` committed
//! bytes with [`read_address`] and consumes them with [`read_advance`] (or
//! peeks and releases with [`read_discard`]). The two mutexes serialize
//! writers against writers and readers against readers; the two condition
//! variables carry the flow control between the sides. Committed bytes
//! reach the reader in FIFO order and uncommitted bytes are never visible.
//!
//! [`alloc_prepare`]: Buffer::alloc_prepare
//! [`alloc_commit`]: Buffer::alloc_commit
//! [`alloc_abort`]: Buffer::alloc_abort
//! [`read_address`]: Buffer::read_address
//! [`read_advance`]: Buffer::read_advance
//! [`read_discard`]: Buffer::read_discard

use std::cell::{Cell, RefCell};
use std::slice;

use crate::fiber::{Cond, Context, Mutex};
use crate::vrb::Vrb;
use crate::{Error, Result};

pub struct Buffer {
    vrb: RefCell<Vrb>,
    prepared_bytes: Cell<usize>,
    waiting_bytes: Cell<usize>,
    committed_cond: Cond,
    bytes_freed_cond: Cond,
    write_mutex: Mutex,
    read_mutex: Mutex,
}

impl Buffer {
    pub fn new(ctx: &Context, size: usize) -> Result<Self> {
        let vrb = Vrb::new(size, ctx.buffer_file_pattern())?;
        Ok(Self {
            vrb: RefCell::new(vrb),
            prepared_bytes: Cell::new(0),
            waiting_bytes: Cell::new(0),
            committed_cond: Cond::new(),
            bytes_freed_cond: Cond::new(),
            write_mutex: Mutex::new(),
            read_mutex: Mutex::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.vrb.borrow().capacity()
    }

    /// Committed bytes not yet consumed.
    pub fn bytes(&self) -> usize {
        self.vrb.borrow().bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.vrb.borrow().free_bytes()
    }

    /// Reserve a contiguous write window of `size` bytes.
    ///
    /// Blocks while another prepare is outstanding, then while the ring
    /// lacks room. The window stays valid until [`alloc_commit`] or
    /// [`alloc_abort`], which the caller must invoke from the same fiber.
    ///
    /// [`alloc_commit`]: Self::alloc_commit
    /// [`alloc_abort`]: Self::alloc_abort
    pub fn alloc_prepare(&self, ctx: &Context, size: usize) -> Result<&mut [u8]> {
        if size > self.capacity() {
            return Err(Error::InvalidArgument);
        }
        self.write_mutex.lock(ctx);

        while self.prepared_bytes.get() > 0 {
            self.committed_cond.wait(ctx, Some(&self.write_mutex))?;
        }
        self.prepared_bytes.set(size);

        while self.free_bytes() < size {
            self.bytes_freed_cond.wait(ctx, Some(&self.write_mutex))?;
        }

        let mut vrb = self.vrb.borrow_mut();
        let window = vrb.space_mut(size);
        // Safety: the window is disjoint from the readable region, the
        // write mutex keeps it exclusive until commit/abort, and the
        // mappings live as long as `self`.
        Ok(unsafe { slice::from_raw_parts_mut(window.as_mut_ptr(), size) })
    }

    /// Publish the prepared window to the reader side.
    pub fn alloc_commit(&self, ctx: &Context) {
        self.vrb
            .borrow_mut()
            .give(self.prepared_bytes.get())
            .expect("prepared bytes were reserved against free space");
        self.prepared_bytes.set(0);
        self.committed_cond.signal(ctx);
        self.write_mutex.unlock(ctx);
    }

    /// Drop the prepared window without publishing anything.
    pub fn alloc_abort(&self, ctx: &Context) {
        self.prepared_bytes.set(0);
        self.committed_cond.signal(ctx);
        self.write_mutex.unlock(ctx);
    }

    /// Map the oldest `size` committed bytes, blocking until that many have
    /// been committed. Consume with [`read_advance`], or release without
    /// consuming with [`read_discard`].
    ///
    /// [`read_advance`]: Self::read_advance
    /// [`read_discard`]: Self::read_discard
    pub fn read_address(&self, ctx: &Context, size: usize) -> Result<&[u8]> {
        if size > self.capacity() {
            return Err(Error::InvalidArgument);
        }
        self.read_mutex.lock(ctx);

        while self.bytes() < size {
            self.committed_cond.wait(ctx, Some(&self.read_mutex))?;
        }
        self.waiting_bytes.set(size);

        let vrb = self.vrb.borrow();
        let window = vrb.data(size);
        // Safety: as in alloc_prepare, with the read mutex as the guard.
        Ok(unsafe { slice::from_raw_parts(window.as_ptr(), size) })
    }

    /// Consume the bytes mapped by the last [`read_address`].
    ///
    /// [`read_address`]: Self::read_address
    pub fn read_advance(&self, ctx: &Context) {
        self.vrb
            .borrow_mut()
            .take(self.waiting_bytes.get())
            .expect("the read window was bounded by the committed bytes");
        self.bytes_freed_cond.signal(ctx);
        self.read_mutex.unlock(ctx);
    }

    /// Release the read window without consuming anything.
    pub fn read_discard(&self, ctx: &Context) {
        self.read_mutex.unlock(ctx);
    }

    /// Rebuild the ring with a new capacity, carrying unread bytes over.
    /// Fails with [`Error::BufferNoSpace`] when they do not fit.
    pub fn resize(&self, ctx: &Context, size: usize) -> Result<()> {
        self.read_mutex.lock(ctx);
        self.write_mutex.lock(ctx);
        let rv = self
            .vrb
            .borrow_mut()
            .resize(size, ctx.buffer_file_pattern());
        self.write_mutex.unlock(ctx);
        self.read_mutex.unlock(ctx);
        rv
    }

    /// Prepare, fill and commit in one call.
    pub fn write(&self, ctx: &Context, data: &[u8]) -> Result<()> {
        let window = self.alloc_prepare(ctx, data.len())?;
        window.copy_from_slice(data);
        self.alloc_commit(ctx);
        Ok(())
    }

    /// Map, copy out and advance in one call.
    pub fn read(&self, ctx: &Context, out: &mut [u8]) -> Result<()> {
        let window = self.read_address(ctx, out.len())?;
        out.copy_from_slice(window);
        self.read_advance(ctx);
        Ok(())
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
    fn committed_spans_read_back_in_order() {
        let (_lp, ctx) = ctx();
        let buf = Buffer::new(&ctx, 0).unwrap();

        buf.write(&ctx, b"first ").unwrap();
        buf.write(&ctx, b"second").unwrap();
        assert_eq!(buf.bytes(), 12);

        let mut out = [0u8; 12];
        buf.read(&ctx, &mut out).unwrap();
        assert_eq!(&out, b"first second");
        assert_eq!(buf.bytes(), 0);
    }

    #[test]
    fn aborted_span_is_invisible() {
        let (_lp, ctx) = ctx();
        let buf = Buffer::new(&ctx, 0).unwrap();

        let window = buf.alloc_prepare(&ctx, 5).unwrap();
        window.copy_from_slice(b"nope!");
        buf.alloc_abort(&ctx);
        assert_eq!(buf.bytes(), 0);

        buf.write(&ctx, b"yes").unwrap();
        let mut out = [0u8; 3];
        buf.read(&ctx, &mut out).unwrap();
        assert_eq!(&out, b"yes");
    }

    #[test]
    fn discard_leaves_bytes_unconsumed() {
        let (_lp, ctx) = ctx();
        let buf = Buffer::new(&ctx, 0).unwrap();
        buf.write(&ctx, b"keep").unwrap();

        let window = buf.read_address(&ctx, 4).unwrap();
        assert_eq!(window, b"keep");
        buf.read_discard(&ctx);
        assert_eq!(buf.bytes(), 4);

        let mut out = [0u8; 4];
        buf.read(&ctx, &mut out).unwrap();
        assert_eq!(&out, b"keep");
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let (_lp, ctx) = ctx();
        let buf = Buffer::new(&ctx, 0).unwrap();
        let cap = buf.capacity();
        assert!(matches!(
            buf.alloc_prepare(&ctx, cap + 1),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            buf.read_address(&ctx, cap + 1),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn writer_blocks_until_reader_advances() {
        let (lp, ctx) = ctx();
        let buf = Rc::new(Buffer::new(&ctx, 0).unwrap());
        let cap = buf.capacity();

        // Fill the ring completely.
        buf.write(&ctx, &vec![7u8; cap]).unwrap();
        assert_eq!(buf.free_bytes(), 0);

        let committed = Rc::new(std::cell::Cell::new(false));
        let writer = {
            let ctx2 = ctx.clone();
            let buf = buf.clone();
            let committed = committed.clone();
            ctx.spawn("writer", move || {
                buf.write(&ctx2, b"x").unwrap();
                committed.set(true);
            })
            .unwrap()
        };
        ctx.transfer(writer).unwrap();
        assert!(!committed.get());

        let reader = {
            let ctx2 = ctx.clone();
            let buf = buf.clone();
            ctx.spawn("reader", move || {
                let mut out = vec![0u8; cap];
                buf.read(&ctx2, &mut out).unwrap();
            })
            .unwrap()
        };
        ctx.transfer(reader).unwrap();
        run(&lp, &ctx);
        assert!(committed.get());
        assert_eq!(buf.bytes(), 1);
    }

    #[test]
    fn resize_carries_unread_bytes() {
        let (_lp, ctx) = ctx();
        let buf = Buffer::new(&ctx, 0).unwrap();
        let cap = buf.capacity();
        buf.write(&ctx, b"sticky").unwrap();

        buf.resize(&ctx, cap * 2).unwrap();
        assert_eq!(buf.capacity(), cap * 2);
        assert_eq!(buf.bytes(), 6);

        let mut out = [0u8; 6];
        buf.read(&ctx, &mut out).unwrap();
        assert_eq!(&out, b"sticky");
    }
}
