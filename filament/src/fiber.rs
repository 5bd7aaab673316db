//! Cooperative multitasking module.
//!
//! A fiber is a lightweight user-space execution context with its own
//! private stack, multiplexed with many others onto the single OS thread
//! that runs the host event loop. Fibers are never preempted: control moves
//! only at explicit [`transfer`]/[`yield_now`] points and inside blocking
//! operations ([`wait`], [`Mutex::lock`], [`Cond::wait`], the buffer and
//! channel operations, [`sleep`]).
//!
//! The scheduler itself is an ordinary object, [`Context`]: a cheap clonable
//! handle with no process-global state. The distinguished *root* fiber is
//! whatever stack called [`Context::new`]; it drives the host event loop and
//! sits at the bottom of the call stack of active transfers.
//!
//! Fibers are addressed by generational [`FiberId`]s. Reclaiming a fiber
//! tears it down completely (children first, then destructors, then the
//! arena) and recycles its slot and stack for the next [`spawn`]; any id
//! handed out earlier keeps referring to the old incarnation and reports
//! [`Error::NoSuchFiber`] from then on.
//!
//! [`transfer`]: Context::transfer
//! [`yield_now`]: Context::yield_now
//! [`wait`]: Context::wait
//! [`sleep`]: Context::sleep
//! [`spawn`]: Context::spawn

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::env;
use std::panic::{self, AssertUnwindSafe, Location};
use std::rc::{Rc, Weak};

use crate::coro::{self, Coro, FiberStack};
use crate::ev::{EvAsync, EvHandle, EventLoop};
use crate::{Error, Result};

pub mod channel;
pub mod cond;
pub mod mutex;
pub mod wait;

pub use channel::Channel;
pub use cond::Cond;
pub use mutex::Mutex;
pub use wait::Event;

use wait::{ItemQueue, QueueItem};

/// Stack size used by [`Context::spawn`], in bytes.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Environment variable overriding the `mkstemp` template for virtual ring
/// buffer backing files.
pub const BUFFER_FILE_PATTERN_ENV: &str = "FILAMENT_BUFFER_FILE_PATTERN";

const DEFAULT_BUFFER_FILE_PATTERN: &str = "/dev/shm/filament_buffer.XXXXXX";

const ROOT_SLOT: usize = 0;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// A generational fiber id.
///
/// The slot part addresses the fiber's storage, the generation part is
/// bumped every time that storage is reclaimed. Ids are plain `Copy` values
/// and stay safe to hold forever: a stale one is detected by the generation
/// mismatch and never reaches the reused storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    gen: u64,
    slot: usize,
}

////////////////////////////////////////////////////////////////////////////////
// Destructor
////////////////////////////////////////////////////////////////////////////////

struct DtorInner {
    func: RefCell<Option<Box<dyn FnOnce()>>>,
    active: Cell<bool>,
}

/// A cleanup callback attached to the fiber which registered it.
///
/// Destructors fire in insertion order when the owning fiber is reclaimed,
/// or earlier via [`Context::destructor_remove`] with `call = true`. They
/// are the backbone of cancellation: every suspension registers one that
/// detaches the waiter from whatever queue holds it, so reclaiming a
/// suspended fiber leaves no dangling entries behind.
#[derive(Clone)]
pub struct Destructor {
    inner: Rc<DtorInner>,
}

impl Destructor {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self {
            inner: Rc::new(DtorInner {
                func: RefCell::new(Some(Box::new(f))),
                active: Cell::new(false),
            }),
        }
    }

    fn fire(&self) {
        if let Some(f) = self.inner.func.borrow_mut().take() {
            f();
        }
    }

    fn same(&self, other: &Destructor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Fiber {
    pub(crate) slot: usize,
    /// Current generation; bumped at reclaim.
    pub(crate) id: Cell<u64>,
    pub(crate) name: RefCell<String>,
    func: RefCell<Option<Box<dyn FnOnce()>>>,
    stack: RefCell<Option<FiberStack>>,
    coro: Coro,
    parent: Cell<usize>,
    children: RefCell<Vec<usize>>,
    destructors: RefCell<Vec<Destructor>>,
    /// Values parked until reclamation via [`Context::alloc`].
    pool: RefCell<Vec<Rc<dyn Any>>>,
    /// Set by `post_ev` once any awaited event has arrived.
    pub(crate) ev_arrived: Cell<bool>,
    /// The fiber has entered a wait at least once since (re)spawn.
    pub(crate) ev_waiting: Cell<bool>,
    reclaim_cond: Cond,
    no_reclaim: Cell<u32>,
    want_reclaim: Cell<bool>,
    keys: RefCell<HashMap<u8, Rc<dyn Any>>>,
    user_data: RefCell<Option<Rc<dyn Any>>>,
    reclaim_location: Cell<Option<&'static Location<'static>>>,
}

impl Fiber {
    fn new(slot: usize, gen: u64, name: &str) -> Self {
        Self {
            slot,
            id: Cell::new(gen),
            name: RefCell::new(name.into()),
            func: RefCell::new(None),
            stack: RefCell::new(None),
            coro: Coro::new(),
            parent: Cell::new(ROOT_SLOT),
            children: RefCell::new(Vec::new()),
            destructors: RefCell::new(Vec::new()),
            pool: RefCell::new(Vec::new()),
            ev_arrived: Cell::new(false),
            ev_waiting: Cell::new(false),
            reclaim_cond: Cond::new(),
            no_reclaim: Cell::new(0),
            want_reclaim: Cell::new(false),
            keys: RefCell::new(HashMap::new()),
            user_data: RefCell::new(None),
            reclaim_location: Cell::new(None),
        }
    }
}

struct StackFrame {
    slot: usize,
    location: &'static Location<'static>,
}

////////////////////////////////////////////////////////////////////////////////
// Key
////////////////////////////////////////////////////////////////////////////////

/// A fiber-local storage key. At most 64 keys may be registered at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u8);

////////////////////////////////////////////////////////////////////////////////
// Context
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct ContextInner {
    fibers: RefCell<Vec<Rc<Fiber>>>,
    /// Free list of reclaimed slots, reused by the next spawn.
    reclaimed: RefCell<Vec<usize>>,
    last_id: Cell<u64>,
    call_stack: RefCell<Vec<StackFrame>>,
    /// Fibers scheduled for resumption on a later loop turn.
    pending: Rc<ItemQueue>,
    pending_async: RefCell<Option<Rc<dyn EvAsync>>>,
    pub(crate) ev_loop: Rc<dyn EventLoop>,
    pub(crate) weak_self: Weak<ContextInner>,
    buffer_file_pattern: String,
    key_free_mask: Cell<u64>,
    fiber_panic: RefCell<Option<Box<dyn Any + Send>>>,
}

/// The scheduler handle. Clones share the same runtime.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Rc<ContextInner>,
}

impl Context {
    /// Set up the runtime on top of a host event loop.
    ///
    /// The calling stack becomes the root fiber. The pending-queue async
    /// wake-up is registered with the loop immediately but left
    /// unreferenced, so an idle runtime does not keep the loop alive.
    #[track_caller]
    pub fn new(ev_loop: Rc<dyn EventLoop>) -> Self {
        let buffer_file_pattern = env::var(BUFFER_FILE_PATTERN_ENV)
            .unwrap_or_else(|_| DEFAULT_BUFFER_FILE_PATTERN.into());
        let inner = Rc::new_cyclic(|weak| ContextInner {
            fibers: RefCell::new(Vec::new()),
            reclaimed: RefCell::new(Vec::new()),
            last_id: Cell::new(0),
            call_stack: RefCell::new(Vec::new()),
            pending: Rc::new(RefCell::new(VecDeque::new())),
            pending_async: RefCell::new(None),
            ev_loop,
            weak_self: weak.clone(),
            buffer_file_pattern,
            key_free_mask: Cell::new(u64::MAX),
            fiber_panic: RefCell::new(None),
        });

        let root = Rc::new(Fiber::new(ROOT_SLOT, inner.bump_last_id(), "root"));
        inner.fibers.borrow_mut().push(root);
        inner.call_stack.borrow_mut().push(StackFrame {
            slot: ROOT_SLOT,
            location: Location::caller(),
        });

        let weak = Rc::downgrade(&inner);
        let handle = inner.ev_loop.register_async(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.pending_async_cb();
            }
        }));
        handle.set_referenced(false);
        *inner.pending_async.borrow_mut() = Some(handle);

        Self { inner }
    }

    /// Spawn a fiber with the default stack size. The fiber does not run
    /// until something transfers into it.
    pub fn spawn(&self, name: &str, f: impl FnOnce() + 'static) -> Result<FiberId> {
        self.spawn_with_stack(name, f, DEFAULT_STACK_SIZE)
    }

    /// Spawn a fiber with an explicit stack size (page-rounded; zero means
    /// the default). A reclaimed fiber is reused together with its existing
    /// stack when one is available.
    pub fn spawn_with_stack(
        &self,
        name: &str,
        f: impl FnOnce() + 'static,
        stack_size: usize,
    ) -> Result<FiberId> {
        self.inner.spawn(name, Box::new(f), stack_size)
    }

    /// Transfer control into `to`. Control returns here once the callee
    /// yields (or something farther up the transfer chain yields back).
    #[track_caller]
    pub fn transfer(&self, to: FiberId) -> Result<()> {
        self.inner.transfer(to, Location::caller())
    }

    /// Give control back to the fiber this one was transferred from.
    ///
    /// Panics when called in the root fiber.
    pub fn yield_now(&self) {
        self.inner.yield_now();
    }

    /// Id of the currently running fiber.
    pub fn self_id(&self) -> FiberId {
        self.inner.current_id()
    }

    /// Id of the current fiber's parent, or `None` when the parent is the
    /// root fiber.
    pub fn parent(&self) -> Option<FiberId> {
        let cur = self.inner.current();
        let fibers = self.inner.fibers.borrow();
        let parent = &fibers[cur.parent.get()];
        if parent.slot == ROOT_SLOT {
            None
        } else {
            Some(self.inner.id_of(parent))
        }
    }

    /// Move the current fiber under a new parent (`None` means the root).
    /// Reclamation cascades from parent to children, so disowning takes the
    /// current fiber out of its old parent's cascade.
    pub fn disown(&self, new_parent: Option<FiberId>) -> Result<()> {
        let inner = &self.inner;
        let parent = match new_parent {
            Some(id) => inner.get(id)?,
            None => inner.fibers.borrow()[ROOT_SLOT].clone(),
        };
        let cur = inner.current();
        {
            let fibers = inner.fibers.borrow();
            fibers[cur.parent.get()]
                .children
                .borrow_mut()
                .retain(|&s| s != cur.slot);
        }
        parent.children.borrow_mut().push(cur.slot);
        cur.parent.set(parent.slot);
        Ok(())
    }

    /// Tear the fiber down: children first, then its destructors in
    /// insertion order, then the arena; finally the generation is bumped
    /// and the slot goes back to the free list.
    ///
    /// While the target's `no_reclaim` depth is non-zero this blocks on its
    /// reclaim condition (and raises the target's `want_reclaim` flag). A
    /// target that turns out to be already reclaimed is a success.
    /// Reclaiming the currently running fiber does not return: the fiber
    /// yields away and its stack is rewound by the next reuse.
    #[track_caller]
    pub fn reclaim(&self, id: FiberId) -> Result<()> {
        self.inner.reclaim(id, Location::caller())
    }

    /// Enter a no-reclaim section: [`reclaim`](Self::reclaim) against this
    /// fiber blocks until [`set_reclaim`](Self::set_reclaim) brings the
    /// depth back to zero.
    pub fn set_noreclaim(&self, id: FiberId) -> Result<()> {
        let fiber = self.inner.get(id)?;
        fiber.no_reclaim.set(fiber.no_reclaim.get() + 1);
        Ok(())
    }

    /// Leave a no-reclaim section, waking blocked reclaimers at depth zero.
    pub fn set_reclaim(&self, id: FiberId) -> Result<()> {
        let fiber = self.inner.get(id)?;
        let depth = fiber.no_reclaim.get();
        debug_assert!(depth > 0, "set_reclaim without a matching set_noreclaim");
        fiber.no_reclaim.set(depth - 1);
        if depth == 1 {
            self.inner.cond_broadcast(&fiber.reclaim_cond);
        }
        Ok(())
    }

    /// Whether someone is blocked trying to reclaim this fiber. Always
    /// `false` while the fiber is inside a no-reclaim section of any depth.
    pub fn want_reclaim(&self, id: FiberId) -> Result<bool> {
        let fiber = self.inner.get(id)?;
        if fiber.no_reclaim.get() > 0 {
            return Ok(false);
        }
        Ok(fiber.want_reclaim.get())
    }

    pub fn is_reclaimed(&self, id: FiberId) -> bool {
        self.inner.get(id).is_err()
    }

    /// Register `dtor` on the current fiber.
    pub fn destructor_add(&self, dtor: &Destructor) {
        self.inner.destructor_add(dtor);
    }

    /// Unregister `dtor` from the current fiber, invoking it when `call` is
    /// set. Removing an inactive destructor is a no-op.
    pub fn destructor_remove(&self, dtor: &Destructor, call: bool) {
        self.inner.destructor_remove(dtor, call);
    }

    /// Park a value on the current fiber so it lives until the fiber is
    /// reclaimed. Cleanup that has to *run* at reclamation belongs in a
    /// [`Destructor`] instead.
    pub fn alloc<T: 'static>(&self, value: T) -> Rc<T> {
        let rc = Rc::new(value);
        self.inner.current().pool.borrow_mut().push(rc.clone());
        rc
    }

    pub fn name(&self, id: FiberId) -> Result<String> {
        Ok(self.inner.get(id)?.name.borrow().clone())
    }

    pub fn set_name(&self, id: FiberId, name: &str) -> Result<()> {
        *self.inner.get(id)?.name.borrow_mut() = name.into();
        Ok(())
    }

    pub fn user_data(&self, id: FiberId) -> Result<Option<Rc<dyn Any>>> {
        Ok(self.inner.get(id)?.user_data.borrow().clone())
    }

    pub fn set_user_data(&self, id: FiberId, data: Rc<dyn Any>) -> Result<()> {
        *self.inner.get(id)?.user_data.borrow_mut() = Some(data);
        Ok(())
    }

    /// Register a fiber-local storage key.
    pub fn key_create(&self) -> Key {
        let mask = self.inner.key_free_mask.get();
        let key = mask.trailing_zeros();
        assert!(key < 64, "out of fiber-local keys");
        self.inner.key_free_mask.set(mask & !(1u64 << key));
        Key(key as u8)
    }

    pub fn key_delete(&self, key: Key) -> Result<()> {
        if !self.inner.key_registered(key) {
            return Err(Error::NoSuchKey);
        }
        self.inner
            .key_free_mask
            .set(self.inner.key_free_mask.get() | 1u64 << key.0);
        Ok(())
    }

    pub fn key_set(&self, id: FiberId, key: Key, value: Rc<dyn Any>) -> Result<()> {
        let fiber = self.inner.get(id)?;
        if !self.inner.key_registered(key) {
            return Err(Error::NoSuchKey);
        }
        fiber.keys.borrow_mut().insert(key.0, value);
        Ok(())
    }

    pub fn key_get(&self, id: FiberId, key: Key) -> Result<Option<Rc<dyn Any>>> {
        let fiber = self.inner.get(id)?;
        if !self.inner.key_registered(key) {
            return Err(Error::NoSuchKey);
        }
        let value = fiber.keys.borrow().get(&key.0).cloned();
        Ok(value)
    }

    /// Entry point for the embedder's handle callbacks: resume the fiber
    /// waiting on `handle`. Must be called from the root fiber. A callback
    /// firing for a handle nothing waits on (any more) is fatal.
    pub fn handle_event(&self, handle: &dyn EvHandle) {
        self.inner.handle_event(handle);
    }

    /// Log the call stack of active transfers, most recent first.
    pub fn dump_stack(&self) {
        let stack = self.inner.call_stack.borrow();
        log::info!("fiber call stack:");
        for frame in stack.iter().rev() {
            let fibers = self.inner.fibers.borrow();
            let fiber = &fibers[frame.slot];
            log::info!(
                "  {} (id {}) transferred at {}",
                fiber.name.borrow(),
                fiber.id.get(),
                frame.location,
            );
        }
    }

    /// Payload of the most recent fiber panic, if any. Fiber panics are
    /// caught at the fiber boundary (the fiber is reclaimed as if it
    /// returned); test harnesses re-raise them in the root.
    pub fn take_fiber_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.fiber_panic.borrow_mut().take()
    }

    pub(crate) fn buffer_file_pattern(&self) -> &str {
        &self.inner.buffer_file_pattern
    }
}

impl ContextInner {
    fn bump_last_id(&self) -> u64 {
        let id = self.last_id.get();
        self.last_id.set(id + 1);
        id
    }

    pub(crate) fn id_of(&self, fiber: &Fiber) -> FiberId {
        FiberId {
            gen: fiber.id.get(),
            slot: fiber.slot,
        }
    }

    /// Generational lookup; the only way a `FiberId` ever reaches storage.
    pub(crate) fn get(&self, id: FiberId) -> Result<Rc<Fiber>> {
        let fibers = self.fibers.borrow();
        let fiber = fibers.get(id.slot).ok_or(Error::NoSuchFiber)?;
        if fiber.id.get() != id.gen {
            return Err(Error::NoSuchFiber);
        }
        Ok(fiber.clone())
    }

    pub(crate) fn current(&self) -> Rc<Fiber> {
        let stack = self.call_stack.borrow();
        let top = stack.last().expect("call stack always holds the root");
        self.fibers.borrow()[top.slot].clone()
    }

    pub(crate) fn current_id(&self) -> FiberId {
        let cur = self.current();
        self.id_of(&cur)
    }

    fn spawn(&self, name: &str, func: Box<dyn FnOnce()>, stack_size: usize) -> Result<FiberId> {
        let fiber = match self.reclaimed.borrow_mut().pop() {
            Some(slot) => {
                let fiber = self.fibers.borrow()[slot].clone();
                if let Some(location) = fiber.reclaim_location.get() {
                    log::trace!("reusing fiber slot {} reclaimed at {}", slot, location);
                }
                fiber
            }
            None => {
                let stack_size = if stack_size == 0 {
                    DEFAULT_STACK_SIZE
                } else {
                    stack_size
                };
                let stack = FiberStack::new(stack_size)?;
                let mut fibers = self.fibers.borrow_mut();
                let slot = fibers.len();
                let fiber = Rc::new(Fiber::new(slot, self.bump_last_id(), name));
                *fiber.stack.borrow_mut() = Some(stack);
                fibers.push(fiber.clone());
                fiber
            }
        };

        {
            let stack = fiber.stack.borrow();
            let stack = stack.as_ref().expect("spawned fibers always own a stack");
            // Safety: the stack is owned by the fiber record and the context
            // pointer stays valid for as long as any fiber can run (the
            // record holds no Rc back, so this is the scheduler's own
            // lifetime).
            unsafe {
                fiber.coro.init(
                    call_wrapper,
                    self as *const ContextInner as *mut libc::c_void,
                    stack,
                )
            };
        }

        fiber.children.borrow_mut().clear();
        fiber.destructors.borrow_mut().clear();
        fiber.pool.borrow_mut().clear();
        *fiber.name.borrow_mut() = name.into();
        *fiber.func.borrow_mut() = Some(func);
        fiber.no_reclaim.set(0);
        fiber.want_reclaim.set(false);
        fiber.ev_arrived.set(false);
        fiber.ev_waiting.set(false);
        fiber.reclaim_location.set(None);

        let parent = self.current();
        parent.children.borrow_mut().push(fiber.slot);
        fiber.parent.set(parent.slot);

        Ok(self.id_of(&fiber))
    }

    pub(crate) fn transfer(&self, to: FiberId, location: &'static Location<'static>) -> Result<()> {
        let callee = self.get(to)?;
        let caller = self.current();
        debug_assert!(!Rc::ptr_eq(&caller, &callee), "transfer into the current fiber");
        self.call_stack.borrow_mut().push(StackFrame {
            slot: callee.slot,
            location,
        });
        // Safety: no scheduler borrows are held across the switch; both
        // records live in the fiber table for the lifetime of the runtime.
        unsafe { Coro::transfer(&caller.coro, &callee.coro) };
        Ok(())
    }

    pub(crate) fn yield_now(&self) {
        let (callee, caller) = {
            let mut stack = self.call_stack.borrow_mut();
            assert!(stack.len() > 1, "attempt to yield in the root fiber");
            let frame = stack.pop().expect("checked non-empty");
            let fibers = self.fibers.borrow();
            (
                fibers[frame.slot].clone(),
                fibers[stack.last().expect("root frame remains").slot].clone(),
            )
        };
        // Safety: as in `transfer`.
        unsafe { Coro::transfer(&callee.coro, &caller.coro) };
    }

    fn reclaim(&self, id: FiberId, location: &'static Location<'static>) -> Result<()> {
        let fiber = self.get(id)?;
        while fiber.no_reclaim.get() > 0 {
            fiber.want_reclaim.set(true);
            assert!(
                !Rc::ptr_eq(&fiber, &self.current()),
                "reclaiming self while no_reclaim is set would block forever"
            );
            if self.get(id).is_err() {
                // Someone else finished the job while we were waiting.
                return Ok(());
            }
            self.cond_wait(&fiber.reclaim_cond, None)?;
        }
        if self.get(id).is_err() {
            return Ok(());
        }
        self.do_reclaim(&fiber, location);
        Ok(())
    }

    pub(crate) fn do_reclaim(&self, fiber: &Rc<Fiber>, location: &'static Location<'static>) {
        assert_ne!(fiber.slot, ROOT_SLOT, "the root fiber cannot be reclaimed");
        fiber.reclaim_location.set(Some(location));

        // Children go first, recursively.
        let children: Vec<FiberId> = {
            let fibers = self.fibers.borrow();
            fiber
                .children
                .borrow()
                .iter()
                .map(|&slot| self.id_of(&fibers[slot]))
                .collect()
        };
        for child in children {
            // A child may already be gone if a destructor got to it.
            let _ = self.reclaim(child, location);
        }

        self.fiber_cleanup(fiber);
        fiber.id.set(self.bump_last_id());
        self.reclaimed.borrow_mut().push(fiber.slot);
        self.filter_call_stack(fiber.slot);
        // Wake anyone blocked in `reclaim` on this fiber; they will observe
        // the bumped generation and return success.
        self.cond_broadcast(&fiber.reclaim_cond);

        if Rc::ptr_eq(fiber, &self.current()) {
            self.yield_now();
            // The fiber's context is only ever rebuilt by a later spawn;
            // control cannot come back here.
            unreachable!("reclaimed fiber resumed");
        }
    }

    fn fiber_cleanup(&self, fiber: &Rc<Fiber>) {
        {
            let fibers = self.fibers.borrow();
            fibers[fiber.parent.get()]
                .children
                .borrow_mut()
                .retain(|&s| s != fiber.slot);
        }
        let dtors: Vec<Destructor> = fiber.destructors.borrow_mut().drain(..).collect();
        for dtor in dtors {
            if dtor.inner.active.get() {
                dtor.inner.active.set(false);
                dtor.fire();
            }
        }
        fiber.pool.borrow_mut().clear();
        fiber.keys.borrow_mut().clear();
        fiber.user_data.borrow_mut().take();
    }

    /// Compact non-top occurrences of the fiber out of the call stack. The
    /// top frame, when it is the fiber being reclaimed, is popped by the
    /// final yield instead.
    fn filter_call_stack(&self, slot: usize) {
        let mut stack = self.call_stack.borrow_mut();
        let mut i = 0;
        while i + 1 < stack.len() {
            if stack[i].slot == slot {
                stack.remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub(crate) fn destructor_add(&self, dtor: &Destructor) {
        let fiber = self.current();
        fiber.destructors.borrow_mut().push(dtor.clone());
        dtor.inner.active.set(true);
    }

    pub(crate) fn destructor_remove(&self, dtor: &Destructor, call: bool) {
        if !dtor.inner.active.get() {
            return;
        }
        let fiber = self.current();
        fiber.destructors.borrow_mut().retain(|d| !d.same(dtor));
        if call {
            dtor.fire();
        }
        dtor.inner.active.set(false);
    }

    fn key_registered(&self, key: Key) -> bool {
        self.key_free_mask.get() & (1u64 << key.0) == 0
    }

    fn pending_async(&self) -> Rc<dyn EvAsync> {
        self.pending_async
            .borrow()
            .clone()
            .expect("async handle is registered at init")
    }

    /// Schedule the item's fiber for resumption on a later loop turn.
    pub(crate) fn transfer_later(&self, item: Rc<QueueItem>) {
        let was_empty = self.pending.borrow().is_empty();
        *item.head.borrow_mut() = Some(Rc::downgrade(&self.pending));
        self.pending.borrow_mut().push_back(item);
        let handle = self.pending_async();
        if was_empty {
            handle.set_referenced(true);
        }
        handle.send();
    }

    /// Splice a whole waiter queue onto the pending queue in one step,
    /// preserving the waiting order.
    pub(crate) fn transfer_later_queue(&self, from: &Rc<ItemQueue>) {
        {
            let mut src = from.borrow_mut();
            if src.is_empty() {
                return;
            }
            for item in src.iter() {
                *item.head.borrow_mut() = Some(Rc::downgrade(&self.pending));
            }
            let mut dst = self.pending.borrow_mut();
            let was_empty = dst.is_empty();
            dst.extend(src.drain(..));
            drop(dst);
            drop(src);
            let handle = self.pending_async();
            if was_empty {
                handle.set_referenced(true);
            }
            handle.send();
        }
    }

    /// The async wake-up callback: resume the head of the pending queue.
    ///
    /// The item is removed by its owner's destructor once the wait finishes
    /// (or the owner is reclaimed), never here. The async stays referenced
    /// and re-armed while work remains.
    fn pending_async_cb(&self) {
        assert_eq!(
            self.current().slot,
            ROOT_SLOT,
            "the pending queue is drained from the root fiber only"
        );
        let item = match self.pending.borrow().front() {
            None => {
                self.pending_async().set_referenced(false);
                return;
            }
            Some(item) => item.clone(),
        };
        self.pending_async().send();

        match self.transfer(item.id, Location::caller()) {
            Ok(()) | Err(Error::NoSuchFiber) => {}
            Err(e) => {
                log::error!("unexpected error calling a pending fiber by id: {}", e);
            }
        }
    }

    pub(crate) fn handle_event(&self, handle: &dyn EvHandle) {
        assert_eq!(
            self.current().slot,
            ROOT_SLOT,
            "handle callbacks run in the root fiber"
        );
        let waiter = match handle.wait_slot().armed() {
            Some(Ok(waiter)) => waiter,
            Some(Err(())) => {
                log::error!("handle callback fired for a wait that already finished");
                panic!("handle callback fired for a wait that already finished");
            }
            None => {
                log::error!("handle callback fired but no fiber is waiting on the handle");
                panic!("handle callback fired but no fiber is waiting on the handle");
            }
        };
        let fiber = match self.get(waiter.id) {
            Ok(fiber) => fiber,
            Err(e) => {
                log::error!("handle callback for a fiber with an invalid id: {}", e);
                panic!("handle callback for a fiber with an invalid id");
            }
        };
        self.post_ev(&fiber, &waiter.ev);
        let rv = self.transfer(waiter.id, Location::caller());
        debug_assert!(rv.is_ok());
    }

    pub(crate) fn post_ev(&self, fiber: &Fiber, ev: &wait::EvState) {
        assert!(
            fiber.ev_waiting.get(),
            "event posted to a fiber which never entered a wait"
        );
        fiber.ev_arrived.set(true);
        ev.arrived.set(true);
    }
}

/// First function of every spawned fiber's context: run the stored closure,
/// then reclaim the fiber and yield away for good.
extern "C" fn call_wrapper(hi: libc::c_uint, lo: libc::c_uint) {
    // Safety: the pointer was put there by `spawn` and the scheduler
    // outlives every fiber it runs.
    let inner = unsafe { &*(coro::entry_arg(hi, lo) as *const ContextInner) };
    let fiber = inner.current();
    let func = fiber
        .func
        .borrow_mut()
        .take()
        .expect("spawned fiber carries a function");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
        log::error!("fiber '{}' panicked", fiber.name.borrow());
        *inner.fiber_panic.borrow_mut() = Some(payload);
    }
    inner.do_reclaim(&fiber, Location::caller());
    unreachable!("reclaimed fiber resumed after its final yield");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SimLoop;
    use std::cell::RefCell;

    fn ctx() -> (Rc<SimLoop>, Context) {
        let lp = Rc::new(SimLoop::new());
        let ctx = Context::new(lp.clone());
        (lp, ctx)
    }

    #[test]
    fn spawn_transfer_yield() {
        let (_lp, ctx) = ctx();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = {
            let ctx2 = ctx.clone();
            let log = log.clone();
            ctx.spawn("worker", move || {
                log.borrow_mut().push("in fiber");
                ctx2.yield_now();
                log.borrow_mut().push("resumed");
            })
            .unwrap()
        };
        assert_eq!(ctx.name(id).unwrap(), "worker");
        ctx.transfer(id).unwrap();
        log.borrow_mut().push("back in root");
        ctx.transfer(id).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["in fiber", "back in root", "resumed"],
        );
        // The fiber ran to completion and reclaimed itself.
        assert!(ctx.is_reclaimed(id));
        assert!(matches!(ctx.transfer(id), Err(Error::NoSuchFiber)));
    }

    #[test]
    fn stale_id_is_detected_across_reuse() {
        let (_lp, ctx) = ctx();
        let first = ctx.spawn("one", || {}).unwrap();
        ctx.transfer(first).unwrap();
        assert!(ctx.is_reclaimed(first));

        // The next spawn reuses the slot under a fresh generation.
        let second = ctx.spawn("two", || {}).unwrap();
        assert_ne!(first, second);
        assert!(matches!(ctx.name(first), Err(Error::NoSuchFiber)));
        assert_eq!(ctx.name(second).unwrap(), "two");
        ctx.transfer(second).unwrap();
    }

    #[test]
    fn self_id_and_parent() {
        let (_lp, ctx) = ctx();
        let observed = Rc::new(RefCell::new(None));
        let id = {
            let ctx2 = ctx.clone();
            let observed = observed.clone();
            ctx.spawn("outer", move || {
                let inner_parent = Rc::new(RefCell::new(None));
                let child = {
                    let ctx3 = ctx2.clone();
                    let inner_parent = inner_parent.clone();
                    ctx2.spawn("inner", move || {
                        *inner_parent.borrow_mut() = Some(ctx3.parent());
                    })
                    .unwrap()
                };
                ctx2.transfer(child).unwrap();
                *observed.borrow_mut() = Some((ctx2.self_id(), ctx2.parent(), inner_parent.borrow().clone().unwrap()));
            })
            .unwrap()
        };
        ctx.transfer(id).unwrap();
        let (self_id, parent, inner_parent) = observed.borrow().clone().unwrap();
        assert_eq!(self_id, id);
        // Spawned from root, so no reportable parent.
        assert_eq!(parent, None);
        // The inner fiber's parent is the outer one.
        assert_eq!(inner_parent, Some(id));
    }

    #[test]
    fn destructors_fire_in_insertion_order() {
        let (_lp, ctx) = ctx();
        let order = Rc::new(RefCell::new(Vec::new()));
        let id = {
            let ctx2 = ctx.clone();
            let order = order.clone();
            ctx.spawn("doomed", move || {
                for i in 0..3 {
                    let order = order.clone();
                    let d = Destructor::new(move || order.borrow_mut().push(i));
                    ctx2.destructor_add(&d);
                }
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(id).unwrap();
        assert!(order.borrow().is_empty());
        ctx.reclaim(id).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(ctx.is_reclaimed(id));
    }

    #[test]
    fn removed_destructor_does_not_fire() {
        let (_lp, ctx) = ctx();
        let fired = Rc::new(Cell::new(0));
        let id = {
            let ctx2 = ctx.clone();
            let fired = fired.clone();
            ctx.spawn("w", move || {
                let removed = {
                    let fired = fired.clone();
                    Destructor::new(move || fired.set(fired.get() + 1))
                };
                let called = {
                    let fired = fired.clone();
                    Destructor::new(move || fired.set(fired.get() + 10))
                };
                ctx2.destructor_add(&removed);
                ctx2.destructor_add(&called);
                ctx2.destructor_remove(&removed, false);
                ctx2.destructor_remove(&called, true);
                // Removing again is a no-op.
                ctx2.destructor_remove(&called, true);
            })
            .unwrap()
        };
        ctx.transfer(id).unwrap();
        assert_eq!(fired.get(), 10);
    }

    #[test]
    fn children_are_reclaimed_first() {
        let (_lp, ctx) = ctx();
        let order = Rc::new(RefCell::new(Vec::new()));
        let parent = {
            let ctx2 = ctx.clone();
            let order = order.clone();
            ctx.spawn("parent", move || {
                let child = {
                    let ctx3 = ctx2.clone();
                    let order = order.clone();
                    ctx2.spawn("child", move || {
                        let order = order.clone();
                        let d = Destructor::new(move || order.borrow_mut().push("child"));
                        ctx3.destructor_add(&d);
                        ctx3.yield_now();
                    })
                    .unwrap()
                };
                ctx2.transfer(child).unwrap();
                let order = order.clone();
                let d = Destructor::new(move || order.borrow_mut().push("parent"));
                ctx2.destructor_add(&d);
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(parent).unwrap();
        ctx.reclaim(parent).unwrap();
        assert_eq!(*order.borrow(), vec!["child", "parent"]);
    }

    #[test]
    fn disown_detaches_from_the_cascade() {
        let (_lp, ctx) = ctx();
        let reclaimed = Rc::new(Cell::new(false));
        let survivor = Rc::new(RefCell::new(None));
        let parent = {
            let ctx2 = ctx.clone();
            let reclaimed = reclaimed.clone();
            let survivor = survivor.clone();
            ctx.spawn("parent", move || {
                let child = {
                    let ctx3 = ctx2.clone();
                    let reclaimed = reclaimed.clone();
                    ctx2.spawn("child", move || {
                        ctx3.disown(None).unwrap();
                        let d = {
                            let reclaimed = reclaimed.clone();
                            Destructor::new(move || reclaimed.set(true))
                        };
                        ctx3.destructor_add(&d);
                        ctx3.yield_now();
                    })
                    .unwrap()
                };
                ctx2.transfer(child).unwrap();
                *survivor.borrow_mut() = Some(child);
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(parent).unwrap();
        ctx.reclaim(parent).unwrap();
        // The disowned child did not go down with its old parent.
        let child = survivor.borrow().unwrap();
        assert!(!reclaimed.get());
        assert!(!ctx.is_reclaimed(child));
        ctx.reclaim(child).unwrap();
        assert!(reclaimed.get());
    }

    #[test]
    fn noreclaim_blocks_until_released() {
        let (lp, ctx) = ctx();
        let target = {
            let ctx2 = ctx.clone();
            ctx.spawn("target", move || {
                let me = ctx2.self_id();
                ctx2.set_noreclaim(me).unwrap();
                ctx2.yield_now();
                // By now someone wants us gone.
                assert!(!ctx2.want_reclaim(me).unwrap(), "masked while no_reclaim is set");
                ctx2.set_reclaim(me).unwrap();
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(target).unwrap();

        let done = Rc::new(Cell::new(false));
        let reclaimer = {
            let ctx2 = ctx.clone();
            let done = done.clone();
            ctx.spawn("reclaimer", move || {
                ctx2.reclaim(target).unwrap();
                assert!(ctx2.is_reclaimed(target));
                done.set(true);
            })
            .unwrap()
        };
        ctx.transfer(reclaimer).unwrap();
        // The reclaimer is parked on the target's reclaim condition.
        assert!(!done.get());
        assert!(!ctx.is_reclaimed(target));

        // Let the target drop its no-reclaim section; the broadcast goes
        // through the pending queue, so drive the loop.
        ctx.transfer(target).unwrap();
        crate::test_utils::run(&lp, &ctx);
        assert!(done.get());
        assert!(ctx.is_reclaimed(target));
    }

    #[test]
    fn keys_are_per_fiber_and_cleared_at_reclaim() {
        let (_lp, ctx) = ctx();
        let key = ctx.key_create();
        let root = ctx.self_id();
        ctx.key_set(root, key, Rc::new(7i32)).unwrap();

        let id = {
            let ctx2 = ctx.clone();
            ctx.spawn("w", move || {
                let me = ctx2.self_id();
                assert!(ctx2.key_get(me, key).unwrap().is_none());
                ctx2.key_set(me, key, Rc::new(42i32)).unwrap();
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(id).unwrap();
        let held = ctx.key_get(id, key).unwrap().unwrap();
        assert_eq!(*held.downcast::<i32>().unwrap(), 42);
        ctx.reclaim(id).unwrap();

        let root_val = ctx.key_get(root, key).unwrap().unwrap();
        assert_eq!(*root_val.downcast::<i32>().unwrap(), 7);

        ctx.key_delete(key).unwrap();
        assert!(matches!(ctx.key_get(root, key), Err(Error::NoSuchKey)));
        assert!(matches!(ctx.key_delete(key), Err(Error::NoSuchKey)));
    }

    #[test]
    fn user_data_round_trips() {
        let (_lp, ctx) = ctx();
        let root = ctx.self_id();
        assert!(ctx.user_data(root).unwrap().is_none());
        ctx.set_user_data(root, Rc::new("hello".to_string())).unwrap();
        let data = ctx.user_data(root).unwrap().unwrap();
        assert_eq!(*data.downcast::<String>().unwrap(), "hello");
    }

    #[test]
    fn arena_values_live_until_reclaim() {
        struct Canary(Rc<Cell<bool>>);
        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let (_lp, ctx) = ctx();
        let dropped = Rc::new(Cell::new(false));
        let id = {
            let ctx2 = ctx.clone();
            let dropped = dropped.clone();
            ctx.spawn("w", move || {
                ctx2.alloc(Canary(dropped.clone()));
                ctx2.yield_now();
            })
            .unwrap()
        };
        ctx.transfer(id).unwrap();
        assert!(!dropped.get());
        ctx.reclaim(id).unwrap();
        assert!(dropped.get());
    }

    #[test]
    fn fiber_panic_is_captured() {
        let (_lp, ctx) = ctx();
        let id = ctx.spawn("bomb", || panic!("boom")).unwrap();
        ctx.transfer(id).unwrap();
        assert!(ctx.is_reclaimed(id));
        let payload = ctx.take_fiber_panic().unwrap();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
    }
}
