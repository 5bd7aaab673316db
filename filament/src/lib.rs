//! Cooperative fiber runtime for event-loop based programs.
//!
//! This library multiplexes many lightweight execution contexts ("fibers"),
//! each with its own private stack, onto the single OS thread that runs a
//! host event loop. It provides:
//!
//! - [Fibers: spawning, symmetric transfer, generational ids, reclamation](fiber)
//! - [A uniform wait-event protocol over mutexes, conds, host handles and timers](fiber::wait)
//! - [FIFO synchronization primitives](fiber::Mutex) ([`Cond`](fiber::Cond))
//! - [Bounded message queues](fiber::Channel)
//! - [A double-mapped virtual ring buffer](vrb) and a
//!   [producer/consumer pipe](buffer) on top of it
//! - [The contract the host event loop has to satisfy](ev)
//!
//! The runtime is strictly single-threaded and strictly cooperative: fibers
//! are never preempted and nothing here is `Send`. Blocking operations
//! suspend the calling fiber and hand control to whatever transferred into
//! it, eventually unwinding to the root fiber which runs the event loop;
//! external callbacks (timers, I/O readiness, the internal async wake-up)
//! transfer back into the waiting fibers.
//!
//! ```no_run
//! use std::rc::Rc;
//! use filament::fiber::Context;
//! use filament::test_utils::SimLoop;
//!
//! let lp = Rc::new(SimLoop::new());
//! let ctx = Context::new(lp.clone());
//! let worker = {
//!     let ctx2 = ctx.clone();
//!     ctx.spawn("worker", move || {
//!         ctx2.sleep(std::time::Duration::from_millis(10));
//!         println!("good morning");
//!     }).unwrap()
//! };
//! ctx.transfer(worker).unwrap();
//! lp.run();
//! ```

pub mod buffer;
mod coro;
pub mod error;
pub mod ev;
pub mod fiber;
pub mod test_utils;
pub mod util;
pub mod vrb;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use fiber::{Channel, Cond, Context, Destructor, Event, FiberId, Key, Mutex};
pub use vrb::Vrb;
