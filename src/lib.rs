//! Cooperative, single-threaded fibers over OS readiness notification.
//!
//! Fibers look like they block on descriptors and timers while they
//! actually yield to a per-thread scheduler, the hub, which multiplexes a
//! polling backend and a timer heap.
//!
//! # Architecture
//!
//! - **Hub**: per-thread event loop running in its own fiber; owns the
//!   listener registry, the timer store and the polling backend
//! - **Backend**: epoll, kqueue, poll or select behind one trait
//! - **Timers**: one-shot callbacks in a min-heap with lazy cancellation
//! - **Fibers**: stackful coroutines with spawn, kill, link and wait
//! - **Trampoline**: the register, switch, clean-up protocol behind every
//!   blocking-style call
//! - **HubBuilder**: fluent configuration of a hub
//!
//! # Example
//!
//! ```ignore
//! use fiberhub::{sleep, spawn};
//! use std::time::Duration;
//!
//! let a = spawn(|| {
//!     sleep(Duration::from_millis(20))?;
//!     Ok("a")
//! });
//! let b = spawn(|| Ok("b"));
//!
//! assert_eq!(b.wait().unwrap(), "b");
//! assert_eq!(a.wait().unwrap(), "a");
//! ```

mod builder;
mod error;
mod fiber;
mod hub;
pub mod poller;
mod timer;
mod trampoline;
mod utils;

pub use builder::{BACKEND_ENV, HubBuilder, use_backend};
pub use error::{Error, Result};
pub use fiber::{
    Event, FiberHandle, FiberId, FiberRef, FiberState, LinkId, current_fiber, kill, kill_with,
    spawn, spawn_after, spawn_after_local, spawn_n,
};
pub use hub::{Direction, Hub, ListenerHandle, ListenerInfo, Readiness, WakeHandle, WeakHub};
pub use poller::{Backend, BackendKind, Interest, PollEvent};
pub use timer::{TimerHandle, TimerInfo, TimerKind};
pub use trampoline::{Trampoline, sleep, trampoline};
