#![warn(unused_extern_crates)]
#![warn(missing_docs)]

//! Timer handles for a single-threaded, callback-driven event loop.
//!
//! An [`EventLoop`] owns a monotonic clock and a table of native timer resources,
//! a [`Timer`] is the user-facing handle that wraps one of those resources and
//! enforces its lifecycle: armed with [`start`](Timer::start), disarmed with
//! [`stop`](Timer::stop) without releasing the resource, re-armed with
//! [`again`](Timer::again), and permanently retired with [`close`](Timer::close).
//! Callbacks are delivered one at a time by the loop and may start, stop, close or
//! re-schedule their own timer synchronously.
//!
//! ```
//! use evtimer::{EventLoop, Timer};
//! use std::{cell::Cell, rc::Rc, time::Duration};
//!
//! let lp = EventLoop::new();
//! let timer = Timer::new(&lp);
//!
//! let count = Rc::new(Cell::new(0));
//! let c = Rc::clone(&count);
//! timer
//!     .start(
//!         move |t, _data| {
//!             c.set(c.get() + 1);
//!             if c.get() == 3 {
//!                 t.close();
//!             }
//!         },
//!         Duration::ZERO,
//!         Duration::from_millis(1),
//!         None,
//!     )
//!     .unwrap();
//!
//! lp.run().unwrap();
//! assert_eq!(count.get(), 3);
//! ```

#[macro_use]
mod crate_util;

mod error;
mod event_loop;
mod timer;

pub use error::{set_unraisable_hook, take_unraisable_hook, LoopError, LoopErrorKind, TimerError, UnraisableError, UnraisableHook};
pub use event_loop::EventLoop;
pub use timer::Timer;
