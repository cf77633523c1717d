//! Timer handles.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
    time::Duration,
};

use crate::{
    error::{write_unraisable, LoopError, TimerError},
    event_loop::{EventLoop, TimerId},
};

/// Timer lifecycle state.
///
/// `Idle ⇄ Armed` any number of times, then `Closing → Closed` once, terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerStatus {
    /// Never armed, or stopped. The native resource is retained after the first start.
    Idle,
    /// Native resource scheduled, the callback may fire.
    Armed,
    /// Close requested, native teardown pending in the loop.
    Closing,
    /// Native resource released, the timer is permanently inert.
    Closed,
}

type BoxedCallback = Box<dyn FnMut(&Timer, Option<Rc<dyn Any>>)>;

/// State shared between all clones of a [`Timer`] handle and the loop's
/// keep-alive reference.
pub(crate) struct TimerShared {
    event_loop: EventLoop,
    status: Cell<TimerStatus>,
    /// Native resource id, set on the first successful start, cleared only when
    /// the close trampoline runs.
    resource: Cell<Option<TimerId>>,
    callback: RefCell<Option<BoxedCallback>>,
    data: RefCell<Option<Rc<dyn Any>>>,
}
impl TimerShared {
    /// One-shot firing delivered or reschedule overflowed, the timer disarms
    /// itself before the callback runs.
    pub(crate) fn set_idle(&self) {
        self.status.set(TimerStatus::Idle);
    }

    /// Close trampoline notification, detaches the native association.
    ///
    /// The stored callback is dropped here, it commonly captures the timer's own
    /// handle and would otherwise keep the shared state in a reference cycle.
    pub(crate) fn finish_close(&self) {
        self.resource.set(None);
        self.status.set(TimerStatus::Closed);
        *self.callback.borrow_mut() = None;
    }
}

/// Firing trampoline, translates a native firing into a call of the timer's callback.
///
/// Holds a temporary strong reference for the duration of the call and re-reads the
/// timer state fresh, the callback may have been preceded in the same loop iteration
/// by another callback that stopped or closed this timer.
///
/// Callback panics are contained here and reported through the unraisable channel,
/// they never propagate into the loop's dispatch.
pub(crate) fn fire(shared: &Rc<TimerShared>) {
    if matches!(shared.status.get(), TimerStatus::Closing | TimerStatus::Closed) {
        return;
    }

    let timer = Timer { shared: Rc::clone(shared) };
    let Some(mut callback) = shared.callback.borrow_mut().take() else {
        return;
    };
    let data = shared.data.borrow().clone();

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&timer, data))) {
        write_unraisable("timer callback", &*payload);
    }

    // the callback may have replaced itself with `start` or requested close
    let mut slot = shared.callback.borrow_mut();
    if slot.is_none() && !matches!(shared.status.get(), TimerStatus::Closing | TimerStatus::Closed) {
        *slot = Some(callback);
    }
}

/// A repeating or one-shot timer bound to an [`EventLoop`].
///
/// The handle wraps one loop-owned native timer resource. The resource is allocated
/// by the first [`start`] and retained across [`stop`]/[`start`] cycles, [`close`]
/// is the only operation that releases it. While the resource exists the loop holds
/// a keep-alive reference on the shared state, so dropping every `Timer` clone does
/// not tear the timer down mid-flight.
///
/// Cloning shares the same timer.
///
/// # Example
///
/// ```
/// use evtimer::{EventLoop, Timer};
/// use std::time::Duration;
///
/// let lp = EventLoop::new();
/// let timer = Timer::new(&lp);
/// timer
///     .start(|t, _data| t.close(), Duration::ZERO, Duration::ZERO, None)
///     .unwrap();
/// lp.run().unwrap();
/// ```
///
/// [`start`]: Timer::start
/// [`stop`]: Timer::stop
/// [`close`]: Timer::close
#[derive(Clone)]
pub struct Timer {
    shared: Rc<TimerShared>,
}
impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("status", &self.shared.status.get())
            .field("resource", &self.shared.resource.get())
            .finish()
    }
}
impl Timer {
    /// New timer bound to `event_loop`.
    ///
    /// The binding is permanent, the timer starts idle with no native resource.
    pub fn new(event_loop: &EventLoop) -> Self {
        Timer {
            shared: Rc::new(TimerShared {
                event_loop: event_loop.clone(),
                status: Cell::new(TimerStatus::Idle),
                resource: Cell::new(None),
                callback: RefCell::new(None),
                data: RefCell::new(None),
            }),
        }
    }

    /// The loop this timer is bound to.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// Arm the timer.
    ///
    /// `callback` is invoked with this timer and `data` after `timeout`, and then
    /// every `repeat` if `repeat` is not zero. With `repeat` zero the timer fires
    /// once and returns to idle on its own. Both durations are truncated to the
    /// loop's whole-millisecond unit.
    ///
    /// The first start allocates the native resource, a start after [`stop`]
    /// re-arms the retained one. On failure no state is touched, the previous
    /// callback and data remain and the timer stays retryable.
    ///
    /// [`stop`]: Timer::stop
    pub fn start<F>(&self, callback: F, timeout: Duration, repeat: Duration, data: Option<Rc<dyn Any>>) -> Result<(), TimerError>
    where
        F: FnMut(&Timer, Option<Rc<dyn Any>>) + 'static,
    {
        match self.shared.status.get() {
            TimerStatus::Closing | TimerStatus::Closed => return Err(TimerError::Closed),
            TimerStatus::Armed => return Err(TimerError::AlreadyActive),
            TimerStatus::Idle => {}
        }

        match self.shared.resource.get() {
            Some(id) => self.shared.event_loop.restart_timer(id, timeout, repeat)?,
            None => {
                let id = self.shared.event_loop.register_timer(&self.shared, timeout, repeat)?;
                self.shared.resource.set(Some(id));
            }
        }

        *self.shared.callback.borrow_mut() = Some(Box::new(callback));
        *self.shared.data.borrow_mut() = data;
        self.shared.status.set(TimerStatus::Armed);
        tracing::trace!("timer armed, timeout {timeout:?}, repeat {repeat:?}");
        Ok(())
    }

    /// Cancel the pending schedule.
    ///
    /// The native resource and the loop's keep-alive reference are retained so
    /// [`start`] or [`again`] can cheaply re-arm.
    ///
    /// [`start`]: Timer::start
    /// [`again`]: Timer::again
    pub fn stop(&self) -> Result<(), TimerError> {
        if self.shared.status.get() != TimerStatus::Armed {
            return Err(TimerError::NotActive);
        }
        let Some(id) = self.shared.resource.get() else {
            return Err(LoopError::unknown_timer().into());
        };
        self.shared.event_loop.cancel_timer(id)?;
        self.shared.status.set(TimerStatus::Idle);
        tracing::trace!("timer stopped");
        Ok(())
    }

    /// Re-arm using the repeat interval as the new timeout.
    ///
    /// No-op success if the repeat interval is zero. Fails if the timer is closed
    /// or was never started.
    pub fn again(&self) -> Result<(), TimerError> {
        if matches!(self.shared.status.get(), TimerStatus::Closing | TimerStatus::Closed) {
            return Err(TimerError::Closed);
        }
        let Some(id) = self.shared.resource.get() else {
            return Err(TimerError::NeverStarted);
        };
        if self.shared.event_loop.rearm_timer(id)? {
            self.shared.status.set(TimerStatus::Armed);
        }
        Ok(())
    }

    /// Request asynchronous release of the native resource.
    ///
    /// Idempotent, closing an already closing or closed timer is a no-op. After
    /// this returns the timer is no longer active and no start/stop/again can
    /// succeed. The resource itself is released by the loop at the end of a later
    /// iteration, after no further firings can occur; release is observable via
    /// [`EventLoop::alive_timers`].
    pub fn close(&self) {
        match self.shared.status.get() {
            TimerStatus::Closing | TimerStatus::Closed => return,
            TimerStatus::Idle | TimerStatus::Armed => {}
        }
        match self.shared.resource.get() {
            Some(id) => {
                self.shared.status.set(TimerStatus::Closing);
                self.shared.event_loop.request_close(id);
            }
            None => {
                // never started, no native resource and no keep-alive to release
                self.shared.status.set(TimerStatus::Closed);
            }
        }
        tracing::debug!("timer closed");
    }

    /// The repeat interval, in the loop's whole-millisecond unit.
    ///
    /// Fails if the timer is closed or was never started.
    pub fn repeat(&self) -> Result<Duration, TimerError> {
        let id = self.repeat_resource()?;
        Ok(self.shared.event_loop.timer_repeat(id)?)
    }

    /// Set the repeat interval.
    ///
    /// Takes effect for the next firing, an already scheduled firing keeps its due
    /// instant. The duration is truncated to whole milliseconds.
    pub fn set_repeat(&self, repeat: Duration) -> Result<(), TimerError> {
        let id = self.repeat_resource()?;
        self.shared.event_loop.set_timer_repeat(id, repeat)
    }

    fn repeat_resource(&self) -> Result<TimerId, TimerError> {
        if matches!(self.shared.status.get(), TimerStatus::Closing | TimerStatus::Closed) {
            return Err(TimerError::Closed);
        }
        self.shared.resource.get().ok_or(TimerError::NeverStarted)
    }

    /// Arbitrary payload passed to each callback invocation.
    pub fn data(&self) -> Option<Rc<dyn Any>> {
        self.shared.data.borrow().clone()
    }

    /// Replace the payload, legal in any lifecycle state.
    pub fn set_data(&self, data: Option<Rc<dyn Any>>) {
        *self.shared.data.borrow_mut() = data;
    }

    /// If the timer is armed and its callback may fire.
    pub fn is_active(&self) -> bool {
        self.shared.status.get() == TimerStatus::Armed
    }

    /// If close was requested, the terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.shared.status.get(), TimerStatus::Closing | TimerStatus::Closed)
    }
}
