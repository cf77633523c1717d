//! The cooperative event loop that owns and schedules native timer resources.

use std::{
    cell::{Cell, RefCell},
    fmt, mem,
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    crate_util::RunOnDrop,
    error::{LoopError, TimerError},
    timer::{fire, TimerShared},
};

unique_id! {
    /// Identifies one native timer resource in its loop's resource table.
    pub(crate) struct TimerId;
}

/// A native timer resource.
///
/// Owned by the loop's resource table for as long as the owning [`Timer`] has
/// started at least once and has not finished closing.
///
/// [`Timer`]: crate::Timer
struct TimerResource {
    id: TimerId,
    /// Next due instant, `None` while the timer is stopped or closing.
    due: Option<Instant>,
    /// Repeat interval in the loop's native unit, `0` for one-shot timers.
    repeat_ms: u64,
    closing: bool,
    /// The strong reference that keeps the managed timer alive while this
    /// resource exists. Dropped exactly once, by the close trampoline.
    keep_alive: Rc<TimerShared>,
}

struct LoopCore {
    /// Cached monotonic clock, refreshed at the start of every iteration.
    now: Instant,
    max_timers: usize,
    resources: Vec<TimerResource>,
    pending_close: Vec<TimerId>,
}
impl LoopCore {
    fn find(&mut self, id: TimerId) -> Result<&mut TimerResource, LoopError> {
        self.resources.iter_mut().find(|r| r.id == id).ok_or_else(LoopError::unknown_timer)
    }

    fn earliest_due(&self) -> Option<Instant> {
        self.resources.iter().filter_map(|r| r.due).min()
    }

    fn has_armed(&self) -> bool {
        self.resources.iter().any(|r| r.due.is_some())
    }

    /// Removes the earliest firing due at the cached `now` and returns a strong
    /// hold on the owning timer, or `None` if nothing is due.
    ///
    /// Repeating timers are rescheduled and one-shot timers disarmed *before* the
    /// firing is delivered, so the callback observes the post-firing schedule and
    /// may legally call `start` again.
    fn take_next_due(&mut self) -> Option<Rc<TimerShared>> {
        let now = self.now;
        let mut next: Option<(usize, Instant)> = None;
        for (i, r) in self.resources.iter().enumerate() {
            if r.closing {
                continue;
            }
            if let Some(due) = r.due {
                if due <= now && next.map_or(true, |(_, best)| due < best) {
                    next = Some((i, due));
                }
            }
        }
        let (i, _) = next?;

        let r = &mut self.resources[i];
        if r.repeat_ms > 0 {
            r.due = now.checked_add(Duration::from_millis(r.repeat_ms));
        } else {
            r.due = None;
        }
        if r.due.is_none() {
            r.keep_alive.set_idle();
        }
        Some(Rc::clone(&r.keep_alive))
    }
}

struct LoopData {
    core: RefCell<LoopCore>,
    /// Set while `run_once` is on the stack, callbacks re-entering a run method is
    /// the one loop misuse the cooperative model cannot express.
    dispatching: Cell<bool>,
}

/// A single-threaded, callback-driven event loop.
///
/// The loop owns a monotonic clock and a table of native timer resources, it fires
/// the registered callback of each resource at its due instant, one at a time.
/// Cloning shares the same loop.
///
/// Timers are created with [`Timer::new`] and keep their loop alive until they
/// finish closing.
///
/// [`Timer::new`]: crate::Timer::new
#[derive(Clone)]
pub struct EventLoop {
    data: Rc<LoopData>,
}
impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("alive_timers", &self.alive_timers())
            .field("dispatching", &self.data.dispatching.get())
            .finish()
    }
}
impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
impl EventLoop {
    /// New loop with no limit on the number of timer resources.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// New loop that refuses to allocate more than `max_timers` native resources at a time.
    ///
    /// [`Timer::start`] fails with [`TimerError::ResourceExhausted`] when the limit is reached,
    /// resources are returned to the pool when their timer finishes closing.
    ///
    /// [`Timer::start`]: crate::Timer::start
    pub fn with_capacity(max_timers: usize) -> Self {
        EventLoop {
            data: Rc::new(LoopData {
                core: RefCell::new(LoopCore {
                    now: Instant::now(),
                    max_timers,
                    resources: vec![],
                    pending_close: vec![],
                }),
                dispatching: Cell::new(false),
            }),
        }
    }

    /// The loop's cached monotonic clock.
    ///
    /// Refreshed at the start of every loop iteration, due instants are computed
    /// against this value.
    pub fn now(&self) -> Instant {
        self.data.core.borrow().now
    }

    /// Count of native timer resources not yet released.
    ///
    /// Includes stopped timers, their resource is retained for cheap re-arming
    /// until they are closed.
    pub fn alive_timers(&self) -> usize {
        self.data.core.borrow().resources.len()
    }

    /// Run one loop iteration.
    ///
    /// Refreshes the clock, sleeps until the earliest due instant if no firing or
    /// close is pending yet, delivers every due firing one at a time, then releases
    /// the resources whose close was requested. Returns `true` if armed timers remain.
    ///
    /// Fails with a [`Busy`](crate::LoopErrorKind::Busy) error if called from inside
    /// a timer callback.
    pub fn run_once(&self) -> Result<bool, LoopError> {
        if self.data.dispatching.get() {
            return Err(LoopError::busy());
        }
        self.data.dispatching.set(true);
        let _dispatch_guard = RunOnDrop::new(|| self.data.dispatching.set(false));

        {
            let mut core = self.data.core.borrow_mut();
            core.now = Instant::now();
            if core.pending_close.is_empty() {
                if let Some(due) = core.earliest_due() {
                    if let Some(wait) = due.checked_duration_since(core.now) {
                        thread::sleep(wait);
                        core.now = Instant::now();
                    }
                }
            }
        }

        // deliver due firings, re-reading the table between each one so that
        // stop/close/start calls made by a callback take effect immediately
        loop {
            let fired = self.data.core.borrow_mut().take_next_due();
            match fired {
                Some(shared) => fire(&shared),
                None => break,
            }
        }

        self.process_closes();

        Ok(self.data.core.borrow().has_armed())
    }

    /// Run the loop until no armed timer and no pending close remains.
    pub fn run(&self) -> Result<(), LoopError> {
        while self.run_once()? {}
        Ok(())
    }

    /// Close trampoline, runs at the end of a loop iteration, strictly after all
    /// firings delivered in that iteration.
    fn process_closes(&self) {
        let closed: Vec<TimerResource> = {
            let mut core = self.data.core.borrow_mut();
            let ids = mem::take(&mut core.pending_close);
            ids.into_iter()
                .filter_map(|id| {
                    let i = core.resources.iter().position(|r| r.id == id)?;
                    Some(core.resources.swap_remove(i))
                })
                .collect()
        };
        for resource in closed {
            tracing::debug!("released timer resource {:?}", resource.id);
            resource.keep_alive.finish_close();
            // dropping `resource` releases the keep-alive reference
        }
    }

    /// Allocate a native resource for `shared` and schedule it.
    ///
    /// The resource table takes a strong reference on `shared` that is released
    /// only when the resource finishes closing.
    pub(crate) fn register_timer(
        &self,
        shared: &Rc<TimerShared>,
        timeout: Duration,
        repeat: Duration,
    ) -> Result<TimerId, TimerError> {
        let timeout_ms = duration_to_millis(timeout)?;
        let repeat_ms = duration_to_millis(repeat)?;

        let mut core = self.data.core.borrow_mut();
        if core.resources.len() >= core.max_timers {
            return Err(TimerError::ResourceExhausted);
        }
        let due = due_instant(core.now, timeout_ms)?;

        let id = TimerId::new_unique();
        core.resources.push(TimerResource {
            id,
            due: Some(due),
            repeat_ms,
            closing: false,
            keep_alive: Rc::clone(shared),
        });
        tracing::trace!("registered timer resource {id:?}");
        Ok(id)
    }

    /// Re-arm a retained resource with a new timeout and repeat, used by `start`
    /// on a timer that was stopped.
    pub(crate) fn restart_timer(&self, id: TimerId, timeout: Duration, repeat: Duration) -> Result<(), TimerError> {
        let timeout_ms = duration_to_millis(timeout)?;
        let repeat_ms = duration_to_millis(repeat)?;

        let mut core = self.data.core.borrow_mut();
        let due = due_instant(core.now, timeout_ms)?;
        let r = core.find(id)?;
        r.due = Some(due);
        r.repeat_ms = repeat_ms;
        Ok(())
    }

    /// Cancel the pending schedule, the resource and its keep-alive reference are retained.
    pub(crate) fn cancel_timer(&self, id: TimerId) -> Result<(), LoopError> {
        let mut core = self.data.core.borrow_mut();
        core.find(id)?.due = None;
        Ok(())
    }

    /// Re-arm using the repeat interval as the new timeout.
    ///
    /// Returns `false` without touching the schedule if the repeat interval is zero.
    pub(crate) fn rearm_timer(&self, id: TimerId) -> Result<bool, TimerError> {
        let mut core = self.data.core.borrow_mut();
        let now = core.now;
        let r = core.find(id)?;
        if r.repeat_ms == 0 {
            return Ok(false);
        }
        r.due = Some(due_instant(now, r.repeat_ms)?);
        Ok(true)
    }

    pub(crate) fn timer_repeat(&self, id: TimerId) -> Result<Duration, LoopError> {
        let mut core = self.data.core.borrow_mut();
        let r = core.find(id)?;
        Ok(Duration::from_millis(r.repeat_ms))
    }

    /// Set the repeat interval, takes effect for the next firing, an already
    /// scheduled firing is not rescheduled.
    pub(crate) fn set_timer_repeat(&self, id: TimerId, repeat: Duration) -> Result<(), TimerError> {
        let repeat_ms = duration_to_millis(repeat)?;
        let mut core = self.data.core.borrow_mut();
        core.find(id)?.repeat_ms = repeat_ms;
        Ok(())
    }

    /// Request asynchronous release of the resource.
    ///
    /// The resource stops firing immediately, the close trampoline runs at the end
    /// of a later loop iteration, after no further firings can occur.
    pub(crate) fn request_close(&self, id: TimerId) {
        let mut core = self.data.core.borrow_mut();
        let mut queue = false;
        if let Some(r) = core.resources.iter_mut().find(|r| r.id == id) {
            if !r.closing {
                r.due = None;
                r.closing = true;
                queue = true;
            }
        }
        if queue {
            core.pending_close.push(id);
            tracing::trace!("close requested for timer resource {id:?}");
        }
    }
}

/// Truncates to the loop's native whole-millisecond unit.
///
/// Sub-millisecond precision is discarded, durations whose millisecond value
/// does not fit `u64` are rejected.
fn duration_to_millis(d: Duration) -> Result<u64, TimerError> {
    u64::try_from(d.as_millis()).map_err(|_| TimerError::InvalidDuration)
}

fn due_instant(now: Instant, delay_ms: u64) -> Result<Instant, TimerError> {
    now.checked_add(Duration::from_millis(delay_ms)).ok_or(TimerError::InvalidDuration)
}
