//! Timer and loop error types, and the channel that reports callback panics.

use std::{any::Any, error::Error, fmt};

use parking_lot::Mutex;

use crate::crate_util::panic_str;

/// Error for [`Timer`] lifecycle operations.
///
/// Every operation either succeeds or fails atomically with one of these values,
/// the timer is never left in an ambiguous state.
///
/// [`Timer`]: crate::Timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// Operation attempted on a timer that was already closed.
    Closed,
    /// [`start`](crate::Timer::start) called while the timer is armed.
    AlreadyActive,
    /// [`stop`](crate::Timer::stop) called while the timer is not armed.
    NotActive,
    /// Operation requires the native resource, but the timer was never started.
    NeverStarted,
    /// Duration does not fit the event loop's millisecond clock.
    InvalidDuration,
    /// The event loop cannot allocate another native timer resource.
    ResourceExhausted,
    /// Underlying event loop operation failed.
    Loop(LoopError),
}
impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::Closed => write!(f, "timer is closed"),
            TimerError::AlreadyActive => write!(f, "timer is already active"),
            TimerError::NotActive => write!(f, "timer is not active"),
            TimerError::NeverStarted => write!(f, "timer was never started"),
            TimerError::InvalidDuration => write!(f, "duration overflows the event loop clock"),
            TimerError::ResourceExhausted => write!(f, "event loop reached its timer resource limit"),
            TimerError::Loop(e) => write!(f, "event loop error, {e}"),
        }
    }
}
impl Error for TimerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TimerError::Loop(e) => Some(e),
            _ => None,
        }
    }
}
impl From<LoopError> for TimerError {
    fn from(e: LoopError) -> Self {
        TimerError::Loop(e)
    }
}

/// Error for [`EventLoop`] operations.
///
/// [`EventLoop`]: crate::EventLoop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopError {
    kind: LoopErrorKind,
}
impl LoopError {
    pub(crate) fn busy() -> Self {
        LoopError { kind: LoopErrorKind::Busy }
    }

    pub(crate) fn unknown_timer() -> Self {
        LoopError {
            kind: LoopErrorKind::UnknownTimer,
        }
    }

    /// What loop operation failure this error represents.
    pub fn kind(&self) -> LoopErrorKind {
        self.kind
    }
}
impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LoopErrorKind::Busy => write!(f, "event loop is already dispatching"),
            LoopErrorKind::UnknownTimer => write!(f, "timer resource is not registered in the loop"),
        }
    }
}
impl Error for LoopError {}

/// Kind of [`LoopError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopErrorKind {
    /// The loop was re-entered while it was dispatching callbacks, a callback called
    /// a run method of its own loop.
    Busy,
    /// A native resource id was not found in the loop's resource table.
    UnknownTimer,
}

/// A panic captured at the timer callback boundary.
///
/// Callback panics never propagate into the loop's dispatch, they are reported
/// through the hook set with [`set_unraisable_hook`], or with `tracing` if no hook is set.
#[derive(Debug, Clone)]
pub struct UnraisableError {
    context: String,
    message: String,
}
impl UnraisableError {
    /// Where the panic was captured.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
impl fmt::Display for UnraisableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic in {}, {}", self.context, self.message)
    }
}
impl Error for UnraisableError {}

/// Hook for [`UnraisableError`] reports.
pub type UnraisableHook = Box<dyn Fn(&UnraisableError) + Send + Sync>;

static UNRAISABLE_HOOK: Mutex<Option<UnraisableHook>> = Mutex::new(None);

/// Set the process wide handler for panics captured at the timer callback boundary.
///
/// Replaces the previous hook, if any. When no hook is set captured panics are
/// logged with `tracing::error!`.
pub fn set_unraisable_hook(hook: impl Fn(&UnraisableError) + Send + Sync + 'static) {
    *UNRAISABLE_HOOK.lock() = Some(Box::new(hook));
}

/// Unset and return the hook set with [`set_unraisable_hook`].
pub fn take_unraisable_hook() -> Option<UnraisableHook> {
    UNRAISABLE_HOOK.lock().take()
}

pub(crate) fn write_unraisable(context: &str, payload: &(dyn Any + Send)) {
    let error = UnraisableError {
        context: context.to_owned(),
        message: panic_str(payload).to_owned(),
    };
    let hook = UNRAISABLE_HOOK.lock();
    if let Some(hook) = &*hook {
        hook(&error);
    } else {
        tracing::error!("panic in {}: {}", error.context, error.message);
    }
}
