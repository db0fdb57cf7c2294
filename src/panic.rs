//! Panic recovery at task boundaries.
//!
//! A process-wide panic hook records the message, location and a backtrace of the panicking
//! thread while that thread is inside [`catch`]. Panics raised anywhere else are forwarded to
//! the previously installed hook untouched.

use crate::error::Error;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future as StdFuture;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use tracing::debug;

static HOOK_INSTALL: Once = Once::new();

thread_local! {
  static CAPTURE_DEPTH: Cell<usize> = const { Cell::new(0) };
  static LAST_CAPTURE: RefCell<Option<PanicCapture>> = const { RefCell::new(None) };
}

/// A panic recovered at a task boundary.
#[derive(Debug)]
pub(crate) struct PanicCapture {
  message: String,
  location: Option<String>,
  backtrace: Backtrace,
}

impl PanicCapture {
  pub(crate) fn message(&self) -> &str {
    &self.message
  }

  pub(crate) fn into_error(self) -> Error {
    let message = match self.location {
      Some(location) => format!("{} (at {})", self.message, location),
      None => self.message,
    };
    Error::Panicked {
      message,
      stack: Arc::new(self.backtrace),
    }
  }
}

fn install_hook() {
  HOOK_INSTALL.call_once(|| {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
      if CAPTURE_DEPTH.with(Cell::get) == 0 {
        previous(info);
        return;
      }
      let capture = PanicCapture {
        message: payload_message(info.payload()),
        location: info.location().map(ToString::to_string),
        backtrace: Backtrace::force_capture(),
      };
      // The body may still handle this panic itself, so it is only visible here.
      debug!(location = ?capture.location, "Panic raised inside a task boundary: {}", capture.message);
      LAST_CAPTURE.with(|slot| *slot.borrow_mut() = Some(capture));
    }));
  });
}

/// Marks the current thread as capturing for the guard's lifetime. Nests.
struct CaptureGuard;

impl CaptureGuard {
  fn enter() -> Self {
    CAPTURE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    CaptureGuard
  }
}

impl Drop for CaptureGuard {
  fn drop(&mut self) {
    CAPTURE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
  }
}

pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "Box<dyn Any>".to_string()
  }
}

/// Pairs the unwinding payload with the hook's record of it. A record left over from a panic
/// the body handled itself, or a payload re-raised with `resume_unwind`, does not match.
fn take_capture(payload: Box<dyn Any + Send>) -> PanicCapture {
  let message = payload_message(&*payload);
  match LAST_CAPTURE.with(|slot| slot.borrow_mut().take()) {
    Some(capture) if capture.message == message => capture,
    _ => PanicCapture {
      message,
      location: None,
      backtrace: Backtrace::disabled(),
    },
  }
}

fn clear_capture() {
  LAST_CAPTURE.with(|slot| slot.borrow_mut().take());
}

/// Runs `f`, converting a panic into a [`PanicCapture`].
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, PanicCapture> {
  install_hook();
  let _guard = CaptureGuard::enter();
  clear_capture();
  panic::catch_unwind(AssertUnwindSafe(f)).map_err(take_capture)
}

/// Future adapter that recovers panics raised while polling the inner future.
pub(crate) struct CatchPanic<F> {
  inner: Pin<Box<F>>,
}

impl<F: StdFuture> CatchPanic<F> {
  pub(crate) fn new(inner: F) -> Self {
    Self { inner: Box::pin(inner) }
  }
}

impl<F: StdFuture> StdFuture for CatchPanic<F> {
  type Output = Result<F::Output, PanicCapture>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let inner = &mut self.inner;
    match catch(|| inner.as_mut().poll(cx)) {
      Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
      Ok(Poll::Pending) => Poll::Pending,
      Err(capture) => Poll::Ready(Err(capture)),
    }
  }
}
