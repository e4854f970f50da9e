//! Turning cycle panics into errors.
//!
//! `catch_unwind` only yields the panic payload. The hook installed here
//! records a backtrace on the panicking thread first, so the recovered
//! error carries the stack of the panic site rather than of the catcher.

use crate::error::CycleError;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the backtrace-recording panic hook. Later calls do nothing.
///
/// The previous hook still runs, so panics are reported as before.
pub fn install_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Take the backtrace recorded by the most recent panic on this thread.
pub fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Best-effort text of a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Convert a caught panic into a cycle error.
pub fn into_cycle_error(payload: Box<dyn Any + Send>) -> CycleError {
    CycleError::Panic {
        message: payload_message(payload.as_ref()),
        backtrace: take_backtrace().unwrap_or_else(|| "<backtrace unavailable>".to_string()),
    }
}
