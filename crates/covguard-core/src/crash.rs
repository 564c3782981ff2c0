//! Panic capture for Rust hosts.
//!
//! [`install_panic_capture`] chains a panic hook that remembers where the
//! current thread panicked and its backtrace. [`guard`] runs a closure under
//! `catch_unwind` and turns a panic into a crash notification on the run
//! handle, then either absorbs it or resumes unwinding depending on
//! `proceedOnError`.

use crate::artifact::panic_message;
use crate::controller::RunHandle;
use crate::record::{ComponentDescriptor, ErrorInfo};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use tracing::debug;

struct PanicSite {
    location: Option<String>,
    backtrace: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the capturing hook. The previous hook still runs. Idempotent.
pub fn install_panic_capture() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let site = PanicSite {
                location: info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
                backtrace: Backtrace::force_capture().to_string(),
            };
            // Thread-local may already be torn down during thread exit.
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(site));
            previous(info);
        }));
        debug!("panic capture installed");
    });
}

fn take_panic_site() -> Option<PanicSite> {
    LAST_PANIC
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Build the crash description for a caught panic payload.
///
/// Uses the location and backtrace stashed by the capture hook when it is
/// installed; otherwise the trace is empty.
pub fn error_info_from_panic(payload: &(dyn Any + Send)) -> ErrorInfo {
    let message = panic_message(payload);
    let site = take_panic_site();
    let short = match site.as_ref().and_then(|s| s.location.as_deref()) {
        Some(location) => format!("panicked at {}: {}", location, message),
        None => format!("panicked: {}", message),
    };
    let stack = site.map(|s| s.backtrace).unwrap_or_default();
    ErrorInfo::new(short, Some(message), stack)
}

/// Describe a returned error, its `source()` chain included.
pub fn error_info_from_error(err: &(dyn std::error::Error + 'static)) -> ErrorInfo {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(format!("Caused by: {}", cause));
        current = cause.source();
    }
    let long = (!chain.is_empty()).then(|| chain.join("; "));
    ErrorInfo::new(err.to_string(), long, format!("{:?}", err))
}

/// Run `f`, reporting a panic as a crash from `source`.
///
/// Returns `Some` when `f` completes. On panic, the crash is recorded; if the
/// run proceeds on error the panic is absorbed and `None` is returned,
/// otherwise unwinding resumes with the original payload.
pub fn guard<R>(
    handle: &RunHandle,
    source: Option<ComponentDescriptor>,
    f: impl FnOnce() -> R,
) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let error = error_info_from_panic(&*payload);
            if handle.on_crash_notification(source, error) {
                None
            } else {
                panic::resume_unwind(payload)
            }
        }
    }
}
