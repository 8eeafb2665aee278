//! Handler panic capture.
//!
//! `catch_unwind` gives the payload but not where the panic happened. A
//! process-wide panic hook records the location and a backtrace into a
//! thread-local while a handler call is being guarded; outside guarded calls
//! the previous hook runs unchanged.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !GUARDED.with(Cell::get) {
                previous(info);
                return;
            }
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let trace = format!("panicked at {location}\n{}", Backtrace::force_capture());
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(trace));
        }));
    });
}

/// A panic caught inside a guarded call.
#[derive(Debug, Clone)]
pub(crate) struct CaughtPanic {
    /// The panic message.
    pub message: String,
    /// Location plus backtrace.
    pub debug: String,
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `f`, turning a panic into [`CaughtPanic`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, CaughtPanic> {
    install_hook();
    let was_guarded = GUARDED.with(|g| g.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARDED.with(|g| g.set(was_guarded));

    result.map_err(|payload| CaughtPanic {
        message: payload_message(payload.as_ref()),
        debug: LAST_PANIC
            .with(|last| last.borrow_mut().take())
            .unwrap_or_default(),
    })
}
