//! Cooperative cancellation: a process-terminate request sets a flag
//! observed at every blocking boundary instead of unwinding via a
//! signal-handler exception.

use std::sync::atomic::AtomicBool;

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_terminate(_signum: libc::c_int) {
    CANCEL_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Installs handlers for `SIGTERM`/`SIGINT` that only set a flag; callers
/// obtain the flag itself via [`flag`].
pub fn install() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_terminate as libc::sighandler_t);
    }
}

/// The process-wide cancellation flag, checked at every blocking boundary
/// in the orchestrator and in each scheduler backend's polling loop.
pub fn flag() -> &'static AtomicBool {
    &CANCEL_REQUESTED
}
