//! Ctrl-C handling
//!
//! The first interrupt cancels the running reconcile or teardown so it
//! stops dispatching and still prints its report. A second one kills the
//! process the usual way.

use declarative::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const POLL: Duration = Duration::from_millis(100);

/// Cancel `token` when the user interrupts the process
pub fn watch(token: &CancelToken) {
    install();
    watch_flag(&INTERRUPTED, token);
}

fn watch_flag(flag: &'static AtomicBool, token: &CancelToken) {
    let token = token.clone();
    std::thread::spawn(move || {
        while !token.is_cancelled() {
            if flag.load(Ordering::SeqCst) {
                log::warn!("Interrupted, finishing in-flight work");
                token.cancel();
                break;
            }
            std::thread::sleep(POLL);
        }
    });
}

#[cfg(unix)]
fn install() {
    use std::sync::Once;

    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: the handler only touches an atomic and calls signal(2),
        // both async-signal-safe
        let handler = on_interrupt as extern "C" fn(libc::c_int);
        let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            log::debug!("Could not install the interrupt handler");
        }
    });
}

#[cfg(not(unix))]
fn install() {}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: restoring the default disposition is async-signal-safe
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}
