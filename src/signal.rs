//! Process-wide shutdown flag.
//!
//! The binary installs SIGINT/SIGTERM handlers once; the run loop polls
//! the flag and performs an orderly `stop_all` before exiting.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn install() {
    #[cfg(unix)]
    setup_unix_signal_handlers();
}

#[cfg(unix)]
fn setup_unix_signal_handlers() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| unsafe {
        install_sigaction();
    });
}

/// Uses sigaction with SA_RESTART so interrupted syscalls resume; the
/// handler only flips the atomic.
#[cfg(unix)]
unsafe fn install_sigaction() {
    extern "C" fn handler(_signum: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_RESTART;
        action.sa_sigaction = handler as usize;

        let mut empty_set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty_set as *mut libc::sigset_t);
        action.sa_mask = empty_set;

        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}
