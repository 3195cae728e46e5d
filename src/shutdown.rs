//! Cooperative shutdown
//!
//! Both workers poll one shared stop flag between packets/events. SIGINT and
//! SIGQUIT set the flag and rearm the default disposition, so a second
//! identical signal terminates the process the usual way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static STOP_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Install the signal handlers. The flag is shared with the worker threads.
pub fn install(flag: Arc<AtomicBool>) {
    let _ = STOP_FLAG.set(flag);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handle_signal as libc::sighandler_t);
    }
}

// Only async-signal-safe operations here: an atomic store and signal(2).
extern "C" fn handle_signal(signum: libc::c_int) {
    if let Some(flag) = STOP_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        install(flag.clone());
        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
