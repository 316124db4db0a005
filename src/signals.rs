//! Forwards SIGINT/SIGTERM to a run's [`CancelToken`].
//!
//! Scripts run in their own process group, so a terminal Ctrl-C only reaches
//! scripthub itself. While an [`InterruptGuard`] is alive those signals cancel
//! the run instead of killing the process, which lets the engine terminate the
//! script group and still record the run.

use crate::engine::CancelToken;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WATCH_INTERVAL: Duration = Duration::from_millis(20);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub struct InterruptGuard {
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl InterruptGuard {
    pub fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

/// Installs the handlers and starts a watcher that cancels `token` on the
/// first signal. Default dispositions come back when the guard is dropped.
pub fn cancel_on_interrupt(token: CancelToken) -> InterruptGuard {
    INTERRUPTED.store(false, Ordering::SeqCst);
    install();

    let stop = Arc::new(AtomicBool::new(false));
    let watcher = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if INTERRUPTED.load(Ordering::SeqCst) {
                    tracing::warn!("interrupt received, cancelling run");
                    token.cancel();
                    return;
                }
                thread::sleep(WATCH_INTERVAL);
            }
        })
    };

    InterruptGuard {
        stop,
        watcher: Some(watcher),
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        restore();
    }
}

#[cfg(unix)]
const FORWARDED: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in FORWARDED {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe {
            libc::signal(signal, handler);
        }
    }
}

#[cfg(unix)]
fn restore() {
    for signal in FORWARDED {
        // SAFETY: resetting to the default disposition has no preconditions.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}

#[cfg(not(unix))]
fn install() {}

#[cfg(not(unix))]
fn restore() {}
