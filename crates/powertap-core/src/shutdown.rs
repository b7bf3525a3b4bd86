//! Cooperative shutdown.
//!
//! A [`ShutdownState`] is created once per session and cloned into every
//! loop. Loops never block for longer than [`HEARTBEAT`] between checks of
//! [`ShutdownState::is_requested`], which bounds how long a shutdown request
//! takes to be observed.
//!
//! [`SignalCoordinator`] routes SIGINT, SIGTERM, SIGHUP and SIGQUIT into the
//! same state and the same callback. No signal gets special handling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{PowerError, Result};

/// Upper bound on any blocking wait inside a loop that must observe shutdown.
pub const HEARTBEAT: Duration = Duration::from_millis(100);

/// Why the session is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// A termination signal arrived.
    Signal,
    /// The requested run duration elapsed.
    Completed,
    /// The sample source ended or failed.
    SourceEnded,
    /// Requested programmatically.
    Requested,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Completed => write!(f, "completed"),
            Self::SourceEnded => write!(f, "source ended"),
            Self::Requested => write!(f, "requested"),
        }
    }
}

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    sealed: AtomicBool,
    cause: OnceLock<(ShutdownCause, Instant)>,
}

/// Shared shutdown flag. Set at most once; cloning shares the same flag.
#[derive(Clone, Default)]
pub struct ShutdownState {
    inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownState")
            .field("requested", &self.is_requested())
            .field("cause", &self.cause())
            .field("sealed", &!self.is_accepting())
            .finish()
    }
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the call that actually set
    /// the flag; later requests keep the first cause.
    pub fn request(&self, cause: ShutdownCause) -> bool {
        let first = self
            .inner
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            let _ = self.inner.cause.set((cause, Instant::now()));
            log::info!("shutdown requested ({cause})");
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.inner.cause.get().map(|(c, _)| *c)
    }

    /// Time since the first request, if any.
    pub fn since_request(&self) -> Option<Duration> {
        self.inner.cause.get().map(|(_, at)| at.elapsed())
    }

    /// Stop accepting samples. Called once persistence has been finalised.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    /// Whether new samples may still be recorded.
    pub fn is_accepting(&self) -> bool {
        !self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Sleep for up to `total`, waking at least every [`HEARTBEAT`] to check
    /// the flag. Returns `true` if shutdown was requested.
    pub fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_requested() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(HEARTBEAT));
        }
    }
}

// ---------------------------------------------------------------------------
// Signal coordinator
// ---------------------------------------------------------------------------

type Callback = Arc<dyn Fn(ShutdownCause) + Send + Sync>;

static QUIT_PENDING: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_quit(_: libc::c_int) {
    QUIT_PENDING.store(true, Ordering::SeqCst);
}

/// Installs identical handling for SIGINT, SIGTERM, SIGHUP and SIGQUIT.
///
/// SIGINT/SIGTERM/SIGHUP go through `ctrlc`. SIGQUIT gets an
/// async-signal-safe handler that only sets an atomic; a watcher thread turns
/// that into the same request and callback. The watcher is joined on drop.
///
/// Only one coordinator can be installed per process.
pub struct SignalCoordinator {
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl SignalCoordinator {
    pub fn install<F>(state: ShutdownState, callback: F) -> Result<Self>
    where
        F: Fn(ShutdownCause) + Send + Sync + 'static,
    {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(PowerError::Config(
                "signal handlers are already installed in this process".into(),
            ));
        }
        let callback: Callback = Arc::new(callback);

        let st = state.clone();
        let cb = Arc::clone(&callback);
        ctrlc::set_handler(move || {
            if st.request(ShutdownCause::Signal) {
                cb(ShutdownCause::Signal);
            }
        })
        .map_err(|e| PowerError::Io(std::io::Error::other(e)))?;

        install_quit_handler()?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let watcher = std::thread::Builder::new()
            .name("powertap-sigquit".into())
            .spawn(move || {
                let tick = HEARTBEAT / 5;
                while !stop_flag.load(Ordering::SeqCst) {
                    if QUIT_PENDING.swap(false, Ordering::SeqCst) && state.request(ShutdownCause::Signal) {
                        callback(ShutdownCause::Signal);
                    }
                    std::thread::sleep(tick);
                }
            })?;

        log::debug!("signal handlers installed (INT, TERM, HUP, QUIT)");
        Ok(Self {
            stop,
            watcher: Some(watcher),
        })
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.watcher.take() {
            let _ = h.join();
        }
    }
}

#[cfg(unix)]
fn install_quit_handler() -> Result<()> {
    // SAFETY: `on_quit` is an extern "C" fn that only stores to a static
    // atomic, which is async-signal-safe. The sigaction struct is zeroed and
    // its mask emptied before use.
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_quit as *const () as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGQUIT, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(PowerError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_quit_handler() -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_set_once() {
        let s = ShutdownState::new();
        assert!(!s.is_requested());
        assert!(s.request(ShutdownCause::Completed));
        assert!(!s.request(ShutdownCause::Signal));
        assert_eq!(s.cause(), Some(ShutdownCause::Completed));
        assert!(s.since_request().is_some());
    }

    #[test]
    fn clones_share_the_flag() {
        let a = ShutdownState::new();
        let b = a.clone();
        b.request(ShutdownCause::Requested);
        assert!(a.is_requested());
    }

    #[test]
    fn seal_stops_accepting() {
        let s = ShutdownState::new();
        assert!(s.is_accepting());
        s.seal();
        assert!(!s.is_accepting());
    }

    #[test]
    fn sleep_wakes_within_a_heartbeat() {
        let s = ShutdownState::new();
        let other = s.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            other.request(ShutdownCause::Requested);
        });
        let start = Instant::now();
        assert!(s.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(50) + HEARTBEAT + Duration::from_millis(100));
        h.join().unwrap();
    }

    #[test]
    fn sleep_times_out_without_request() {
        let s = ShutdownState::new();
        assert!(!s.sleep(Duration::from_millis(20)));
    }
}
