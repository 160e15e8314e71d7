// crates/workshop-rescue/src/signals.rs
// ============================================================================
// Module: Shutdown Signals
// Description: Termination signal hooks that take the final snapshot.
// Purpose: Run a forced snapshot before the process exits on SIGINT/SIGTERM.
// Dependencies: signal-hook, tokio, tracing
// ============================================================================

//! ## Overview
//! [`install_signal_handlers`] registers interrupt and terminate listeners on
//! a dedicated thread driving a single-threaded tokio runtime. On the first
//! signal the manager shuts down (timer stopped, forced snapshot taken), the
//! caller's `before_exit` hook runs, and the signal's default disposition is
//! re-raised so the process terminates the way the signal requires.
//!
//! Installation happens at most once per process, whichever manager asks
//! first. The remote path is validated before anything is registered, so a
//! misconfigured deployment fails here without touching the network.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;

use serde::Serialize;
use tokio::runtime::Builder;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::manager::RescueError;
use crate::manager::RescueManager;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Name of the signal listener thread.
const SIGNAL_THREAD_NAME: &str = "workshop-rescue-signals";

/// Set once listeners run in this process; held while installing.
static SIGNAL_HOOKS: Mutex<bool> = Mutex::new(false);

// ============================================================================
// SECTION: Types
// ============================================================================

/// Signal that triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationSignal {
    /// SIGINT or Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl TerminationSignal {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
        }
    }

    /// Re-raises the signal with its default disposition.
    ///
    /// For interrupt and terminate this ends the process; it only returns
    /// when emulation failed or the platform has no such disposition.
    pub fn raise_default(self) {
        #[cfg(unix)]
        {
            let number = match self {
                Self::Interrupt => signal_hook::consts::SIGINT,
                Self::Terminate => signal_hook::consts::SIGTERM,
            };
            if let Err(err) = signal_hook::low_level::emulate_default_handler(number) {
                warn!(signal = self.as_str(), error = %err, "default signal disposition failed");
            }
        }
        #[cfg(not(unix))]
        debug!(signal = self.as_str(), "default signal disposition not emulated on this platform");
    }
}

/// Returns true once termination listeners run in this process.
#[must_use]
pub fn signal_handlers_installed() -> bool {
    *SIGNAL_HOOKS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registered listeners, waited on by the signal thread.
#[cfg(unix)]
struct Listeners {
    /// SIGINT stream.
    interrupt: tokio::signal::unix::Signal,
    /// SIGTERM stream.
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listeners {
    /// Registers both listeners. Must run inside the runtime context.
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the first signal.
    async fn wait(mut self) -> Option<TerminationSignal> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|()| TerminationSignal::Interrupt),
            received = self.terminate.recv() => received.map(|()| TerminationSignal::Terminate),
        }
    }
}

/// Registered listeners, waited on by the signal thread.
#[cfg(not(unix))]
struct Listeners;

#[cfg(not(unix))]
impl Listeners {
    /// Ctrl-C registers lazily on first poll.
    #[allow(clippy::unnecessary_wraps, reason = "Matches the unix registration signature.")]
    const fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    /// Waits for Ctrl-C.
    async fn wait(self) -> Option<TerminationSignal> {
        tokio::signal::ctrl_c().await.ok().map(|()| TerminationSignal::Interrupt)
    }
}

// ============================================================================
// SECTION: Installation
// ============================================================================

/// Installs termination hooks that run [`RescueManager::shutdown`], then
/// `before_exit`, then the signal's default disposition.
///
/// Returns `Ok(false)` when rescue is unconfigured or hooks were already
/// installed in this process.
///
/// # Errors
///
/// Returns [`RescueError::InvalidPath`] when the remote path is malformed and
/// [`RescueError::Runtime`] when the listener cannot be started.
pub fn install_signal_handlers<F>(
    manager: &Arc<RescueManager>,
    before_exit: F,
) -> Result<bool, RescueError>
where
    F: FnOnce(TerminationSignal) + Send + 'static,
{
    if !manager.is_configured() {
        debug!("signal hooks skipped: rescue not configured");
        return Ok(false);
    }
    manager.remote_path()?;
    let mut installed = SIGNAL_HOOKS.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        debug!("signal hooks already installed in this process");
        return Ok(false);
    }
    spawn_listener(Arc::clone(manager), before_exit)?;
    *installed = true;
    manager.note_signal_handlers();
    info!("shutdown snapshot hooks installed");
    Ok(true)
}

/// Builds the runtime, registers listeners, and starts the waiting thread.
fn spawn_listener<F>(manager: Arc<RescueManager>, before_exit: F) -> Result<(), RescueError>
where
    F: FnOnce(TerminationSignal) + Send + 'static,
{
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| RescueError::Runtime(err.to_string()))?;
    let listeners = {
        let _context = runtime.enter();
        Listeners::register().map_err(|err| RescueError::Runtime(err.to_string()))?
    };
    thread::Builder::new()
        .name(SIGNAL_THREAD_NAME.to_string())
        .spawn(move || {
            let Some(signal) = runtime.block_on(listeners.wait()) else {
                warn!("signal listener closed without a signal");
                return;
            };
            info!(signal = signal.as_str(), "termination signal received; taking final snapshot");
            manager.shutdown();
            before_exit(signal);
            drop(runtime);
            signal.raise_default();
        })
        .map(|_| ())
        .map_err(|err| RescueError::Runtime(err.to_string()))
}
