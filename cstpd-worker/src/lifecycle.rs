//! Signal handling and the authentication watchdog.
//!
//! Signal handlers only store a flag; the worker samples it at the top
//! of its loops. The watchdog is the one hard deadline in the worker's
//! life: it fires only while the client is unauthenticated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::error;

/// Termination flag shared with the signal handler.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination. Safe to call from a signal context.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether termination has been requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Installs TERM/INT handlers that store into the returned flag and do
/// nothing else.
pub fn install_signal_handlers() -> anyhow::Result<ShutdownFlag> {
    let flag = ShutdownFlag::new();
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || handler_flag.set())?;
    Ok(flag)
}

/// The authentication timeout.
///
/// Arms a hard deadline for the unauthenticated control phase; firing
/// exits the process unconditionally. Dropping the watchdog disarms it,
/// which happens the moment cookie authentication succeeds.
pub struct AuthWatchdog {
    _disarm: DropGuard,
}

impl AuthWatchdog {
    /// Arms the watchdog for `timeout`.
    pub fn arm(timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    error!("client did not authenticate in time");
                    std::process::exit(1);
                }
            }
        });

        Self {
            _disarm: token.drop_guard(),
        }
    }
}
