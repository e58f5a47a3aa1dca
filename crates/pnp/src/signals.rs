//! Termination requests
//!
//! [`OsSignals`] turns SIGINT, SIGTERM and SIGHUP into a [`Signal`]; the
//! listeners are installed by [`OsSignals::register`], so a signal delivered
//! any time after registration is kept until the orchestrator waits for it.
//! [`shutdown_channel`] provides the same contract for programmatic shutdown.

use std::fmt;
use std::future::Future;
use tokio::sync::watch;

/// Why the orchestrator was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT or Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Hangup,
    /// [`ShutdownTrigger::trigger`]
    Requested,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Hangup => "SIGHUP",
            Signal::Requested => "shutdown request",
        };
        f.write_str(name)
    }
}

/// Source of termination requests
pub trait TerminationSource {
    /// Wait until termination is requested
    fn recv(&mut self) -> impl Future<Output = Signal> + Send;
}

/// Process signal listeners
#[cfg(unix)]
pub struct OsSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignals {
    /// Install the listeners; must be called from within a Tokio runtime
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }
}

#[cfg(unix)]
impl TerminationSource for OsSignals {
    fn recv(&mut self) -> impl Future<Output = Signal> + Send {
        async move {
            tokio::select! {
                _ = self.sigint.recv() => Signal::Interrupt,
                _ = self.sigterm.recv() => Signal::Terminate,
                _ = self.sighup.recv() => Signal::Hangup,
            }
        }
    }
}

/// Process signal listeners
#[cfg(not(unix))]
pub struct OsSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl OsSignals {
    /// Install the listeners; must be called from within a Tokio runtime
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }
}

#[cfg(not(unix))]
impl TerminationSource for OsSignals {
    fn recv(&mut self) -> impl Future<Output = Signal> + Send {
        async move {
            self.ctrl_c.recv().await;
            Signal::Interrupt
        }
    }
}

/// Requests termination of a running orchestrator
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request termination; repeated calls have no further effect
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving end of [`ShutdownTrigger`]
#[derive(Debug)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl TerminationSource for ShutdownListener {
    fn recv(&mut self) -> impl Future<Output = Signal> + Send {
        async move {
            let closed = self.rx.wait_for(|requested| *requested).await.is_err();
            if closed {
                // Every trigger dropped without firing: nobody can ask any more
                std::future::pending::<()>().await;
            }
            Signal::Requested
        }
    }
}

/// Create a programmatic termination source
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownListener { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_before_wait_is_kept() {
        let (trigger, mut listener) = shutdown_channel();
        trigger.trigger();

        let signal = with_timeout(DEFAULT_TEST_TIMEOUT, listener.recv()).await;
        assert_eq!(signal.unwrap(), Signal::Requested);
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let (trigger, mut listener) = shutdown_channel();
        trigger.trigger();
        trigger.trigger();

        assert_eq!(listener.recv().await, Signal::Requested);
        // Still requested on a second wait
        assert_eq!(listener.recv().await, Signal::Requested);
    }

    #[tokio::test]
    async fn test_no_trigger_keeps_waiting() {
        let (_trigger, mut listener) = shutdown_channel();
        let result = with_timeout(Duration::from_millis(20), listener.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, mut listener) = shutdown_channel();
        drop(trigger);

        let result = with_timeout(Duration::from_millis(20), listener.recv()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
        assert_eq!(Signal::Hangup.to_string(), "SIGHUP");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_signals_register() {
        assert!(OsSignals::register().is_ok());
    }
}
