//! Background reconnect task for long-lived sessions.

use crate::DataLinkError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A link the watchdog can bring back up.
#[async_trait]
pub trait Reconnect: Send + Sync + 'static {
    /// True while the link is down and has not been closed on purpose.
    fn needs_reconnect(&self) -> bool;

    async fn reconnect(&self) -> Result<(), DataLinkError>;
}

/// Owns the reconnect task of one session.
///
/// The task wakes on [`Watchdog::signal`] or every `period`, and attempts a
/// reconnect only when the target reports it is down and at least `period`
/// has passed since its previous attempt. It stops on [`Watchdog::shutdown`]
/// or when the watchdog is dropped.
#[derive(Debug)]
pub struct Watchdog {
    signal: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Spawn the reconnect task. Must be called from within a tokio runtime.
    pub fn spawn(target: Arc<dyn Reconnect>, period: Duration, name: impl Into<String>) -> Self {
        let signal = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            target,
            Arc::clone(&signal),
            shutdown_rx,
            period,
            name.into(),
        ));
        Self {
            signal,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Wake the task now instead of at the end of its period.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(
    target: Arc<dyn Reconnect>,
    signal: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    name: String,
) {
    let mut last_attempt: Option<Instant> = None;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = signal.notified() => {}
            _ = tokio::time::sleep(period) => {}
        }

        if !target.needs_reconnect() {
            continue;
        }

        if let Some(last) = last_attempt {
            let next = last + period;
            if Instant::now() < next {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(next) => {}
                }
                if !target.needs_reconnect() {
                    continue;
                }
            }
        }

        last_attempt = Some(Instant::now());
        match target.reconnect().await {
            Ok(()) => info!(session = %name, "modbus session reconnected"),
            Err(err) => warn!(session = %name, error = %err, "modbus session reconnect failed"),
        }
    }
    debug!(session = %name, "reconnect watchdog stopped");
}
