//! Supervisor: owns the lifecycle of the poll loop, the schedule expander,
//! and the HTTP API, and propagates OS signals to them. Generalises
//! `main.rs`'s plain `tokio::spawn` composition of the background poller
//! alongside `axum::serve`, since this service additionally needs to
//! restart the HTTP listener independently of the other two.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared shutdown/restart signaling for the three supervised activities.
#[derive(Clone)]
pub struct Supervisor {
    pub cancel: CancellationToken,
    /// Fired on SIGHUP: the API server should tear down its listener and
    /// rebuild it, without disturbing the poller or expander.
    pub restart_api: Arc<Notify>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            restart_api: Arc::new(Notify::new()),
            shutdown_timeout,
        }
    }

    /// Spawn the background task that listens for process signals:
    /// SIGINT/SIGTERM trigger a full graceful shutdown; SIGHUP (unix only)
    /// requests an API-server-only restart and keeps running.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let restart_api = self.restart_api.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
                let mut sighup =
                    signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, shutting down");
                            break;
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, shutting down");
                            break;
                        }
                        _ = sighup.recv() => {
                            tracing::info!("received SIGHUP, restarting API server only");
                            restart_api.notify_one();
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("received ctrl-c, shutting down");
            }

            cancel.cancel();
        })
    }

    /// Wait for the poller and expander tasks to finish, up to the
    /// configured shutdown budget. Tasks still running past the budget are
    /// abandoned — their next store write will fail cleanly against a
    /// closed pool rather than corrupt state.
    pub async fn wait_for_background_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        let joined = futures::future::join_all(tasks);
        match tokio::time::timeout(self.shutdown_timeout, joined).await {
            Ok(_) => tracing::info!("background tasks shut down cleanly"),
            Err(_) => tracing::warn!(
                "shutdown budget of {:?} exceeded; abandoning in-flight work",
                self.shutdown_timeout
            ),
        }
    }
}
