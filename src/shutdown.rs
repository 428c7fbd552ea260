//! Process shutdown: signal handling, then draining, cancelling and
//! disposing every outstanding query before idle connections are closed.

use crate::constants::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_FORCE_TIMEOUT, DRAIN_POLL_INTERVAL};
use crate::service::QueryExecutionService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Cloneable handle that resolves once shutdown begins.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|&v| v).await;
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Triggers shutdown and runs the query teardown sequence.
pub struct ShutdownController {
    /// Flips to `true` once.
    sender: watch::Sender<bool>,

    shutting_down: Arc<AtomicBool>,

    phase_sender: broadcast::Sender<ShutdownPhase>,

    /// How long running queries may keep going.
    drain_timeout: Duration,

    /// How long cancelled queries get to wind down.
    force_timeout: Duration,
}

/// Steps of the teardown sequence, broadcast as they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// `shutdown()` was called.
    Initiated,

    /// Waiting for running queries to finish.
    DrainingQueries,

    /// Cancelling queries that outlived the drain timeout.
    CancellingQueries,

    /// Releasing every query and its result buffer.
    DisposingQueries,

    /// Closing idle database connections.
    ClosingConnections,

    /// Teardown finished.
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Initiated => write!(f, "initiated"),
            ShutdownPhase::DrainingQueries => write!(f, "draining_queries"),
            ShutdownPhase::CancellingQueries => write!(f, "cancelling_queries"),
            ShutdownPhase::DisposingQueries => write!(f, "disposing_queries"),
            ShutdownPhase::ClosingConnections => write!(f, "closing_connections"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

impl ShutdownController {
    /// Controller using the default drain and force timeouts.
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_DRAIN_TIMEOUT, DEFAULT_FORCE_TIMEOUT)
    }

    pub fn with_timeouts(drain_timeout: Duration, force_timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        let (phase_sender, _) = broadcast::channel(16);

        Self {
            sender,
            shutting_down: Arc::new(AtomicBool::new(false)),
            phase_sender,
            drain_timeout,
            force_timeout,
        }
    }

    /// A new handle on the shutdown flag.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Phase notifications for embedders and tests; the binary only logs them.
    pub fn subscribe_phases(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Trigger shutdown. Only the first call has an effect.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown triggered");
            let _ = self.sender.send(true);
            let _ = self.phase_sender.send(ShutdownPhase::Initiated);
        }
    }

    fn notify_phase(&self, phase: ShutdownPhase) {
        info!(phase = %phase, "Shutdown phase");
        let _ = self.phase_sender.send(phase);
    }

    /// Perform graceful shutdown of the query service.
    ///
    /// 1. Waits for running queries to finish (up to `drain_timeout`)
    /// 2. Cancels the rest and gives them `force_timeout` to stop
    /// 3. Disposes every query, deleting its result buffer
    /// 4. Closes idle connections
    pub async fn graceful_shutdown(&self, service: &QueryExecutionService) {
        self.shutdown();

        self.notify_phase(ShutdownPhase::DrainingQueries);
        let drained = self.wait_for_queries(service, self.drain_timeout).await;

        if !drained {
            self.notify_phase(ShutdownPhase::CancellingQueries);
            let cancelled = service.cancel_all();
            warn!("Cancelled {} queries during shutdown", cancelled);
            self.wait_for_queries(service, self.force_timeout).await;
        }

        self.notify_phase(ShutdownPhase::DisposingQueries);
        let disposed = service.dispose_all();
        if disposed > 0 {
            info!("Disposed {} queries", disposed);
        }

        self.notify_phase(ShutdownPhase::ClosingConnections);
        service.connections().close_idle().await;

        self.notify_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown complete");
    }

    /// Poll until no query is running. Returns false on timeout.
    async fn wait_for_queries(&self, service: &QueryExecutionService, timeout: Duration) -> bool {
        let start = Instant::now();

        loop {
            let running = service.running_query_count();
            if running == 0 {
                info!("All queries drained");
                return true;
            }

            if start.elapsed() > timeout {
                warn!("Timeout exceeded with {} queries still running", running);
                return false;
            }

            info!("Waiting for {} running queries to complete...", running);
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(timeout)).await;
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn force_timeout(&self) -> Duration {
        self.force_timeout
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedShutdownController = Arc<ShutdownController>;

/// Shared controller with the given timeouts.
pub fn new_shutdown_controller_with_timeouts(
    drain_timeout: Duration,
    force_timeout: Duration,
) -> SharedShutdownController {
    Arc::new(ShutdownController::with_timeouts(drain_timeout, force_timeout))
}

/// Trigger `controller` on Ctrl+C, and on SIGTERM or SIGHUP under unix.
pub async fn install_signal_handlers(controller: SharedShutdownController) {
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
            controller.shutdown();
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let controller = controller.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Cannot install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                controller.shutdown();
            });
        }
    }
}

/// Teardown timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Timeout for draining running queries.
    pub drain_timeout: Duration,

    /// Timeout for cancelled queries to stop.
    pub force_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
        }
    }
}

impl ShutdownConfig {
    /// Read the timeouts from the environment:
    ///
    /// - `MSSQL_SHUTDOWN_DRAIN_TIMEOUT`: seconds (default: 30)
    /// - `MSSQL_SHUTDOWN_FORCE_TIMEOUT`: seconds (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup. Unparseable values keep
    /// the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ShutdownConfig::default();
        let seconds = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        if let Some(drain) = seconds("MSSQL_SHUTDOWN_DRAIN_TIMEOUT") {
            config.drain_timeout = drain;
        }
        if let Some(force) = seconds("MSSQL_SHUTDOWN_FORCE_TIMEOUT") {
            config.force_timeout = force;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let controller = ShutdownController::default();
        assert!(!controller.is_shutting_down());
        assert_eq!(controller.drain_timeout(), Duration::from_secs(30));
        assert_eq!(controller.force_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_shutdown_triggers_once() {
        let controller = ShutdownController::new();
        let handle = controller.signal();
        let mut phases = controller.subscribe_phases();

        assert!(!handle.is_shutdown());

        controller.shutdown();
        assert!(controller.is_shutting_down() && handle.is_shutdown());
        assert_eq!(phases.try_recv().unwrap(), ShutdownPhase::Initiated);

        controller.shutdown();
        assert!(phases.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_config_from_lookup() {
        let config = ShutdownConfig::from_lookup(|key| match key {
            "MSSQL_SHUTDOWN_DRAIN_TIMEOUT" => Some("5".to_string()),
            "MSSQL_SHUTDOWN_FORCE_TIMEOUT" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.force_timeout, DEFAULT_FORCE_TIMEOUT);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(ShutdownPhase::Initiated.to_string(), "initiated");
        assert_eq!(ShutdownPhase::DrainingQueries.to_string(), "draining_queries");
        assert_eq!(ShutdownPhase::CancellingQueries.to_string(), "cancelling_queries");
        assert_eq!(ShutdownPhase::DisposingQueries.to_string(), "disposing_queries");
        assert_eq!(ShutdownPhase::ClosingConnections.to_string(), "closing_connections");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }
}
