//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action). The
//! caller (`main.rs`) executes the I/O implied by each action. Models the
//! host lifecycle around the core (spec.md §5 "Graceful shutdown"); the
//! core itself (`Executor`) only tracks in-flight streams, not process
//! lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Runtime metrics tracked while the service is running.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Number of requests currently being processed. Used for drain
    /// coordination: on shutdown, the service waits until this reaches 0
    /// (or the drain deadline expires) before exiting.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Service states.
///
/// Fields marked `dead_code` are structurally required by state transitions
/// (used in match arms for destructuring/reconstruction) but never read
/// independently.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config, constructing the pool and executor.
    Initializing,
    /// Binding the proxy and admin HTTP listeners.
    Starting { listen_addr: SocketAddr },
    /// Accepting and proxying requests.
    Running {
        listen_addr: SocketAddr,
        metrics: ServiceMetrics,
    },
    /// Graceful shutdown, finishing in-flight requests.
    Draining {
        pending_requests: u32,
        deadline: Instant,
    },
    /// Terminal state.
    Stopped { exit_code: i32 },
    /// Recoverable startup error with retry.
    Error {
        error: String,
        retries: u32,
        listen_addr: SocketAddr,
    },
}

/// Events that drive state transitions.
///
/// Some variants are only constructed in tests (e.g. `ShutdownSignal`,
/// `DrainTimeout`, `RequestCompleted`); the caller (`main.rs`) delegates
/// some of these concerns to axum's built-in mechanisms instead.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceEvent {
    /// Configuration parsed, pool and executor constructed.
    Initialized { listen_addr: SocketAddr },
    /// Startup failed (bad config, pool construction error).
    StartupError(String),
    /// HTTP listener bound and ready.
    ListenerReady,
    /// Incoming HTTP request.
    RequestReceived { request_id: String },
    /// Request finished (success or error).
    RequestCompleted {
        request_id: String,
        duration: Duration,
        error: Option<String>,
    },
    /// SIGTERM/SIGINT received.
    ShutdownSignal,
    /// Drain deadline exceeded.
    DrainTimeout,
    /// Startup retry backoff expired.
    RetryTimer,
}

/// Actions the caller should execute after a state transition.
#[derive(Debug)]
pub enum ServiceAction {
    /// Bind the HTTP listeners and start serving.
    StartListener { addr: SocketAddr },
    /// Set a retry timer before attempting startup again.
    ScheduleRetry { delay: Duration },
    /// Exit the process.
    Shutdown { exit_code: i32 },
    /// No-op.
    None,
}

/// Maximum startup retries before giving up.
const MAX_STARTUP_RETRIES: u32 = 5;

/// Drain timeout duration (spec.md §5: "bounded by a drain timeout, e.g. 5s").
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        (ServiceState::Initializing, ServiceEvent::Initialized { listen_addr }) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (ServiceState::Initializing, ServiceEvent::StartupError(e)) => (
            ServiceState::Error {
                error: e,
                retries: 0,
                listen_addr: "0.0.0.0:0".parse().unwrap(),
            },
            ServiceAction::ScheduleRetry {
                delay: Duration::from_secs(1),
            },
        ),

        (
            ServiceState::Error {
                retries,
                listen_addr,
                ..
            },
            ServiceEvent::RetryTimer,
        ) if retries < MAX_STARTUP_RETRIES => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (ServiceState::Error { .. }, ServiceEvent::RetryTimer) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => (
            ServiceState::Running {
                listen_addr,
                metrics: ServiceMetrics::new(),
            },
            ServiceAction::None,
        ),

        (
            ServiceState::Running { .. },
            ServiceEvent::RequestReceived { .. } | ServiceEvent::RequestCompleted { .. },
        ) => {
            // Request tracking is handled by AppState's atomic counters; the
            // state machine stays in Running. This arm exists only so these
            // events don't fall through to the catch-all.
            unreachable!(
                "RequestReceived/RequestCompleted are tracked by AppState, not the state machine"
            )
        }

        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            (
                ServiceState::Draining {
                    pending_requests: 0,
                    deadline,
                },
                ServiceAction::None,
            )
        }

        (
            ServiceState::Draining {
                pending_requests: 0,
                ..
            },
            ServiceEvent::RequestCompleted { .. },
        ) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        (ServiceState::Draining { .. }, ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        (state, _event) => (state, ServiceAction::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn init_to_starting_on_initialized() {
        let (state, action) = handle_event(
            ServiceState::Initializing,
            ServiceEvent::Initialized {
                listen_addr: localhost_addr(),
            },
        );
        assert!(matches!(state, ServiceState::Starting { .. }));
        assert!(matches!(action, ServiceAction::StartListener { .. }));
    }

    #[test]
    fn startup_error_schedules_retry() {
        let (state, action) = handle_event(
            ServiceState::Initializing,
            ServiceEvent::StartupError("bad config".into()),
        );
        assert!(matches!(state, ServiceState::Error { retries: 0, .. }));
        assert!(matches!(action, ServiceAction::ScheduleRetry { .. }));
    }

    #[test]
    fn max_retries_stops_service() {
        let (state, action) = handle_event(
            ServiceState::Error {
                error: "still broken".into(),
                retries: MAX_STARTUP_RETRIES,
                listen_addr: localhost_addr(),
            },
            ServiceEvent::RetryTimer,
        );
        assert!(matches!(state, ServiceState::Stopped { exit_code: 1 }));
        assert!(matches!(action, ServiceAction::Shutdown { exit_code: 1 }));
    }

    #[test]
    fn starting_to_running_on_listener_ready() {
        let (state, action) = handle_event(
            ServiceState::Starting {
                listen_addr: localhost_addr(),
            },
            ServiceEvent::ListenerReady,
        );
        assert!(matches!(state, ServiceState::Running { .. }));
        assert!(matches!(action, ServiceAction::None));
    }

    #[test]
    fn running_to_draining_on_shutdown() {
        let (state, action) = handle_event(
            ServiceState::Running {
                listen_addr: localhost_addr(),
                metrics: ServiceMetrics::new(),
            },
            ServiceEvent::ShutdownSignal,
        );
        assert!(matches!(state, ServiceState::Draining { .. }));
        assert!(matches!(action, ServiceAction::None));
    }

    #[test]
    fn draining_stops_on_drain_timeout() {
        let (state, action) = handle_event(
            ServiceState::Draining {
                pending_requests: 3,
                deadline: Instant::now(),
            },
            ServiceEvent::DrainTimeout,
        );
        assert!(matches!(state, ServiceState::Stopped { exit_code: 0 }));
        assert!(matches!(action, ServiceAction::Shutdown { exit_code: 0 }));
    }

    #[test]
    fn draining_stops_when_no_pending_requests() {
        let (state, action) = handle_event(
            ServiceState::Draining {
                pending_requests: 0,
                deadline: Instant::now() + Duration::from_secs(5),
            },
            ServiceEvent::RequestCompleted {
                request_id: "req_test".into(),
                duration: Duration::from_millis(50),
                error: None,
            },
        );
        assert!(matches!(state, ServiceState::Stopped { exit_code: 0 }));
        assert!(matches!(action, ServiceAction::Shutdown { exit_code: 0 }));
    }

    #[test]
    fn any_state_shutdown_signal_stops() {
        let (state, action) = handle_event(
            ServiceState::Starting {
                listen_addr: localhost_addr(),
            },
            ServiceEvent::ShutdownSignal,
        );
        assert!(matches!(state, ServiceState::Stopped { exit_code: 0 }));
        assert!(matches!(action, ServiceAction::Shutdown { exit_code: 0 }));
    }

    #[test]
    fn service_metrics_initializes_in_flight_at_zero() {
        let metrics = ServiceMetrics::new();
        assert_eq!(
            metrics.in_flight.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
        assert_eq!(
            metrics
                .requests_total
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
        assert_eq!(
            metrics
                .errors_total
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }
}
