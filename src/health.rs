//! Aggregate health monitoring.
//!
//! ## Responsibility
//! Produce a point-in-time [`HealthReport`] over the backend, the memory
//! monitor, the response cache, and the circuit breaker — on demand via
//! [`HealthMonitor::check`] or periodically via [`HealthMonitor::start`].
//!
//! ## Guarantees
//! - Bounded: every subsystem probe is capped by the probe timeout; an
//!   overrunning probe is reported unhealthy instead of hanging the check
//! - Non-intrusive: the backend probe goes through
//!   [`CircuitBreaker::probe`] and never counts toward its threshold
//! - Fresh: reports are built whole on each poll, never partially updated
//!
//! ## NOT Responsible For
//! - Recovery actions (see: governor.rs pressure reactions)
//! - Liveness of the governor's own background tasks

use crate::backend::InferenceBackend;
use crate::resilience::{CircuitBreaker, CircuitStatus, ResponseCache};
use crate::resource::ResourceMonitor;
use crate::GovernorError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health of a single subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemHealth {
    /// Whether the subsystem passed its check.
    pub healthy: bool,
    /// Human-readable detail.
    pub message: String,
}

impl SubsystemHealth {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    fn failing(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Aggregate health view, generated fresh on each poll.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// True iff no subsystem reports unhealthy.
    pub healthy: bool,
    /// Backend reachability (probed through the circuit breaker).
    pub backend: SubsystemHealth,
    /// Memory snapshot freshness and probe state.
    pub memory: SubsystemHealth,
    /// Cache occupancy detail.
    pub cache: SubsystemHealth,
    /// Circuit breaker state.
    pub circuit: SubsystemHealth,
    /// When this report was generated.
    pub checked_at: SystemTime,
}

impl HealthReport {
    /// One-line status summary for logs.
    pub fn format_status(&self) -> String {
        format!(
            "overall={} backend={} memory={} cache={} circuit={}",
            self.healthy,
            self.backend.healthy,
            self.memory.healthy,
            self.cache.healthy,
            self.circuit.healthy,
        )
    }
}

/// Handle to a running periodic health checker.
#[derive(Debug)]
pub struct HealthHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    /// Signal shutdown and wait for the checker to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Periodic aggregate health view over backend + cache + resource state.
pub struct HealthMonitor {
    backend: Arc<dyn InferenceBackend>,
    breaker: CircuitBreaker,
    monitor: Arc<ResourceMonitor>,
    cache: ResponseCache,
    probe_timeout: Duration,
    staleness_bound: Duration,
    latest: RwLock<Option<HealthReport>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("probe_timeout", &self.probe_timeout)
            .field("staleness_bound", &self.staleness_bound)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a health monitor over the governor's components.
    ///
    /// `staleness_bound` is the maximum age of the latest memory snapshot
    /// before the memory subsystem reports unhealthy.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        breaker: CircuitBreaker,
        monitor: Arc<ResourceMonitor>,
        cache: ResponseCache,
        probe_timeout: Duration,
        staleness_bound: Duration,
    ) -> Self {
        Self {
            backend,
            breaker,
            monitor,
            cache,
            probe_timeout,
            staleness_bound,
            latest: RwLock::new(None),
        }
    }

    /// Run one full health check now.
    pub async fn check(&self) -> HealthReport {
        let backend = self.check_backend().await;
        let memory = self.check_memory();
        let cache = self.check_cache().await;
        let circuit = self.check_circuit().await;

        let report = HealthReport {
            healthy: backend.healthy && memory.healthy && cache.healthy && circuit.healthy,
            backend,
            memory,
            cache,
            circuit,
            checked_at: SystemTime::now(),
        };

        *self.latest.write().await = Some(report.clone());
        report
    }

    /// The most recent report produced by [`HealthMonitor::check`].
    pub async fn latest(&self) -> Option<HealthReport> {
        self.latest.read().await.clone()
    }

    async fn check_backend(&self) -> SubsystemHealth {
        let backend = Arc::clone(&self.backend);
        let probe = self
            .breaker
            .probe(move || async move { backend.probe().await });

        match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(())) => SubsystemHealth::ok("backend reachable"),
            Ok(Err(GovernorError::CircuitOpen)) => {
                SubsystemHealth::failing("circuit open; probe skipped")
            }
            Ok(Err(e)) => SubsystemHealth::failing(format!("probe failed: {e}")),
            Err(_) => SubsystemHealth::failing(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    fn check_memory(&self) -> SubsystemHealth {
        let Some(snapshot) = self.monitor.latest() else {
            return SubsystemHealth::failing("no memory sample recorded yet");
        };
        if self.monitor.is_degraded() {
            return SubsystemHealth::failing(format!(
                "last probe failed; retained snapshot is {}s old",
                snapshot.age().as_secs()
            ));
        }
        if snapshot.age() > self.staleness_bound {
            return SubsystemHealth::failing(format!(
                "snapshot stale: {}s old (bound {}s)",
                snapshot.age().as_secs(),
                self.staleness_bound.as_secs()
            ));
        }
        SubsystemHealth::ok(format!(
            "{:.1}% used, trend {}",
            snapshot.percent_used,
            self.monitor.pressure_trend()
        ))
    }

    async fn check_cache(&self) -> SubsystemHealth {
        let stats = self.cache.stats().await;
        // A full cache is normal steady state, not a failure.
        SubsystemHealth::ok(format!(
            "occupancy {:.2} ({}/{} entries, {} in flight)",
            stats.occupancy_ratio(),
            stats.entries,
            stats.capacity,
            stats.in_flight
        ))
    }

    async fn check_circuit(&self) -> SubsystemHealth {
        match self.breaker.status().await {
            CircuitStatus::Closed => SubsystemHealth::ok("closed"),
            CircuitStatus::HalfOpen => SubsystemHealth::ok("half-open (probing recovery)"),
            CircuitStatus::Open => SubsystemHealth::failing("open"),
        }
    }

    /// Spawn a periodic checker that refreshes [`HealthMonitor::latest`]
    /// and logs state changes.
    pub fn start(self: &Arc<Self>, interval: Duration) -> HealthHandle {
        let health = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut was_healthy = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = health.check().await;
                        if report.healthy != was_healthy {
                            if report.healthy {
                                info!(status = %report.format_status(), "health recovered");
                            } else {
                                warn!(status = %report.format_status(), "health degraded");
                            }
                            was_healthy = report.healthy;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("health monitor shutdown signal received");
                        break;
                    }
                }
            }
        });

        HealthHandle { shutdown_tx, task }
    }
}
