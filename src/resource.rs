//! System memory monitoring.
//!
//! ## Responsibility
//! Sample host memory on a fixed interval, retain a bounded ring of
//! snapshots, and derive a pressure trend over the retained window.
//! Published snapshots drive the governor's asynchronous pressure
//! reactions (cache shrink, tier degradation).
//!
//! ## Guarantees
//! - Single-writer: only the sampling tick mutates the ring
//! - Non-terminating: a failed probe retains the previous snapshot, sets a
//!   degraded flag, and retries on the next tick
//! - Cancellable: the background task stops via its [`MonitorHandle`]
//!
//! ## NOT Responsible For
//! - Reacting to pressure (see: governor.rs)
//! - Tier decisions (see: tier.rs)

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A probe failure. Transient by contract: the monitor logs it and retries
/// on the next tick.
#[derive(Debug, Error)]
#[error("memory probe failed: {0}")]
pub struct ProbeError(
    /// Human-readable cause.
    pub String,
);

/// Host memory accounting boundary.
///
/// Implementations must be cheap and non-blocking; they are called on every
/// sampling tick. Tests inject deterministic probes through this trait.
pub trait MemoryProbe: Send {
    /// Return `(used_bytes, total_bytes)` for the host.
    fn current_memory(&mut self) -> Result<(u64, u64), ProbeError>;
}

/// Production probe backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: sysinfo::System,
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe").finish_non_exhaustive()
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    /// Create a probe that refreshes memory counters only.
    pub fn new() -> Self {
        let system = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::new()
                .with_memory(sysinfo::MemoryRefreshKind::everything()),
        );
        Self { system }
    }
}

impl MemoryProbe for SysinfoProbe {
    fn current_memory(&mut self) -> Result<(u64, u64), ProbeError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError("host reports zero total memory".to_string()));
        }
        Ok((self.system.used_memory(), total))
    }
}

/// A point-in-time memory reading. Superseded by the next sample, never
/// mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySnapshot {
    /// Bytes in use.
    pub used_bytes: u64,
    /// Total bytes on the host.
    pub total_bytes: u64,
    /// `used / total` as a percentage, clamped to [0,100].
    pub percent_used: f64,
    /// Strictly increasing sample counter. Backs the ordering invariant
    /// even when the wall clock has coarse resolution.
    pub seq: u64,
    /// Wall-clock time the sample was taken.
    pub taken_at: SystemTime,
}

impl MemorySnapshot {
    /// Age of this snapshot, saturating to zero on clock skew.
    pub fn age(&self) -> Duration {
        self.taken_at.elapsed().unwrap_or_default()
    }
}

/// Direction of memory pressure over the retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureTrend {
    /// Percent-used grew by more than the trend threshold.
    Rising,
    /// Percent-used fell by more than the trend threshold.
    Falling,
    /// Movement within the threshold either way.
    Stable,
}

impl std::fmt::Display for PressureTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rising => write!(f, "rising"),
            Self::Falling => write!(f, "falling"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Handle to a running sampling task. Dropping it does NOT stop the task;
/// call [`MonitorHandle::stop`].
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal shutdown and wait for the sampling task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Periodic memory sampler with a bounded snapshot ring.
pub struct ResourceMonitor {
    probe: Mutex<Box<dyn MemoryProbe>>,
    ring: Mutex<VecDeque<MemorySnapshot>>,
    capacity: usize,
    trend_threshold: f64,
    seq: AtomicU64,
    degraded: AtomicBool,
    publish_tx: watch::Sender<Option<MemorySnapshot>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("capacity", &self.capacity)
            .field("trend_threshold", &self.trend_threshold)
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResourceMonitor {
    /// Create a monitor over the given probe.
    ///
    /// `capacity` bounds the snapshot ring (most-recent-N);
    /// `trend_threshold` is the percent-used delta (in percentage points)
    /// below which the trend reads stable.
    pub fn new(probe: Box<dyn MemoryProbe>, capacity: usize, trend_threshold: f64) -> Self {
        let (publish_tx, _) = watch::channel(None);
        Self {
            probe: Mutex::new(probe),
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            trend_threshold,
            seq: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            publish_tx,
        }
    }

    /// Take one sample now.
    ///
    /// On success the snapshot is appended to the ring (evicting the
    /// oldest once full), published to subscribers, and returned. On probe
    /// failure the previous snapshot is retained, the degraded flag is
    /// set, and `None` is returned — the monitor never terminates on a
    /// single failed sample.
    pub fn sample(&self) -> Option<MemorySnapshot> {
        let reading = match self.probe.lock() {
            Ok(mut probe) => probe.current_memory(),
            Err(e) => Err(ProbeError(format!("probe lock poisoned: {e}"))),
        };

        match reading {
            Ok((used, total)) => {
                let percent = if total == 0 {
                    0.0
                } else {
                    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
                };
                let snapshot = MemorySnapshot {
                    used_bytes: used,
                    total_bytes: total,
                    percent_used: percent,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
                    taken_at: SystemTime::now(),
                };
                match self.ring.lock() {
                    Ok(mut ring) => {
                        if ring.len() >= self.capacity {
                            ring.pop_front();
                        }
                        ring.push_back(snapshot);
                        debug!(
                            percent_used = snapshot.percent_used,
                            history_len = ring.len(),
                            "memory sampled"
                        );
                    }
                    Err(e) => warn!(error = %e, "snapshot ring lock poisoned"),
                }
                self.degraded.store(false, Ordering::Relaxed);
                let _ = self.publish_tx.send(Some(snapshot));
                Some(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "memory probe failed, retaining previous snapshot");
                self.degraded.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    /// The most recent snapshot, if any sample has succeeded yet.
    pub fn latest(&self) -> Option<MemorySnapshot> {
        match self.ring.lock() {
            Ok(ring) => ring.back().copied(),
            Err(e) => {
                warn!(error = %e, "snapshot ring lock poisoned in latest");
                None
            }
        }
    }

    /// The retained snapshots, oldest first.
    pub fn snapshot_history(&self) -> Vec<MemorySnapshot> {
        match self.ring.lock() {
            Ok(ring) => ring.iter().copied().collect(),
            Err(e) => {
                warn!(error = %e, "snapshot ring lock poisoned in snapshot_history");
                Vec::new()
            }
        }
    }

    /// Pressure direction over the retained window.
    ///
    /// Compares the newest percent-used against the oldest; fewer than two
    /// samples reads stable.
    pub fn pressure_trend(&self) -> PressureTrend {
        let ring = match self.ring.lock() {
            Ok(ring) => ring,
            Err(e) => {
                warn!(error = %e, "snapshot ring lock poisoned in pressure_trend");
                return PressureTrend::Stable;
            }
        };
        let (first, last) = match (ring.front(), ring.back()) {
            (Some(f), Some(l)) if ring.len() >= 2 => (f.percent_used, l.percent_used),
            _ => return PressureTrend::Stable,
        };
        let delta = last - first;
        if delta > self.trend_threshold {
            PressureTrend::Rising
        } else if delta < -self.trend_threshold {
            PressureTrend::Falling
        } else {
            PressureTrend::Stable
        }
    }

    /// Whether the most recent probe attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Subscribe to published snapshots. Receives `None` until the first
    /// successful sample.
    pub fn subscribe(&self) -> watch::Receiver<Option<MemorySnapshot>> {
        self.publish_tx.subscribe()
    }

    /// Spawn the periodic sampling task.
    ///
    /// Samples immediately, then every `interval`, until the returned
    /// handle's [`MonitorHandle::stop`] is called.
    pub fn start(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let monitor = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = monitor.sample();
                    }
                    _ = shutdown_rx.changed() => {
                        info!("resource monitor shutdown signal received");
                        break;
                    }
                }
            }
        });

        MonitorHandle { shutdown_tx, task }
    }
}
