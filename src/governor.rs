//! The adaptive control loop tying the components together.
//!
//! ## Responsibility
//! Run the per-request decision path (score → snapshot → tier →
//! fingerprint → cache → guarded backend call) and the background wiring
//! (memory sampling, pressure reactions, periodic health checks).
//!
//! ## Guarantees
//! - A reconfiguration failure never fails the request: it proceeds at the
//!   unchanged tier
//! - The inference call carries its own deadline; expiry counts as a
//!   backend failure for the circuit breaker
//! - Background tasks stop through [`GovernorHandles::shutdown`]
//!
//! ## Span fields: `request_id`, `session`, `tier`, `cached`,
//! `duration_ms`. Prompt content and model responses are never logged.

use crate::backend::InferenceBackend;
use crate::complexity::ComplexityEstimator;
use crate::config::GovernorConfig;
use crate::health::{HealthHandle, HealthMonitor, HealthReport};
use crate::resilience::cache::fingerprint;
use crate::resilience::{CircuitBreaker, ResponseCache, RetryPolicy};
use crate::resource::{MemoryProbe, MonitorHandle, ResourceMonitor, SysinfoProbe};
use crate::tier::{QuantizationController, QuantizationTier, TierThresholds};
use crate::{GovernorError, InferenceReply, InferenceRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handles for the governor's background tasks.
///
/// Dropping them does NOT stop the tasks; call
/// [`GovernorHandles::shutdown`].
#[derive(Debug)]
pub struct GovernorHandles {
    monitor: MonitorHandle,
    health: HealthHandle,
    pressure_shutdown: watch::Sender<bool>,
    pressure_task: JoinHandle<()>,
}

impl GovernorHandles {
    /// Stop the sampling task, the pressure-reaction task, and the
    /// periodic health checker.
    pub async fn shutdown(self) {
        let _ = self.pressure_shutdown.send(true);
        let _ = self.pressure_task.await;
        self.monitor.stop().await;
        self.health.stop().await;
    }
}

/// Resource-aware adaptive inference governor.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_inference_governor::{
///     EchoBackend, GovernorConfig, InferenceGovernor,
/// };
///
/// # fn example() -> Result<(), tokio_inference_governor::GovernorError> {
/// let governor = InferenceGovernor::new(
///     GovernorConfig::default(),
///     Arc::new(EchoBackend::new()),
/// )?;
/// let handles = governor.start();
/// # Ok(()) }
/// ```
pub struct InferenceGovernor {
    config: GovernorConfig,
    backend: Arc<dyn InferenceBackend>,
    estimator: ComplexityEstimator,
    monitor: Arc<ResourceMonitor>,
    controller: QuantizationController,
    cache: ResponseCache,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    health: Arc<HealthMonitor>,
    current_tier: Arc<RwLock<QuantizationTier>>,
}

impl std::fmt::Debug for InferenceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InferenceGovernor {
    /// Create a governor sampling real host memory.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] if the configuration fails validation.
    pub fn new(
        config: GovernorConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, GovernorError> {
        Self::with_probe(config, backend, Box::new(SysinfoProbe::new()))
    }

    /// Create a governor with an injected memory probe (tests, embedded
    /// accounting).
    ///
    /// # Errors
    ///
    /// [`GovernorError::Config`] if the configuration fails validation.
    pub fn with_probe(
        config: GovernorConfig,
        backend: Arc<dyn InferenceBackend>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, GovernorError> {
        config.validate()?;

        let monitor = Arc::new(ResourceMonitor::new(
            probe,
            config.memory.history_len,
            config.memory.trend_threshold_percent,
        ));
        let cache = ResponseCache::new(config.cache.max_entries, config.cache.max_bytes);
        let breaker = CircuitBreaker::new(
            config.breaker.failure_threshold,
            config.breaker.window(),
            config.breaker.cooldown(),
        );
        let retry = RetryPolicy::exponential(
            config.retry.max_attempts,
            Duration::from_millis(config.retry.base_ms),
            Duration::from_millis(config.retry.max_ms),
        );
        let controller = QuantizationController::new(
            Arc::clone(&backend),
            TierThresholds {
                soft_percent: config.memory.soft_threshold_percent,
                hard_percent: config.memory.hard_threshold_percent,
            },
        );
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&backend),
            breaker.clone(),
            Arc::clone(&monitor),
            cache.clone(),
            config.health.probe_timeout(),
            config.staleness_bound(),
        ));

        // A tag on the configured model seeds the session tier.
        let initial_tier = config
            .backend
            .model
            .split(':')
            .nth(1)
            .and_then(|tag| tag.parse().ok())
            .unwrap_or_else(QuantizationTier::cheapest);

        let estimator = ComplexityEstimator::new(config.complexity.clone());

        Ok(Self {
            config,
            backend,
            estimator,
            monitor,
            controller,
            cache,
            breaker,
            retry,
            health,
            current_tier: Arc::new(RwLock::new(initial_tier)),
        })
    }

    /// Handle one inference request through the full decision loop.
    ///
    /// # Errors
    ///
    /// Any of the request-path failures: [`GovernorError::CircuitOpen`]
    /// while the breaker rejects, [`GovernorError::Backend`] /
    /// [`GovernorError::Timeout`] after retries exhaust, or
    /// [`GovernorError::InvalidRequest`] passed through from the backend.
    /// Reconfiguration failures are NOT surfaced here — the request
    /// proceeds at the unchanged tier.
    pub async fn handle(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceReply, GovernorError> {
        let started = Instant::now();
        let score = self.estimator.score(&request.prompt);

        // Before the first tick, sample on demand; if that also fails the
        // request proceeds at the current tier (sampling is transient).
        let snapshot = match self.monitor.latest() {
            Some(snapshot) => Some(snapshot),
            None => self.monitor.sample(),
        };

        let current = *self.current_tier.read().await;
        let tier = match snapshot {
            Some(snapshot) => {
                match self
                    .controller
                    .select_tier(&score, &snapshot, current)
                    .await
                {
                    Ok(tier) => {
                        if tier != current {
                            *self.current_tier.write().await = tier;
                        }
                        tier
                    }
                    Err(e) => {
                        warn!(
                            request_id = %request.request_id,
                            error = %e,
                            "tier switch failed, proceeding at current tier"
                        );
                        current
                    }
                }
            }
            None => current,
        };

        let fp = fingerprint(&request.prompt, &request.params, tier);

        let backend = Arc::clone(&self.backend);
        let breaker = self.breaker.clone();
        let retry = self.retry.clone();
        let prompt = request.prompt.clone();
        let params = request.params.clone();
        let deadline = self.config.backend.request_timeout();

        let outcome = self
            .cache
            .get_or_compute(&fp, move || async move {
                retry
                    .retry_if(
                        || {
                            let breaker = breaker.clone();
                            let backend = Arc::clone(&backend);
                            let prompt = prompt.clone();
                            let params = params.clone();
                            async move {
                                breaker
                                    .call(|| async move {
                                        match tokio::time::timeout(
                                            deadline,
                                            backend.infer(&prompt, &params),
                                        )
                                        .await
                                        {
                                            Ok(result) => result,
                                            Err(_) => Err(GovernorError::Timeout(
                                                deadline.as_millis() as u64,
                                            )),
                                        }
                                    })
                                    .await
                            }
                        },
                        GovernorError::is_counted,
                    )
                    .await
            })
            .await?;

        info!(
            request_id = %request.request_id,
            session = %request.session.as_str(),
            tier = %tier,
            cached = outcome.hit,
            duration_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        Ok(InferenceReply {
            request_id: request.request_id,
            text: outcome.response,
            tier,
            cached: outcome.hit,
        })
    }

    /// Start the background tasks: memory sampling, pressure reactions,
    /// and periodic health checks.
    pub fn start(&self) -> GovernorHandles {
        let monitor_handle = self.monitor.start(self.config.memory.sample_interval());
        let health_handle = self.health.start(self.config.health.interval());

        let mut snapshots = self.monitor.subscribe();
        let (pressure_shutdown, mut shutdown_rx) = watch::channel(false);
        let cache = self.cache.clone();
        let backend = Arc::clone(&self.backend);
        let current_tier = Arc::clone(&self.current_tier);
        let hard = self.config.memory.hard_threshold_percent;
        let soft = self.config.memory.soft_threshold_percent;
        let full_entries = self.config.cache.max_entries;
        let shrunk_entries = self.config.cache.shrunk_entries();

        let pressure_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(snapshot) = *snapshots.borrow() else {
                            continue;
                        };
                        if snapshot.percent_used > hard {
                            warn!(
                                percent_used = snapshot.percent_used,
                                "hard memory pressure: shrinking cache, degrading tier"
                            );
                            cache.resize(shrunk_entries).await;
                            let current = *current_tier.read().await;
                            if current != QuantizationTier::cheapest() {
                                match backend.reconfigure(QuantizationTier::cheapest()).await {
                                    Ok(()) => {
                                        *current_tier.write().await =
                                            QuantizationTier::cheapest();
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "emergency tier degradation failed")
                                    }
                                }
                            }
                        } else if snapshot.percent_used <= soft {
                            // Pressure cleared: restore the configured budget.
                            cache.resize(full_entries).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("pressure-reaction task shutdown signal received");
                        break;
                    }
                }
            }
        });

        GovernorHandles {
            monitor: monitor_handle,
            health: health_handle,
            pressure_shutdown,
            pressure_task,
        }
    }

    /// Run one aggregate health check now.
    pub async fn health(&self) -> HealthReport {
        self.health.check().await
    }

    /// The session's current quantization tier.
    pub async fn current_tier(&self) -> QuantizationTier {
        *self.current_tier.read().await
    }

    /// The response cache (shared handle).
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The circuit breaker guarding the backend (shared handle).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The memory monitor.
    pub fn resource_monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::resource::ProbeError;
    use crate::{GenerationParams, SessionId};

    struct FixedProbe {
        percent: f64,
    }

    impl MemoryProbe for FixedProbe {
        fn current_memory(&mut self) -> Result<(u64, u64), ProbeError> {
            let total = 100_u64;
            Ok(((self.percent as u64).min(total), total))
        }
    }

    struct FailingProbe;

    impl MemoryProbe for FailingProbe {
        fn current_memory(&mut self) -> Result<(u64, u64), ProbeError> {
            Err(ProbeError("no accounting".to_string()))
        }
    }

    fn request(id: &str, prompt: &str) -> InferenceRequest {
        InferenceRequest {
            session: SessionId::new("session-1"),
            request_id: id.to_string(),
            prompt: prompt.to_string(),
            params: GenerationParams::default(),
        }
    }

    fn governor_at(percent: f64) -> InferenceGovernor {
        InferenceGovernor::with_probe(
            GovernorConfig::default(),
            Arc::new(EchoBackend::new()),
            Box::new(FixedProbe { percent }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_handle_returns_reply_with_request_id() {
        let governor = governor_at(50.0);
        let reply = governor.handle(request("req-1", "hello there")).await.unwrap();
        assert_eq!(reply.request_id, "req-1");
        assert!(!reply.cached);
        assert!(reply.text.contains("hello there"));
    }

    #[tokio::test]
    async fn test_identical_request_served_from_cache() {
        let governor = governor_at(50.0);
        let first = governor.handle(request("req-1", "same prompt")).await.unwrap();
        let second = governor.handle(request("req-2", "same prompt")).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.text, second.text);
    }

    #[tokio::test]
    async fn test_probe_failure_proceeds_at_current_tier() {
        let governor = InferenceGovernor::with_probe(
            GovernorConfig::default(),
            Arc::new(EchoBackend::new()),
            Box::new(FailingProbe),
        )
        .unwrap();

        let reply = governor.handle(request("req-1", "still works")).await.unwrap();
        assert_eq!(reply.tier, QuantizationTier::cheapest());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let mut config = GovernorConfig::default();
        config.cache.max_entries = 0;
        let result = InferenceGovernor::new(config, Arc::new(EchoBackend::new()));
        assert!(matches!(result, Err(GovernorError::Config(_))));
    }

    #[tokio::test]
    async fn test_model_tag_seeds_initial_tier() {
        let mut config = GovernorConfig::default();
        config.backend.model = "llama3:q8_0".to_string();
        let governor = InferenceGovernor::with_probe(
            config,
            Arc::new(EchoBackend::new()),
            Box::new(FixedProbe { percent: 50.0 }),
        )
        .unwrap();
        assert_eq!(governor.current_tier().await, QuantizationTier::Q8_0);
    }

    #[tokio::test]
    async fn test_tier_moves_one_step_per_request() {
        let governor = governor_at(40.0);
        assert_eq!(governor.current_tier().await, QuantizationTier::cheapest());

        // High complexity pulls the tier up one step per request.
        let prompt = "tensor matrix algorithm function derivative integral \
                      quantum regression transformer attention parameter \
                      coefficient theorem equation {a+b=c} [0-9]";
        governor.handle(request("r1", prompt)).await.unwrap();
        let after_one = governor.current_tier().await;
        assert_eq!(after_one.ordinal(), 1);

        governor.handle(request("r2", prompt)).await.unwrap();
        assert_eq!(governor.current_tier().await.ordinal(), 2);
    }

    #[tokio::test]
    async fn test_reconfigure_failure_keeps_request_alive() {
        struct StubbornBackend {
            inner: EchoBackend,
        }
        #[async_trait::async_trait]
        impl InferenceBackend for StubbornBackend {
            async fn infer(
                &self,
                prompt: &str,
                params: &GenerationParams,
            ) -> Result<String, GovernorError> {
                self.inner.infer(prompt, params).await
            }
            async fn reconfigure(
                &self,
                _tier: QuantizationTier,
            ) -> Result<(), GovernorError> {
                Err(GovernorError::Reconfigure("tag not pulled".to_string()))
            }
            async fn probe(&self) -> Result<(), GovernorError> {
                Ok(())
            }
        }

        let governor = InferenceGovernor::with_probe(
            GovernorConfig::default(),
            Arc::new(StubbornBackend {
                inner: EchoBackend::new(),
            }),
            Box::new(FixedProbe { percent: 40.0 }),
        )
        .unwrap();

        let prompt = "a complex algorithm over a tensor matrix {x=1}";
        let reply = governor.handle(request("r1", prompt)).await.unwrap();
        // The switch failed, so the request ran at the unchanged tier.
        assert_eq!(reply.tier, QuantizationTier::cheapest());
        assert_eq!(governor.current_tier().await, QuantizationTier::cheapest());
    }

    #[tokio::test]
    async fn test_background_tasks_start_and_shut_down() {
        let mut config = GovernorConfig::default();
        config.memory.sample_interval_ms = 10;
        config.health.interval_ms = 10;
        let governor = InferenceGovernor::with_probe(
            config,
            Arc::new(EchoBackend::new()),
            Box::new(FixedProbe { percent: 50.0 }),
        )
        .unwrap();

        let handles = governor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(governor.resource_monitor().latest().is_some());
        handles.shutdown().await;
    }

    #[tokio::test]
    async fn test_hard_pressure_shrinks_cache_and_degrades_tier() {
        let mut config = GovernorConfig::default();
        config.memory.sample_interval_ms = 10;
        config.cache.max_entries = 100;
        config.cache.pressure_shrink_fraction = 0.2;
        let backend = Arc::new(EchoBackend::new());
        backend.reconfigure(QuantizationTier::F16).await.unwrap();

        let governor = InferenceGovernor::with_probe(
            config,
            backend.clone(),
            Box::new(FixedProbe { percent: 96.0 }),
        )
        .unwrap();
        // Pretend an earlier session pushed the tier up.
        *governor.current_tier.write().await = QuantizationTier::F16;

        let handles = governor.start();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(governor.cache().stats().await.capacity, 20);
        assert_eq!(governor.current_tier().await, QuantizationTier::cheapest());
        assert_eq!(backend.current_tier().await, QuantizationTier::cheapest());
        handles.shutdown().await;
    }
}
