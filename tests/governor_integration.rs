//! End-to-end control-loop scenarios exercised through the public API.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_inference_governor::backend::InferenceBackend;
use tokio_inference_governor::resource::{MemoryProbe, ProbeError};
use tokio_inference_governor::{
    EchoBackend, GenerationParams, GovernorConfig, GovernorError, InferenceGovernor,
    InferenceRequest, QuantizationTier, SessionId,
};

// ── Helpers ──────────────────────────────────────────────────────────

struct FixedProbe {
    percent: u64,
}

impl MemoryProbe for FixedProbe {
    fn current_memory(&mut self) -> Result<(u64, u64), ProbeError> {
        Ok((self.percent, 100))
    }
}

/// Echo backend that counts real inference invocations.
struct CountingBackend {
    inner: EchoBackend,
    infer_calls: AtomicUsize,
}

impl CountingBackend {
    fn new(delay_ms: u64) -> Self {
        Self {
            inner: EchoBackend::with_delay(delay_ms),
            infer_calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for CountingBackend {
    async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GovernorError> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.infer(prompt, params).await
    }

    async fn reconfigure(&self, tier: QuantizationTier) -> Result<(), GovernorError> {
        self.inner.reconfigure(tier).await
    }

    async fn probe(&self) -> Result<(), GovernorError> {
        self.inner.probe().await
    }
}

/// Backend that always fails with a counted error.
struct BrokenBackend {
    infer_calls: AtomicUsize,
}

#[async_trait]
impl InferenceBackend for BrokenBackend {
    async fn infer(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GovernorError> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        Err(GovernorError::Backend("model runtime crashed".to_string()))
    }

    async fn reconfigure(&self, _tier: QuantizationTier) -> Result<(), GovernorError> {
        Ok(())
    }

    async fn probe(&self) -> Result<(), GovernorError> {
        Err(GovernorError::Backend("unreachable".to_string()))
    }
}

fn request(id: &str, prompt: &str) -> InferenceRequest {
    InferenceRequest {
        session: SessionId::new("integration"),
        request_id: id.to_string(),
        prompt: prompt.to_string(),
        params: GenerationParams::default(),
    }
}

/// A prompt the default estimator scores at (or very near) 1.0: saturated
/// length, vocabulary, and structural factors.
fn maximally_complex_prompt() -> String {
    let technical = "tensor matrix algorithm function derivative integral quantum \
                     regression transformer attention parameter coefficient theorem \
                     equation neural network ";
    let mut prompt = technical.repeat(80); // > 10 000 chars
    prompt.push_str(&"{[(=+*/)]} 0123456789 ".repeat(10)); // > 100 structural chars
    prompt
}

// ── Scenario A: cache avoids redundant inference ─────────────────────

#[tokio::test]
async fn scenario_a_high_complexity_mid_memory_caches_result() {
    let mut config = GovernorConfig::default();
    // A warmed session: the tier has already climbed near the top, so the
    // complexity-mapped target is within one step and the decision is
    // stable across identical requests.
    config.backend.model = "llama3:q8_0".to_string();

    let backend = Arc::new(CountingBackend::new(5));
    let governor = InferenceGovernor::with_probe(
        config,
        backend.clone(),
        Box::new(FixedProbe { percent: 50 }),
    )
    .unwrap();

    let prompt = maximally_complex_prompt();

    let first = governor.handle(request("a-1", &prompt)).await.unwrap();
    assert!(
        first.tier > QuantizationTier::cheapest(),
        "high complexity at 50% memory must not pick the cheapest tier"
    );
    assert!(!first.cached);
    assert_eq!(backend.calls(), 1);

    let second = governor.handle(request("a-2", &prompt)).await.unwrap();
    assert!(second.cached, "identical request must be served from cache");
    assert_eq!(second.text, first.text);
    assert_eq!(backend.calls(), 1, "backend must not be invoked a second time");
}

// ── Scenario B: hard memory pressure overrides complexity ────────────

#[tokio::test]
async fn scenario_b_hard_pressure_forces_cheapest_tier() {
    let mut config = GovernorConfig::default();
    // Seed the session at the most precise tier.
    config.backend.model = "llama3:f16".to_string();

    let governor = InferenceGovernor::with_probe(
        config,
        Arc::new(EchoBackend::new()),
        Box::new(FixedProbe { percent: 96 }),
    )
    .unwrap();
    assert_eq!(governor.current_tier().await, QuantizationTier::F16);

    let reply = governor
        .handle(request("b-1", &maximally_complex_prompt()))
        .await
        .unwrap();
    assert_eq!(
        reply.tier,
        QuantizationTier::cheapest(),
        "96% used must force the cheapest tier even at complexity 1.0"
    );
}

// ── Scenario C: breaker opens, fast-fails, then admits one trial ─────

#[tokio::test]
async fn scenario_c_breaker_opens_after_threshold_and_fast_fails() {
    let mut config = GovernorConfig::default();
    config.breaker.failure_threshold = 5;
    config.breaker.cooldown_s = 1;
    config.retry.max_attempts = 1; // isolate breaker counting from retries

    let backend = Arc::new(BrokenBackend {
        infer_calls: AtomicUsize::new(0),
    });
    let governor = InferenceGovernor::with_probe(
        config,
        backend.clone(),
        Box::new(FixedProbe { percent: 50 }),
    )
    .unwrap();

    // 5 counted failures open the circuit. Distinct prompts keep each
    // attempt a fresh cache miss.
    for i in 0..5 {
        let result = governor
            .handle(request(&format!("c-{i}"), &format!("prompt {i}")))
            .await;
        assert!(matches!(result, Err(GovernorError::Backend(_))));
    }
    assert_eq!(backend.infer_calls.load(Ordering::SeqCst), 5);

    // 6th call: rejected without reaching the backend.
    let result = governor.handle(request("c-6", "prompt 6")).await;
    assert!(matches!(result, Err(GovernorError::CircuitOpen)));
    assert_eq!(
        backend.infer_calls.load(Ordering::SeqCst),
        5,
        "rejected call must never reach the backend"
    );

    // After the cooldown, exactly one trial is admitted (and fails,
    // reopening the circuit).
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result = governor.handle(request("c-7", "prompt 7")).await;
    assert!(matches!(result, Err(GovernorError::Backend(_))));
    assert_eq!(backend.infer_calls.load(Ordering::SeqCst), 6);

    let result = governor.handle(request("c-8", "prompt 8")).await;
    assert!(matches!(result, Err(GovernorError::CircuitOpen)));
    assert_eq!(backend.infer_calls.load(Ordering::SeqCst), 6);
}

// ── Concurrency: single-flight through the full request path ─────────

#[tokio::test]
async fn concurrent_identical_requests_share_one_backend_call() {
    let backend = Arc::new(CountingBackend::new(40));
    let governor = Arc::new(
        InferenceGovernor::with_probe(
            GovernorConfig::default(),
            backend.clone(),
            Box::new(FixedProbe { percent: 50 }),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..16 {
        let governor = Arc::clone(&governor);
        handles.push(tokio::spawn(async move {
            governor
                .handle(request(&format!("n-{i}"), "the shared prompt"))
                .await
        }));
    }

    let mut texts = Vec::new();
    for h in handles {
        texts.push(h.await.unwrap().unwrap().text);
    }
    assert!(texts.windows(2).all(|w| w[0] == w[1]), "all callers share one result");
    assert_eq!(backend.calls(), 1, "single-flight must collapse to one call");
}

// ── Failed requests leave the fingerprint retryable ──────────────────

#[tokio::test]
async fn failed_inference_caches_nothing_and_allows_retry() {
    struct FailOnceBackend {
        inner: EchoBackend,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for FailOnceBackend {
        async fn infer(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> Result<String, GovernorError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GovernorError::Backend("transient crash".to_string()));
            }
            self.inner.infer(prompt, params).await
        }
        async fn reconfigure(&self, tier: QuantizationTier) -> Result<(), GovernorError> {
            self.inner.reconfigure(tier).await
        }
        async fn probe(&self) -> Result<(), GovernorError> {
            self.inner.probe().await
        }
    }

    let mut config = GovernorConfig::default();
    config.retry.max_attempts = 1;

    let governor = InferenceGovernor::with_probe(
        config,
        Arc::new(FailOnceBackend {
            inner: EchoBackend::new(),
            failures_left: AtomicUsize::new(1),
        }),
        Box::new(FixedProbe { percent: 50 }),
    )
    .unwrap();

    let result = governor.handle(request("f-1", "flaky prompt")).await;
    assert!(result.is_err());
    assert_eq!(governor.cache().stats().await.entries, 0);

    // Same fingerprint is free for the next attempt, which succeeds.
    let reply = governor.handle(request("f-2", "flaky prompt")).await.unwrap();
    assert!(!reply.cached);
    assert!(reply.text.contains("flaky prompt"));
}

// ── Health reporting reflects breaker state ──────────────────────────

#[tokio::test]
async fn health_report_tracks_open_circuit() {
    let mut config = GovernorConfig::default();
    config.breaker.failure_threshold = 1;
    config.retry.max_attempts = 1;

    let governor = InferenceGovernor::with_probe(
        config,
        Arc::new(BrokenBackend {
            infer_calls: AtomicUsize::new(0),
        }),
        Box::new(FixedProbe { percent: 50 }),
    )
    .unwrap();

    let before = governor.health().await;
    assert!(!before.backend.healthy, "probe against a dead backend fails");
    assert!(before.circuit.healthy, "circuit starts closed");

    let _ = governor.handle(request("h-1", "boom")).await;
    let after = governor.health().await;
    assert!(!after.circuit.healthy, "circuit must report open");
    assert!(!after.healthy);
    assert_eq!(
        governor.breaker().status().await,
        tokio_inference_governor::CircuitStatus::Open
    );
}
