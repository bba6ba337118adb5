//! Model capability: `infer(prompt, schema) -> structured result`.
//!
//! [`ModelClient`] is the seam between the pipeline and a provider.
//! [`GuardedModel`] wraps any client with the limits every external call
//! needs: a shared in-flight bound, a per-call timeout, and retry with
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use legisflow_shared::{LegisflowError, ModelCallKind, ModelFamily, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Which model produced an output. Part of the amend and qa fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub family: ModelFamily,
    pub model: String,
    pub temperature: f32,
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.family, self.model)
    }
}

/// JSON schema the response must follow.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub system: String,
    pub user: String,
    pub schema: Option<ResponseSchema>,
}

#[derive(Debug, Clone)]
pub struct InferenceResponse {
    /// Raw text of the reply.
    pub text: String,
    /// Parsed reply, present when the request carried a schema.
    pub json: Option<Value>,
}

/// A provider that answers prompts.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse>;
}

/// Turn a provider's reply text into a response, enforcing non-emptiness
/// and, for structured requests, valid JSON.
pub(crate) fn finish_response(request: &InferenceRequest, text: String) -> Result<InferenceResponse> {
    if text.trim().is_empty() {
        return Err(LegisflowError::model(
            ModelCallKind::Validation,
            "model returned an empty response",
        ));
    }
    let json = match &request.schema {
        Some(schema) => {
            let value = serde_json::from_str::<Value>(strip_code_fence(&text)).map_err(|e| {
                LegisflowError::model(
                    ModelCallKind::Validation,
                    format!("response for {} is not valid JSON: {e}", schema.name),
                )
            })?;
            Some(value)
        }
        None => None,
    };
    Ok(InferenceResponse { text, json })
}

/// Remove a surrounding Markdown code fence (```json ... ```), if any.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening fence line.
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}

// ---------------------------------------------------------------------------
// GuardedModel
// ---------------------------------------------------------------------------

/// Rate-limited, time-bounded, retrying wrapper around a [`ModelClient`].
pub struct GuardedModel {
    inner: Arc<dyn ModelClient>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GuardedModel {
    /// `permits` is shared by every client that draws on the same quota.
    pub fn new(
        inner: Arc<dyn ModelClient>,
        permits: Arc<Semaphore>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            permits,
            timeout,
            retry,
        }
    }

    async fn attempt(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            LegisflowError::model(ModelCallKind::Config, "model call limiter closed")
        })?;
        match tokio::time::timeout(self.timeout, self.inner.infer(request)).await {
            Ok(result) => result,
            Err(_) => Err(LegisflowError::model(
                ModelCallKind::Timeout,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }
}

#[async_trait]
impl ModelClient for GuardedModel {
    fn spec(&self) -> &ModelSpec {
        self.inner.spec()
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let mut attempt = 0;
        loop {
            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(LegisflowError::ModelCall { kind, message })
                    if kind.is_transient() && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.delay_for(attempt);
                    warn!(model = %self.inner.spec(), attempt, ?delay, %kind, %message, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(model = %self.inner.spec(), attempts = attempt + 1, "model call gave up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            family: ModelFamily::Ollama,
            model: "llama3.1".into(),
            temperature: 0.2,
        }
    }

    fn request(schema: bool) -> InferenceRequest {
        InferenceRequest {
            system: "sys".into(),
            user: "user".into(),
            schema: schema.then(|| ResponseSchema {
                name: "answers".into(),
                schema: serde_json::json!({"type": "object"}),
            }),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    /// Fails with `kind` for the first `failures` calls, then answers.
    struct Flaky {
        spec: ModelSpec,
        failures: usize,
        kind: ModelCallKind,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: usize, kind: ModelCallKind) -> Self {
            Self {
                spec: spec(),
                failures,
                kind,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ModelClient for Flaky {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures {
                return Err(LegisflowError::model(self.kind, "boom"));
            }
            finish_response(request, "{\"ok\": true}".into())
        }
    }

    fn guarded(inner: Arc<Flaky>, retries: u32, timeout: Duration) -> GuardedModel {
        GuardedModel::new(inner, Arc::new(Semaphore::new(1)), timeout, fast_retry(retries))
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let inner = Arc::new(Flaky::new(2, ModelCallKind::Quota));
        let model = guarded(Arc::clone(&inner), 3, Duration::from_secs(5));
        let response = model.infer(&request(true)).await.unwrap();
        assert_eq!(response.json.unwrap()["ok"], true);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        let inner = Arc::new(Flaky::new(5, ModelCallKind::Config));
        let model = guarded(Arc::clone(&inner), 3, Duration::from_secs(5));
        let err = model.infer(&request(false)).await.unwrap_err();
        assert!(matches!(
            err,
            LegisflowError::ModelCall {
                kind: ModelCallKind::Config,
                ..
            }
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let inner = Arc::new(Flaky::new(10, ModelCallKind::Network));
        let model = guarded(Arc::clone(&inner), 2, Duration::from_secs(5));
        assert!(model.infer(&request(false)).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let mut flaky = Flaky::new(0, ModelCallKind::Network);
        flaky.delay = Duration::from_millis(200);
        let model = guarded(Arc::new(flaky), 0, Duration::from_millis(10));
        let err = model.infer(&request(false)).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    /// Records how many calls overlap.
    struct Overlapping {
        spec: ModelSpec,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for Overlapping {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            finish_response(request, "ok".into())
        }
    }

    #[tokio::test]
    async fn shared_permits_bound_concurrent_calls() {
        let inner = Arc::new(Overlapping {
            spec: spec(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let permits = Arc::new(Semaphore::new(2));
        let amend = Arc::new(GuardedModel::new(
            inner.clone(),
            Arc::clone(&permits),
            Duration::from_secs(5),
            fast_retry(0),
        ));
        let qa = Arc::new(GuardedModel::new(
            inner.clone(),
            permits,
            Duration::from_secs(5),
            fast_retry(0),
        ));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..10 {
            let model = if i % 2 == 0 { Arc::clone(&amend) } else { Arc::clone(&qa) };
            set.spawn(async move { model.infer(&request(false)).await });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap().unwrap();
        }

        let peak = inner.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak in-flight calls was {peak}");
        assert!(peak >= 1);
    }

    #[test]
    fn structured_responses_must_be_json() {
        let ok = finish_response(&request(true), "```json\n{\"a\": 1}\n```".into()).unwrap();
        assert_eq!(ok.json.unwrap()["a"], 1);

        let err = finish_response(&request(true), "not json".into()).unwrap_err();
        assert!(err.to_string().contains("validation"));

        let err = finish_response(&request(false), "   ".into()).unwrap_err();
        assert!(err.to_string().contains("empty response"));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```markdown\n# Bill\n```"), "# Bill");
        assert_eq!(strip_code_fence("# Bill"), "# Bill");
        assert_eq!(strip_code_fence("```{}```"), "{}");
    }
}
