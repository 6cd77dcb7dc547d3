//! Request Executor (spec.md §4.3)
//!
//! Drives one Anthropic-shaped request through the account pool: select an
//! account, attempt it against the configured endpoint fallback list,
//! classify whatever comes back, and either return, retry in place, switch
//! accounts, or fall back to a different model. No branch in this file
//! performs I/O directly — everything upstream-facing goes through
//! [`Upstream`], everything pool-facing through [`cloud_code_pool::Pool`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use cloud_code_pool::{AttemptClassification, Pool, classify_attempt};

use crate::backoff::{calculate_smart_backoff, parse_reset_time_ms};
use crate::cancel::{CancelSignal, is_cancelled};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::request::{AnthropicRequest, RequestBuilder, is_thinking_class_model};
use crate::time_fmt::format_unix_ms_iso8601;
use crate::upstream::{Upstream, UpstreamResponse};

/// What `execute()` hands back to the HTTP layer. Streaming responses are
/// collected into a finite event sequence rather than handed back as a live
/// stream, since the empty-response retry (spec.md §4.3) has to inspect the
/// whole body before deciding whether the call actually succeeded.
#[derive(Debug)]
pub enum ExecuteOutcome {
    NonStreaming(Value),
    Streaming(Vec<Value>),
}

/// Raised out of one account attempt (the endpoint-fallback loop), before
/// being reinterpreted by the outer account-selection loop.
enum AttemptError {
    RateLimited { wait_ms: u64, reason: String },
    PermanentAuth,
    /// Endpoint list exhausted on transport errors (timeout/connect failure).
    Network,
    /// Endpoint list exhausted on 5xx/other responses, or a capacity retry
    /// budget ran out on a 503 that carried no quota marker.
    ServerExhausted,
    Cancelled,
}

/// Drives requests through the pool. One instance is shared (behind `Arc`)
/// across the lifetime of the process.
pub struct Executor {
    pool: Arc<Pool>,
    upstream: Arc<dyn Upstream>,
    request_builder: Arc<dyn RequestBuilder>,
    config: ExecutorConfig,
    endpoints: Vec<String>,
    fallback_chain: HashMap<String, String>,
}

impl Executor {
    pub fn new(
        pool: Arc<Pool>,
        upstream: Arc<dyn Upstream>,
        request_builder: Arc<dyn RequestBuilder>,
        config: ExecutorConfig,
        endpoints: Vec<String>,
    ) -> Self {
        Self {
            pool,
            upstream,
            request_builder,
            config,
            endpoints,
            fallback_chain: HashMap::new(),
        }
    }

    /// Configures `model -> fallback model` chain used when a model is
    /// exhausted pool-wide and fallback is enabled for the request.
    pub fn with_fallback_chain(mut self, chain: HashMap<String, String>) -> Self {
        self.fallback_chain = chain;
        self
    }

    fn fallback_model(&self, model: &str) -> Option<&str> {
        self.fallback_chain.get(model).map(String::as_str)
    }

    /// Entry point: run `req` to completion, including fallback-model
    /// recursion when `fallback_enabled` and the primary model is exhausted.
    pub async fn execute(
        &self,
        req: AnthropicRequest,
        fallback_enabled: bool,
        cancel: CancelSignal,
    ) -> Result<ExecuteOutcome> {
        let model = req.model().to_string();
        self.execute_for_model_with_fallback(&req, model, fallback_enabled, cancel).await
    }

    fn execute_for_model_with_fallback<'a>(
        &'a self,
        req: &'a AnthropicRequest,
        model: String,
        fallback_enabled: bool,
        cancel: CancelSignal,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecuteOutcome>> + Send + 'a>>
    {
        Box::pin(async move {
            match self.execute_for_model(req, &model, cancel.clone()).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    let exhausted = matches!(
                        e,
                        Error::MaxRetriesExceeded | Error::RateLimited { .. } | Error::NoAccountsAvailable(_)
                    );
                    if fallback_enabled && exhausted {
                        if let Some(next_model) = self.fallback_model(&model) {
                            let next_model = next_model.to_string();
                            warn!(from = %model, to = %next_model, "falling back to next model");
                            metrics::counter!("proxy_executor_fallback_total", "from_model" => model.clone())
                                .increment(1);
                            return self
                                .execute_for_model_with_fallback(req, next_model, fallback_enabled, cancel)
                                .await;
                        }
                    }
                    Err(e)
                }
            }
        })
    }

    /// One model's worth of the outer attempt loop: select an account,
    /// attempt it, reclassify whatever the attempt raised, repeat.
    async fn execute_for_model(
        &self,
        req: &AnthropicRequest,
        model: &str,
        mut cancel: CancelSignal,
    ) -> Result<ExecuteOutcome> {
        let account_count = self.pool.get_account_count().await;
        let max_attempts = self.config.max_attempts(account_count);
        let mut attempt: u32 = 0;

        // Optimistic reset: rate-limit entries can outlive the condition that
        // set them (a quota window rolling over server-side, a stale
        // in-memory resetTime), so the first time a request for this model
        // finds the whole pool rate-limited, recheck reality once instead of
        // trusting the cached state and waiting out the full backoff.
        if self.pool.is_all_rate_limited(model).await {
            self.pool.reset_all_rate_limits().await;
        }

        loop {
            if is_cancelled(&cancel) {
                return Err(Error::Cancelled);
            }
            if attempt >= max_attempts {
                return Err(Error::MaxRetriesExceeded);
            }

            let available = self.pool.get_available_accounts(model).await;
            if available.is_empty() {
                if self.pool.is_all_rate_limited(model).await {
                    let min_wait = self.pool.get_min_wait_time_ms(model).await;
                    if min_wait > self.config.max_wait_before_error_ms {
                        return Err(self.rate_limited_error(model, min_wait));
                    }
                    self.sleep_or_cancel(Duration::from_millis(min_wait + 500), &mut cancel)
                        .await?;
                    continue;
                }
                return Err(Error::NoAccountsAvailable(model.to_string()));
            }

            let selection = self.pool.select_account(model).await;
            let Some(email) = selection.email else {
                let wait = if selection.wait_ms > 0 { selection.wait_ms } else { 1_000 };
                self.sleep_or_cancel(Duration::from_millis(wait), &mut cancel).await?;
                continue;
            };

            attempt += 1;
            match self.try_account(&email, model, req, &mut cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(AttemptError::Cancelled) => return Err(Error::Cancelled),
                Err(AttemptError::RateLimited { wait_ms, reason }) => {
                    self.pool.mark_rate_limited(&email, model, wait_ms, Some(reason)).await;
                }
                Err(AttemptError::PermanentAuth) => {
                    // already marked invalid inside try_account
                }
                Err(AttemptError::Network) => {
                    self.penalize_failure(&email, model).await;
                    self.sleep_or_cancel(Duration::from_millis(1_000), &mut cancel).await?;
                }
                Err(AttemptError::ServerExhausted) => {
                    self.penalize_failure(&email, model).await;
                }
            }
            metrics::counter!("proxy_executor_retries_total").increment(1);
        }
    }

    async fn penalize_failure(&self, email: &str, model: &str) {
        let failures = self.pool.notify_failure(email, model).await;
        if failures >= self.config.max_consecutive_failures {
            self.pool
                .mark_rate_limited(
                    email,
                    model,
                    self.config.extended_cooldown_ms,
                    Some("extended cooldown after repeated failures".to_string()),
                )
                .await;
        }
    }

    fn rate_limited_error(&self, model: &str, wait_ms: u64) -> Error {
        let next_available = format_unix_ms_iso8601(cloud_code_pool::account::now_ms() + wait_ms);
        Error::RateLimited {
            model: model.to_string(),
            wait_desc: describe_duration_ms(wait_ms),
            next_available,
        }
    }

    /// Attempt one account across the endpoint fallback list. Terminal
    /// results (success or a classification the outer loop must act on) are
    /// returned as `Err`/`Ok`; everything else is handled in place (sleep,
    /// advance endpoint, retry).
    async fn try_account(
        &self,
        email: &str,
        model: &str,
        req: &AnthropicRequest,
        cancel: &mut CancelSignal,
    ) -> std::result::Result<ExecuteOutcome, AttemptError> {
        let mut endpoint_idx = 0usize;
        let mut capacity_retries = 0usize;
        let mut saw_network_error = false;

        loop {
            if is_cancelled(cancel) {
                return Err(AttemptError::Cancelled);
            }
            if endpoint_idx >= self.endpoints.len() {
                return Err(if saw_network_error {
                    AttemptError::Network
                } else {
                    AttemptError::ServerExhausted
                });
            }
            let endpoint = self.endpoints[endpoint_idx].clone();

            let access_token = match self.pool.get_token_for_account(email).await {
                Ok(t) => t,
                Err(_) => return Err(AttemptError::ServerExhausted),
            };
            let project_id = match self.pool.get_project_for_account(email, &access_token).await {
                Ok(p) => p,
                Err(_) => return Err(AttemptError::ServerExhausted),
            };

            let stream_mode = req.wants_stream() || is_thinking_class_model(model);
            let payload = self.request_builder.build(req, &project_id);

            let response = match self
                .call_with_timeout(&endpoint, &access_token, model, &payload, stream_mode, cancel)
                .await
            {
                Ok(resp) => resp,
                Err(CallOutcome::Cancelled) => return Err(AttemptError::Cancelled),
                Err(CallOutcome::Failed) => {
                    saw_network_error = true;
                    endpoint_idx += 1;
                    continue;
                }
            };

            if (200..=299).contains(&response.status) {
                return self
                    .handle_success(email, model, &endpoint, &access_token, &payload, response, stream_mode, cancel)
                    .await
                    .map_err(|_| AttemptError::Cancelled);
            }

            let status = response.status;
            let retry_after = response.retry_after().map(str::to_string);
            let body_text = response.into_text().await;

            match classify_attempt(status, &body_text) {
                AttemptClassification::Success => unreachable!("2xx handled above"),
                AttemptClassification::PermanentAuth => {
                    let reason = format!("permanent auth failure ({status}): {body_text}");
                    let _ = self.pool.mark_invalid(email, reason).await;
                    return Err(AttemptError::PermanentAuth);
                }
                AttemptClassification::TransientAuth => {
                    let _ = self.pool.clear_token_cache(Some(email)).await;
                    let _ = self.pool.clear_project_cache(Some(email)).await;
                    endpoint_idx += 1;
                }
                AttemptClassification::Capacity => {
                    if capacity_retries < self.config.max_capacity_retries as usize {
                        let wait = self.config.capacity_backoff_ms(capacity_retries);
                        capacity_retries += 1;
                        metrics::counter!("proxy_executor_capacity_backoff_total").increment(1);
                        self.sleep_or_cancel_attempt(Duration::from_millis(wait), cancel).await?;
                    } else if status == 429 {
                        let reset = parse_reset_time_ms(retry_after.as_deref(), &body_text);
                        let wait = calculate_smart_backoff(&self.config, &body_text, reset, capacity_retries);
                        return Err(AttemptError::RateLimited { wait_ms: wait, reason: body_text });
                    } else {
                        return Err(AttemptError::ServerExhausted);
                    }
                }
                AttemptClassification::RateLimit => {
                    let reset = parse_reset_time_ms(retry_after.as_deref(), &body_text);
                    let wait = calculate_smart_backoff(&self.config, &body_text, reset, 0);
                    return Err(AttemptError::RateLimited { wait_ms: wait, reason: body_text });
                }
                AttemptClassification::ServerError => {
                    self.sleep_or_cancel_attempt(Duration::from_millis(1_000), cancel).await?;
                    endpoint_idx += 1;
                }
                AttemptClassification::OtherClientError => {
                    debug!(email, status, "non-retryable client error, trying next endpoint");
                    endpoint_idx += 1;
                }
            }
        }
    }

    async fn call_with_timeout(
        &self,
        endpoint: &str,
        access_token: &str,
        model: &str,
        payload: &Value,
        stream: bool,
        cancel: &mut CancelSignal,
    ) -> std::result::Result<UpstreamResponse, CallOutcome> {
        let call = self.upstream.call(endpoint, access_token, model, payload, stream);
        let timed = tokio::time::timeout(self.config.request_timeout(), call);
        tokio::select! {
            res = timed => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(_)) | Err(_) => Err(CallOutcome::Failed),
            },
            _ = cancel.changed() => Err(CallOutcome::Cancelled),
        }
    }

    /// Handles a 2xx response: decode, and for streaming responses apply
    /// the empty-response refetch policy (spec.md §4.3) before declaring
    /// success to the pool.
    #[allow(clippy::too_many_arguments)]
    async fn handle_success(
        &self,
        email: &str,
        model: &str,
        endpoint: &str,
        access_token: &str,
        payload: &Value,
        response: UpstreamResponse,
        stream_mode: bool,
        cancel: &mut CancelSignal,
    ) -> std::result::Result<ExecuteOutcome, ()> {
        if !stream_mode {
            let text = response.into_text().await;
            let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
            self.pool.notify_success(email, model).await;
            return Ok(ExecuteOutcome::NonStreaming(value));
        }

        let mut events = self.decode_stream_events(response).await;
        let mut empty_retries = 0u32;
        let mut backoff_ms = 500u64;

        while events.is_empty() && empty_retries < self.config.max_empty_response_retries {
            if is_cancelled(cancel) {
                return Err(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = cancel.changed() => return Err(()),
            }
            backoff_ms *= 2;
            empty_retries += 1;

            let retry = self.upstream.call(endpoint, access_token, model, payload, true);
            let timed = tokio::time::timeout(self.config.request_timeout(), retry).await;
            if let Ok(Ok(resp)) = timed
                && (200..=299).contains(&resp.status)
            {
                events = self.decode_stream_events(resp).await;
            }
        }

        if events.is_empty() {
            events = synthetic_empty_response_events(model, empty_retries);
        }

        self.pool.notify_success(email, model).await;
        Ok(ExecuteOutcome::Streaming(events))
    }

    async fn decode_stream_events(&self, response: UpstreamResponse) -> Vec<Value> {
        use crate::sse::SseDecoder;
        use futures_util::StreamExt;

        let body = match response.body {
            crate::upstream::UpstreamBody::Streamed(s) => s,
            crate::upstream::UpstreamBody::Buffered(bytes) => {
                Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
            }
        };
        let mut decoder = SseDecoder::new(body);
        let mut events = Vec::new();
        while let Some(Ok(event)) = decoder.next().await {
            if event.data.is_empty() {
                continue;
            }
            let value = serde_json::from_str::<Value>(&event.data)
                .unwrap_or_else(|_| serde_json::json!({"type": event.event, "data": event.data}));
            events.push(value);
        }
        events
    }

    async fn sleep_or_cancel(&self, duration: Duration, cancel: &mut CancelSignal) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.changed() => Err(Error::Cancelled),
        }
    }

    async fn sleep_or_cancel_attempt(
        &self,
        duration: Duration,
        cancel: &mut CancelSignal,
    ) -> std::result::Result<(), AttemptError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.changed() => Err(AttemptError::Cancelled),
        }
    }
}

enum CallOutcome {
    Failed,
    Cancelled,
}

/// A short human description of a millisecond duration ("2m 0s" / "45s"),
/// used in the `RateLimited` error message.
fn describe_duration_ms(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Synthesized event sequence returned to the client when every refetch of
/// an empty streaming response still came back empty (spec.md §4.3): the
/// call is reported as a success carrying an explanatory message rather than
/// propagated as an error, since the upstream technically answered.
fn synthetic_empty_response_events(model: &str, retries: u32) -> Vec<Value> {
    vec![
        serde_json::json!({
            "type": "content_block_delta",
            "delta": {
                "type": "text_delta",
                "text": format!(
                    "The upstream model \"{model}\" returned an empty response after {retries} retries. Please try again.",
                ),
            }
        }),
        serde_json::json!({ "type": "message_stop" }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::request::PassthroughRequestBuilder;
    use crate::upstream::{BoxByteStream, UpstreamBody};
    use cloud_code_auth::{AccountRecord, AccountSource, AccountStore, QuotaState};
    use cloud_code_pool::RoundRobin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn account_record(email: &str) -> AccountRecord {
        AccountRecord {
            email: email.to_string(),
            source: AccountSource::Oauth,
            enabled: true,
            refresh_token: "rt".into(),
            access_token: "at".into(),
            expires: cloud_code_pool::account::now_ms() + 3_600_000,
            project_id: None,
            added_at: 0,
            is_invalid: false,
            invalid_reason: None,
            last_used: None,
            subscription: Some(cloud_code_auth::Subscription {
                tier: "test".into(),
                project_id: Some("proj-1".into()),
                detected_at: 0,
            }),
            quota: QuotaState::default(),
        }
    }

    async fn pool_with(emails: &[&str]) -> Arc<Pool> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::load(dir.path().join("accounts.json")).await.unwrap());
        let mut records = Vec::new();
        for email in emails {
            let r = account_record(email);
            store.add(r.clone()).await.unwrap();
            records.push(r);
        }
        Arc::new(Pool::new(records, store, Box::new(RoundRobin::default()), reqwest::Client::new()))
    }

    /// Scripted upstream: each call consumes the next canned response for
    /// its endpoint, looping forever on the last one once exhausted.
    struct ScriptedUpstream {
        responses: Mutex<Vec<(u16, HashMap<String, String>, &'static str)>>,
        cursor: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(responses: Vec<(u16, HashMap<String, String>, &'static str)>) -> Self {
            Self {
                responses: Mutex::new(responses),
                cursor: AtomicUsize::new(0),
            }
        }
    }

    impl Upstream for ScriptedUpstream {
        fn call<'a>(
            &'a self,
            _endpoint: &'a str,
            _access_token: &'a str,
            _model: &'a str,
            _payload: &'a Value,
            _stream: bool,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<UpstreamResponse, String>> + Send + 'a>>
        {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let scripted = self.responses.lock().unwrap();
            let (status, headers, body) = scripted[idx.min(scripted.len() - 1)].clone();
            Box::pin(async move {
                Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Buffered(Bytes::from_static(body.as_bytes())),
                })
            })
        }
    }

    use bytes::Bytes;

    fn streaming_body(sse: &'static str) -> BoxByteStream {
        Box::pin(futures_util::stream::once(async move {
            Ok::<_, String>(Bytes::from_static(sse.as_bytes()))
        }))
    }

    fn req(model: &str, stream: bool) -> AnthropicRequest {
        AnthropicRequest::new(serde_json::json!({"model": model, "stream": stream, "messages": []}))
    }

    #[tokio::test]
    async fn happy_path_non_streaming_returns_value() {
        let pool = pool_with(&["a@x.com"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![(
            200,
            HashMap::new(),
            r#"{"id":"msg_1","content":[]}"#,
        )]));
        let exec = Executor::new(
            pool,
            upstream,
            Arc::new(PassthroughRequestBuilder),
            ExecutorConfig::default(),
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::NonStreaming(v) => assert_eq!(v["id"], "msg_1"),
            _ => panic!("expected non-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn stale_rate_limit_is_optimistically_reset_before_first_attempt() {
        // The account carries a rate-limit entry that hasn't expired yet, but
        // since the whole pool reads as rate-limited, the executor should
        // recheck reality once up front rather than waiting out the window.
        let pool = pool_with(&["a@x.com"]).await;
        pool.mark_rate_limited("a@x.com", "gemini-pro", 3_600_000, Some("stale".into())).await;
        assert!(pool.is_all_rate_limited("gemini-pro").await);

        let upstream = Arc::new(ScriptedUpstream::new(vec![(
            200,
            HashMap::new(),
            r#"{"id":"msg_reset"}"#,
        )]));
        let exec = Executor::new(
            pool,
            upstream,
            Arc::new(PassthroughRequestBuilder),
            ExecutorConfig::default(),
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::NonStreaming(v) => assert_eq!(v["id"], "msg_reset"),
            _ => panic!("expected non-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn single_account_429_with_retry_after_reports_rate_limited() {
        // Single account, 429 with a server Retry-After: once marked
        // rate-limited there is nowhere else to go, so the pool-exhaustion
        // branch reports RateLimited rather than spinning.
        let pool = pool_with(&["only@x.com"]).await;
        let headers = HashMap::from([("retry-after".to_string(), "1".to_string())]);
        let upstream = Arc::new(ScriptedUpstream::new(vec![(429, headers, r#"{"error":"rate limited"}"#)]));
        let mut cfg = ExecutorConfig::default();
        cfg.max_wait_before_error_ms = 0;
        let exec = Executor::new(
            pool,
            upstream,
            Arc::new(PassthroughRequestBuilder),
            cfg,
            vec!["https://endpoint-a".to_string()],
        );
        let err = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap_err();
        match err {
            Error::RateLimited { model, .. } => assert_eq!(model, "gemini-pro"),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_account_failover_succeeds_on_second_account() {
        let pool = pool_with(&["a@x.com", "b@x.com"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            (429, HashMap::new(), r#"{"error":"rate limited"}"#),
            (200, HashMap::new(), r#"{"id":"msg_ok"}"#),
        ]));
        let exec = Executor::new(
            pool,
            upstream,
            Arc::new(PassthroughRequestBuilder),
            ExecutorConfig::default(),
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::NonStreaming(v) => assert_eq!(v["id"], "msg_ok"),
            _ => panic!("expected non-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn capacity_burst_retries_in_place_then_succeeds() {
        let pool = pool_with(&["a@x.com"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            (503, HashMap::new(), r#"{"error":"model_capacity_exhausted"}"#),
            (503, HashMap::new(), r#"{"error":"model_capacity_exhausted"}"#),
            (200, HashMap::new(), r#"{"id":"msg_ok"}"#),
        ]));
        let mut cfg = ExecutorConfig::default();
        cfg.capacity_backoff_tiers_ms = vec![1, 1, 1];
        let exec = Executor::new(
            pool,
            upstream,
            Arc::new(PassthroughRequestBuilder),
            cfg,
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::NonStreaming(v) => assert_eq!(v["id"], "msg_ok"),
            _ => panic!("expected non-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn recursive_fallback_switches_model_when_primary_exhausted() {
        let pool = pool_with(&["only@x.com"]).await;
        let headers = HashMap::from([("retry-after".to_string(), "1".to_string())]);
        struct PerModelUpstream;
        impl Upstream for PerModelUpstream {
            fn call<'a>(
                &'a self,
                _endpoint: &'a str,
                _access_token: &'a str,
                model: &'a str,
                _payload: &'a Value,
                _stream: bool,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = std::result::Result<UpstreamResponse, String>> + Send + 'a>,
            > {
                let model = model.to_string();
                Box::pin(async move {
                    if model == "gemini-pro" {
                        Ok(UpstreamResponse {
                            status: 429,
                            headers: HashMap::from([("retry-after".to_string(), "1".to_string())]),
                            body: UpstreamBody::Buffered(Bytes::from_static(b"{\"error\":\"rate limited\"}")),
                        })
                    } else {
                        Ok(UpstreamResponse {
                            status: 200,
                            headers: HashMap::new(),
                            body: UpstreamBody::Buffered(Bytes::from_static(b"{\"id\":\"msg_flash\"}")),
                        })
                    }
                })
            }
        }
        let _ = headers;
        let mut chain = HashMap::new();
        chain.insert("gemini-pro".to_string(), "gemini-flash".to_string());
        // Force the pool-exhaustion branch to fire immediately on the first
        // rate limit instead of sleeping through real-time retries.
        let mut cfg = ExecutorConfig::default();
        cfg.max_wait_before_error_ms = 0;
        let exec = Executor::new(
            pool,
            Arc::new(PerModelUpstream),
            Arc::new(PassthroughRequestBuilder),
            cfg,
            vec!["https://endpoint-a".to_string()],
        )
        .with_fallback_chain(chain);
        let out = exec
            .execute(req("gemini-pro", false), true, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::NonStreaming(v) => assert_eq!(v["id"], "msg_flash"),
            _ => panic!("expected non-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn permanent_auth_failure_marks_account_invalid_and_fails() {
        let pool = pool_with(&["only@x.com"]).await;
        let upstream = Arc::new(ScriptedUpstream::new(vec![(
            401,
            HashMap::new(),
            r#"{"error":"auth_invalid_permanent"}"#,
        )]));
        let exec = Executor::new(
            pool.clone(),
            upstream,
            Arc::new(PassthroughRequestBuilder),
            ExecutorConfig::default(),
            vec!["https://endpoint-a".to_string()],
        );
        let err = exec
            .execute(req("gemini-pro", false), false, crate::cancel::never_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAccountsAvailable(_) | Error::MaxRetriesExceeded));
        let accounts = pool.get_all_accounts().await;
        assert!(accounts[0].is_invalid);
    }

    #[tokio::test]
    async fn streaming_response_decodes_sse_events() {
        let pool = pool_with(&["a@x.com"]).await;
        struct StreamingUpstream;
        impl Upstream for StreamingUpstream {
            fn call<'a>(
                &'a self,
                _endpoint: &'a str,
                _access_token: &'a str,
                _model: &'a str,
                _payload: &'a Value,
                _stream: bool,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = std::result::Result<UpstreamResponse, String>> + Send + 'a>,
            > {
                Box::pin(async move {
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: HashMap::new(),
                        body: UpstreamBody::Streamed(streaming_body(
                            "event: message\ndata: {\"type\":\"content_block_delta\"}\n\n",
                        )),
                    })
                })
            }
        }
        let exec = Executor::new(
            pool,
            Arc::new(StreamingUpstream),
            Arc::new(PassthroughRequestBuilder),
            ExecutorConfig::default(),
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", true), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::Streaming(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0]["type"], "content_block_delta");
            }
            _ => panic!("expected streaming outcome"),
        }
    }

    #[tokio::test]
    async fn empty_stream_exhausts_retries_and_returns_synthetic_message() {
        let pool = pool_with(&["a@x.com"]).await;
        struct EmptyStreamUpstream;
        impl Upstream for EmptyStreamUpstream {
            fn call<'a>(
                &'a self,
                _endpoint: &'a str,
                _access_token: &'a str,
                _model: &'a str,
                _payload: &'a Value,
                _stream: bool,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = std::result::Result<UpstreamResponse, String>> + Send + 'a>,
            > {
                Box::pin(async move {
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: HashMap::new(),
                        body: UpstreamBody::Streamed(streaming_body("")),
                    })
                })
            }
        }
        let mut cfg = ExecutorConfig::default();
        cfg.max_empty_response_retries = 1;
        let exec = Executor::new(
            pool,
            Arc::new(EmptyStreamUpstream),
            Arc::new(PassthroughRequestBuilder),
            cfg,
            vec!["https://endpoint-a".to_string()],
        );
        let out = exec
            .execute(req("gemini-pro", true), false, crate::cancel::never_cancelled())
            .await
            .unwrap();
        match out {
            ExecuteOutcome::Streaming(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[1]["type"], "message_stop");
            }
            _ => panic!("expected streaming outcome"),
        }
    }
}
