//! HTTP transport for provider calls: per-operation timeouts, retry with
//! jittered exponential backoff, `Retry-After` handling, and keep-alive.

use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::providers::LlmOp;
use crate::error::{QmdError, Result};

/// Retry budget per call.
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff delays never exceed this.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default per-operation timeouts: embed 30s, rerank 15s, generate 60s.
pub fn op_timeout(op: LlmOp, override_: Option<Duration>) -> Duration {
    if let Some(t) = override_ {
        return t;
    }
    match op {
        LlmOp::Embed => Duration::from_secs(30),
        LlmOp::Rerank => Duration::from_secs(15),
        LlmOp::Expand => Duration::from_secs(60),
    }
}

/// Statuses worth another attempt: timeouts, early hints gone wrong,
/// rate limits, and server errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..=599).contains(&status)
}

/// Jittered exponential backoff for `attempt` (0-based), honoring a
/// `Retry-After` value as the minimum delay. Capped at [`MAX_BACKOFF`].
pub fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
    let mut delay = base + jitter;
    if let Some(ra) = retry_after {
        delay = delay.max(ra);
    }
    delay.min(MAX_BACKOFF)
}

pub struct Transport {
    client: reqwest::Client,
    timeout_override: Option<Duration>,
}

impl Transport {
    pub fn new(timeout_override: Option<Duration>) -> Self {
        // reqwest pools connections per host; an idle timeout well above
        // the operation timeouts keeps them warm across pipeline stages.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("reqwest client");
        Self {
            client,
            timeout_override,
        }
    }

    /// POST a JSON body and parse the typed response. Retries network
    /// errors and retryable statuses up to [`MAX_ATTEMPTS`]; every attempt
    /// is bounded by the per-operation timeout, which aborts the inflight
    /// request.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        provider: &'static str,
        op: LlmOp,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
    ) -> Result<T> {
        let timeout = op_timeout(op, self.timeout_override);
        let mut last_err: Option<QmdError> = None;
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1, retry_after.take())).await;
            }

            let mut req = self
                .client
                .post(url)
                .timeout(timeout)
                .header("Content-Type", "application/json");
            let mut has_connection = false;
            for (name, value) in headers {
                if name.eq_ignore_ascii_case("connection") {
                    has_connection = true;
                }
                req = req.header(*name, value);
            }
            if !has_connection {
                req = req.header("Connection", "keep-alive");
            }

            match req.json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response.bytes().await.map_err(|e| QmdError::Provider {
                            provider,
                            op: op.name(),
                            status: None,
                            message: format!("reading response body: {e}"),
                            url: url.to_string(),
                        })?;
                        return serde_json::from_slice(&bytes).map_err(|e| QmdError::Provider {
                            provider,
                            op: op.name(),
                            status: Some(status.as_u16()),
                            message: format!("unexpected response shape: {e}"),
                            url: url.to_string(),
                        });
                    }

                    retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let code = status.as_u16();
                    let snippet = body_snippet(response.text().await.unwrap_or_default());

                    let err = QmdError::Provider {
                        provider,
                        op: op.name(),
                        status: Some(code),
                        message: snippet,
                        url: url.to_string(),
                    };

                    if is_retryable_status(code) {
                        tracing::debug!(provider, op = op.name(), status = code, attempt, "retryable provider error");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    if e.is_timeout() {
                        tracing::debug!(provider, op = op.name(), attempt, "request timed out");
                    }
                    last_err = Some(QmdError::Provider {
                        provider,
                        op: op.name(),
                        status: None,
                        message: e.to_string(),
                        url: url.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(QmdError::Provider {
            provider,
            op: op.name(),
            status: None,
            message: "request failed with no recorded error".to_string(),
            url: url.to_string(),
        }))
    }
}

/// First ≤500 bytes of a response body, on a char boundary.
fn body_snippet(body: String) -> String {
    if body.len() <= 500 {
        return body;
    }
    let mut end = 500;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for code in [408u16, 425, 429, 500, 502, 503, 599] {
            assert!(is_retryable_status(code), "{code} must be retryable");
        }
        for code in [400u16, 401, 403, 404, 422, 301] {
            assert!(!is_retryable_status(code), "{code} must not be retryable");
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0, None);
        assert!(d0 >= Duration::from_millis(500) && d0 < Duration::from_millis(800));

        let d2 = backoff_delay(2, None);
        assert!(d2 >= Duration::from_millis(2000));

        // High attempts stay under the cap.
        assert!(backoff_delay(30, None) <= MAX_BACKOFF);
    }

    #[test]
    fn retry_after_is_a_floor() {
        let d = backoff_delay(0, Some(Duration::from_secs(10)));
        assert!(d >= Duration::from_secs(10));
        // And is still capped.
        let d = backoff_delay(0, Some(Duration::from_secs(120)));
        assert_eq!(d, MAX_BACKOFF);
    }

    #[test]
    fn op_timeout_defaults_and_override() {
        assert_eq!(op_timeout(LlmOp::Embed, None), Duration::from_secs(30));
        assert_eq!(op_timeout(LlmOp::Rerank, None), Duration::from_secs(15));
        assert_eq!(op_timeout(LlmOp::Expand, None), Duration::from_secs(60));
        assert_eq!(
            op_timeout(LlmOp::Embed, Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn snippet_is_bounded() {
        let long = "x".repeat(2000);
        assert_eq!(body_snippet(long).len(), 500);
        assert_eq!(body_snippet("short".to_string()), "short");
    }
}
