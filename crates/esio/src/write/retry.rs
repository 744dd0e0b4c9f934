//! 🔄 retry.rs: "have you tried sending it again?" but with rules.
//!
//! One bulk body goes in. The first send is unconditional. After that:
//!
//! - no [`RetryPolicy`]: a transport error is final, and so is whatever the server said
//! - with a policy: transport errors and responses the [`RetryPredicate`] flags (429s,
//!   by default) get re-sent, identical body, exponential backoff, until the policy runs
//!   out of attempts or time. Running out is [`ConnectorError::RetryExhausted`].
//!
//! ⏱️ Backoff starts at `initial_backoff` and doubles. A sleep never extends past
//! `max_duration` of cumulative waiting. Only the calling worker sleeps.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backends::BulkTransport;
use crate::error::{ConnectorError, Result};
use crate::write::response::item_outcome;

/// ⏱️ First pause between attempts when nobody says otherwise.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// 🤔 Should this (successfully delivered) response be sent again?
pub trait RetryPredicate: std::fmt::Debug + Send + Sync {
    fn should_retry(&self, response: &Value) -> bool;
}

/// 🐢 `errors` is set and some item came back with `status`. 429 unless told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottledItemPredicate {
    pub status: u64,
}

impl Default for ThrottledItemPredicate {
    fn default() -> Self {
        Self { status: 429 }
    }
}

impl RetryPredicate for ThrottledItemPredicate {
    fn should_retry(&self, response: &Value) -> bool {
        if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            return false;
        }
        response
            .get("items")
            .and_then(Value::as_array)
            .is_some_and(|items| {
                items.iter().any(|item| {
                    item_outcome(item)
                        .and_then(|outcome| outcome.get("status"))
                        .and_then(Value::as_u64)
                        == Some(self.status)
                })
            })
    }
}

/// 📐 How hard to try.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 🔢 total sends, the first one included
    pub max_attempts: u32,
    /// ⏱️ cap on cumulative time spent sleeping between sends
    pub max_duration: Duration,
    pub initial_backoff: Duration,
    pub predicate: Arc<dyn RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_duration: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ConnectorError::Configuration(
                "retry max attempts must be at least 1".to_string(),
            ));
        }
        if max_duration.is_zero() {
            return Err(ConnectorError::Configuration(
                "retry max duration must be > 0".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            max_duration,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            predicate: Arc::new(ThrottledItemPredicate::default()),
        })
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn RetryPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// ⏱️ Pause before send number `attempt + 1`: initial × 2^(attempt-1).
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

/// 📬 The response that ended the loop, and how many sends it took.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub response: Value,
    pub attempts: u32,
}

/// 🔄 Sends a bulk body under an optional [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: Option<RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(policy: Option<RetryPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> Option<&RetryPolicy> {
        self.policy.as_ref()
    }

    pub async fn send(&self, transport: &dyn BulkTransport, body: &str) -> Result<SendOutcome> {
        let Some(ref policy) = self.policy else {
            let text = transport.send_bulk(body).await?;
            return Ok(SendOutcome {
                response: parse_response(&text)?,
                attempts: 1,
            });
        };

        let mut attempts: u32 = 0;
        let mut waited = Duration::ZERO;
        loop {
            attempts += 1;
            match transport.send_bulk(body).await {
                Ok(text) => {
                    let response = parse_response(&text)?;
                    if !policy.predicate.should_retry(&response) {
                        return Ok(SendOutcome { response, attempts });
                    }
                    warn!("🐢 the cluster is throttling us (attempt {attempts})");
                }
                Err(e) if e.is_transport() => {
                    warn!("🔌 bulk send failed on attempt {attempts}: {e}");
                }
                Err(e) => return Err(e),
            }

            if attempts >= policy.max_attempts {
                return Err(ConnectorError::RetryExhausted { attempts });
            }
            let remaining = policy.max_duration.saturating_sub(waited);
            if remaining.is_zero() {
                return Err(ConnectorError::RetryExhausted { attempts });
            }
            let pause = policy.backoff_for(attempts).min(remaining);
            debug!("⏱️ backing off for {pause:?}");
            tokio::time::sleep(pause).await;
            waited += pause;
            warn!("🔄 retry attempt {attempts}");
        }
    }
}

fn parse_response(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| {
        ConnectorError::MalformedResponse(format!("the bulk endpoint did not answer with JSON: {e}"))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 🎭 A transport that plays back a script and writes down what it was sent.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<String>>>,
        pub(crate) sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sends(&self) -> usize {
            self.sent.lock().map(|s| s.len()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl BulkTransport for ScriptedTransport {
        async fn send_bulk(&self, payload: &str) -> Result<String> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(payload.to_string());
            }
            self.replies
                .lock()
                .ok()
                .and_then(|mut r| r.pop_front())
                .unwrap_or_else(|| Ok(ok_reply()))
        }
    }

    pub(crate) fn ok_reply() -> String {
        json!({"errors": false, "items": [{"index": {"_id": "1", "status": 201}}]}).to_string()
    }

    pub(crate) fn throttled_reply() -> String {
        json!({"errors": true, "items": [
            {"index": {"_id": "1", "status": 201}},
            {"index": {"_id": "2", "status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}}
        ]})
        .to_string()
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(5))
            .expect("💀 the test policy is valid")
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn the_one_where_two_429s_and_a_success_make_three_sends() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new(vec![
            Ok(throttled_reply()),
            Ok(throttled_reply()),
            Ok(ok_reply()),
        ]);
        let executor = RetryExecutor::new(Some(quick_policy(3)));
        let outcome = executor.send(&transport, "body\n").await?;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.sends(), 3);
        assert!(transport.sent.lock().map(|s| s.iter().all(|b| b == "body\n")).unwrap_or(false));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_patience_runs_out() {
        let transport = ScriptedTransport::new(vec![
            Ok(throttled_reply()),
            Ok(throttled_reply()),
            Ok(throttled_reply()),
        ]);
        let executor = RetryExecutor::new(Some(quick_policy(2)));
        let err = executor.send(&transport, "body\n").await.expect_err("💀 should give up");
        assert!(matches!(err, ConnectorError::RetryExhausted { attempts: 2 }));
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test]
    async fn the_one_where_no_policy_means_no_second_chances() {
        let transport = ScriptedTransport::new(vec![Err(ConnectorError::Connection(
            "connection reset".to_string(),
        ))]);
        let err = RetryExecutor::new(None)
            .send(&transport, "body\n")
            .await
            .expect_err("💀 no policy, no retry");
        assert!(err.is_transport());
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn the_one_where_a_policy_rides_out_a_dropped_connection() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new(vec![
            Err(ConnectorError::Connection("timed out".to_string())),
            Ok(ok_reply()),
        ]);
        let outcome = RetryExecutor::new(Some(quick_policy(3)))
            .send(&transport, "body\n")
            .await?;
        assert_eq!(outcome.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_without_a_policy_a_429_is_returned_as_is() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new(vec![Ok(throttled_reply())]);
        let outcome = RetryExecutor::new(None).send(&transport, "body\n").await?;
        assert_eq!(outcome.attempts, 1);
        assert!(ThrottledItemPredicate::default().should_retry(&outcome.response));
        Ok(())
    }

    #[test]
    fn the_one_where_backoff_doubles_like_it_promised() -> anyhow::Result<()> {
        let policy = RetryPolicy::new(10, Duration::from_secs(60))?;
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(20));
        Ok(())
    }

    #[test]
    fn the_one_where_the_predicate_ignores_clean_responses() {
        let predicate = ThrottledItemPredicate::default();
        assert!(!predicate.should_retry(&json!({"errors": false, "items": [{"index": {"status": 429}}]})));
        assert!(!predicate.should_retry(&json!({"errors": true, "items": [{"index": {"status": 400}}]})));
        assert!(predicate.should_retry(&json!({"errors": true, "items": [{"create": {"status": 429}}]})));
    }

    #[tokio::test]
    async fn the_one_where_a_real_connection_rides_out_two_http_429s() -> anyhow::Result<()> {
        use crate::connection::{Connection, ConnectionConfig};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(429).set_body_string("too many requests"))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ok_reply()))
            .mount(&server)
            .await;

        let connection =
            Connection::open(&ConnectionConfig::new(vec![server.uri()], "idx", "_doc")?).await?;
        let executor = RetryExecutor::new(Some(quick_policy(3)));
        let outcome = executor.send(&connection, "{\"index\":{}}\n{}\n").await?;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.response["errors"], false);
        let sends = server.received_requests().await.unwrap_or_default().len();
        assert_eq!(sends, 3);
        Ok(())
    }
}
