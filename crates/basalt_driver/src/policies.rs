//! Pluggable strategies consumed by the cluster runtime: load balancing,
//! retries, reconnection backoff, speculative executions, and authentication.
//!
//! The driver ships working defaults for each so a bare config runs out of
//! the box; anything beyond the interface contract is up to implementors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basalt_proto::messages::WriteType;
use basalt_proto::Consistency;

use crate::cluster::{Host, Metadata};
use crate::errors::AttemptError;

/// Distance classification driving per-host pool sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    /// No pool is kept; the host is skipped by query plans.
    Ignored,
}

/// Produces the ordered host plan for each query.
pub trait LoadBalancingPolicy: Send + Sync {
    fn distance(&self, host: &Host) -> HostDistance;

    /// A finite, non-restartable sequence of hosts to try, in order.
    fn query_plan(&self, metadata: &Metadata) -> Box<dyn Iterator<Item = Arc<Host>> + Send>;
}

/// Rotating round-robin over all up hosts.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn query_plan(&self, metadata: &Metadata) -> Box<dyn Iterator<Item = Arc<Host>> + Send> {
        let mut hosts = metadata.all_hosts();
        hosts.sort_by_key(|host| host.address());
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        // Try up hosts first, then the rest as a last resort.
        let (up, down): (Vec<_>, Vec<_>) = hosts.into_iter().partition(|host| host.is_up());
        Box::new(up.into_iter().chain(down))
    }
}

/// Outcome of a retry-policy consultation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host, optionally at a different consistency.
    RetrySame(Option<Consistency>),
    /// Advance the host plan and retry, optionally at a different consistency.
    RetryNext(Option<Consistency>),
    /// Surface the error to the caller.
    Rethrow,
    /// Swallow the error and complete with an empty result.
    Ignore,
}

/// Classifies server errors and timeouts into retry decisions.
pub trait RetryPolicy: Send + Sync {
    fn on_read_timeout(
        &self,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        consistency: Consistency,
        write_type: WriteType,
        received: i32,
        block_for: i32,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_unavailable(
        &self,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: u32,
    ) -> RetryDecision;

    /// Consulted for connection errors, overload signals, and client-side
    /// attempt timeouts.
    fn on_request_error(&self, error: &AttemptError, retry_count: u32) -> RetryDecision;
}

/// The stock policy: retry at most once, and only when the retry has a real
/// chance of succeeding (enough replicas responded, or a different host can
/// be tried).
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        _consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        if received >= block_for && !data_present {
            // Enough replicas answered but the data was missing; the retry
            // hits the repaired read.
            RetryDecision::RetrySame(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        _consistency: Consistency,
        write_type: WriteType,
        _received: i32,
        _block_for: i32,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count == 0 && write_type == WriteType::BatchLog {
            RetryDecision::RetrySame(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_unavailable(
        &self,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        retry_count: u32,
    ) -> RetryDecision {
        // The coordinator itself may be isolated; trying the next host is
        // more promising than retrying it.
        if retry_count == 0 {
            RetryDecision::RetryNext(None)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, _error: &AttemptError, _retry_count: u32) -> RetryDecision {
        RetryDecision::RetryNext(None)
    }
}

/// Never retries; every error is rethrown unchanged.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: Consistency, _: i32, _: i32, _: bool, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(
        &self,
        _: Consistency,
        _: WriteType,
        _: i32,
        _: i32,
        _: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(&self, _: Consistency, _: i32, _: i32, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_request_error(&self, _: &AttemptError, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Generates the delay schedule used after a host goes down.
pub trait ReconnectionPolicy: Send + Sync {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Exponential backoff, doubling from a base delay up to a cap.
#[derive(Debug)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ExponentialReconnectionPolicy {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let base_ms = self.base_delay.as_millis().max(1) as u64;
        let max = self.max_delay;
        Box::new((0u32..).map(move |attempt| {
            let factor = 1u64 << attempt.min(20);
            Duration::from_millis(base_ms.saturating_mul(factor)).min(max)
        }))
    }
}

/// Fixed delay between attempts.
#[derive(Debug)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        ConstantReconnectionPolicy { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(std::iter::repeat(self.delay))
    }
}

/// Schedules redundant attempts on further hosts while the first attempt is
/// still pending. Opt-in: side effects may execute more than once.
pub trait SpeculativeExecutionPolicy: Send + Sync {
    /// Delay before launching speculative execution number `execution`
    /// (1-based), or `None` to stop spawning.
    fn next_delay(&self, execution: usize) -> Option<Duration>;
}

/// Speculative executions disabled.
#[derive(Debug, Default)]
pub struct NoSpeculativeExecutionPolicy;

impl SpeculativeExecutionPolicy for NoSpeculativeExecutionPolicy {
    fn next_delay(&self, _execution: usize) -> Option<Duration> {
        None
    }
}

/// A fixed delay between executions, up to a bound.
#[derive(Debug)]
pub struct ConstantSpeculativeExecutionPolicy {
    pub delay: Duration,
    pub max_executions: usize,
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn next_delay(&self, execution: usize) -> Option<Duration> {
        (execution <= self.max_executions).then_some(self.delay)
    }
}

/// One authentication exchange with one node.
pub trait Authenticator: Send + Sync {
    fn initial_response(&self) -> Option<Vec<u8>>;

    /// Respond to an AUTH_CHALLENGE token.
    fn evaluate_challenge(&self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, String>;

    /// Final token delivered with AUTH_SUCCESS.
    fn on_success(&self, _token: Option<&[u8]>) {}
}

/// Creates authenticators on demand, once the server names its authenticator
/// class in the AUTHENTICATE response.
pub trait AuthProvider: Send + Sync {
    fn new_authenticator(
        &self,
        address: SocketAddr,
        authenticator_class: &str,
    ) -> Box<dyn Authenticator>;
}

/// Username/password authentication in the SASL PLAIN shape.
#[derive(Clone)]
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthProvider {
            username: username.into(),
            password: password.into(),
        }
    }
}

struct PlainTextAuthenticator {
    token: Vec<u8>,
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&self) -> Option<Vec<u8>> {
        Some(self.token.clone())
    }

    fn evaluate_challenge(&self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, String> {
        Err("plain-text authenticator does not expect a challenge".into())
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn new_authenticator(
        &self,
        _address: SocketAddr,
        _authenticator_class: &str,
    ) -> Box<dyn Authenticator> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Box::new(PlainTextAuthenticator { token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_and_caps() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(450),
        );
        let delays: Vec<_> = policy.new_schedule().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(450),
            ]
        );
    }

    #[test]
    fn default_retry_policy_is_single_shot() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_unavailable(Consistency::Quorum, 2, 1, 0),
            RetryDecision::RetryNext(None)
        );
        assert_eq!(
            policy.on_unavailable(Consistency::Quorum, 2, 1, 1),
            RetryDecision::Rethrow
        );
        assert_eq!(
            policy.on_read_timeout(Consistency::Quorum, 2, 2, false, 0),
            RetryDecision::RetrySame(None)
        );
        assert_eq!(
            policy.on_read_timeout(Consistency::Quorum, 1, 2, false, 0),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn constant_speculative_policy_is_bounded() {
        let policy = ConstantSpeculativeExecutionPolicy {
            delay: Duration::from_millis(10),
            max_executions: 2,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn plain_text_token_layout() {
        let provider = PlainTextAuthProvider::new("user", "pass");
        let authenticator =
            provider.new_authenticator("127.0.0.1:9042".parse().unwrap(), "org.example.Auth");
        let token = authenticator.initial_response().unwrap();
        assert_eq!(token, b"\0user\0pass");
    }
}
