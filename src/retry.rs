//! Retry/failover across an endpoint pool.
//!
//! One request walks an [`AttemptPlan`]: the weighted pick first, then the rest
//! of the pool in configured order, each endpoint tried up to
//! `max_retries + 1` times with exponential backoff between tries.

use std::time::Duration;

use axum::response::Response;
use rand::Rng;
use serde::Serialize;

use crate::config::ConfigError;
use crate::error::GatewayError;
use crate::pool::{self, Endpoint};
use crate::relay;
use crate::transform::RequestEnvelope;
use crate::AppState;

/// Lower bound applied to every backoff delay after jitter.
pub const MIN_RETRY_DELAY_SECS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            multiplier: 2.5,
            max_delay_secs: 60.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::InvalidRetryPolicy(message.to_string()));
        if !(self.base_delay_secs.is_finite() && self.base_delay_secs > 0.0) {
            return invalid("base delay must be positive");
        }
        if !(self.max_delay_secs.is_finite() && self.max_delay_secs > 0.0) {
            return invalid("max delay must be positive");
        }
        if !(self.multiplier.is_finite() && self.multiplier > 1.0) {
            return invalid("multiplier must be greater than 1");
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return invalid("jitter factor must be within [0, 1]");
        }
        Ok(())
    }

    /// Pre-jitter delay, in seconds, for the zero-based retry `attempt`.
    pub fn base_retry_delay(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (self.base_delay_secs * self.multiplier.powi(exponent)).min(self.max_delay_secs)
    }

    pub fn calculate_retry_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_retry_delay(attempt);
        let jittered = if self.jitter_factor > 0.0 {
            let spread = delay * self.jitter_factor;
            delay + rng.gen_range(-spread..=spread)
        } else {
            delay
        };
        Duration::from_secs_f64(jittered.max(MIN_RETRY_DELAY_SECS))
    }

    /// Delay to sleep before the try at `retry_index` on one endpoint; the
    /// first try on every endpoint goes out immediately.
    pub fn backoff_before<R: Rng + ?Sized>(&self, retry_index: u32, rng: &mut R) -> Option<Duration> {
        retry_index
            .checked_sub(1)
            .map(|attempt| self.calculate_retry_delay(attempt, rng))
    }

    pub fn schedule(&self) -> Vec<f64> {
        (0..self.max_retries).map(|attempt| self.base_retry_delay(attempt)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCursor {
    pub endpoint_index: usize,
    pub retry_index: u32,
}

impl AttemptCursor {
    pub const FIRST: Self = Self {
        endpoint_index: 0,
        retry_index: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    RetrySameEndpoint(AttemptCursor),
    NextEndpoint(AttemptCursor),
    Exhausted,
}

/// The ordered (endpoint, retry) pairs one request may try.
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    endpoints: Vec<Endpoint>,
    max_retries: u32,
}

impl AttemptPlan {
    /// Puts `primary` first and appends the rest of `pool` in order. Endpoints
    /// equal by value are tried once.
    pub fn new(pool: &[Endpoint], primary: &Endpoint, max_retries: u32) -> Self {
        let mut endpoints = vec![primary.clone()];
        for endpoint in pool {
            if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
        }
        Self {
            endpoints,
            max_retries,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, cursor: AttemptCursor) -> &Endpoint {
        &self.endpoints[cursor.endpoint_index]
    }

    pub fn total_attempts(&self) -> usize {
        self.endpoints.len() * (self.max_retries as usize + 1)
    }

    pub fn after_failure(&self, cursor: AttemptCursor) -> Transition {
        if cursor.retry_index < self.max_retries {
            return Transition::RetrySameEndpoint(AttemptCursor {
                retry_index: cursor.retry_index + 1,
                ..cursor
            });
        }
        if cursor.endpoint_index + 1 < self.endpoints.len() {
            return Transition::NextEndpoint(AttemptCursor {
                endpoint_index: cursor.endpoint_index + 1,
                retry_index: 0,
            });
        }
        Transition::Exhausted
    }
}

/// Drives one request through its attempt plan and returns the first
/// successful relay, or the last upstream failure once the plan is exhausted.
pub async fn dispatch(
    state: &AppState,
    public_model: &str,
    pool: &[Endpoint],
    mut envelope: RequestEnvelope,
) -> Result<Response, GatewayError> {
    let primary = {
        let mut rng = rand::thread_rng();
        pool::select(pool, &mut rng).cloned()
    };
    let Some(primary) = primary else {
        return Err(GatewayError::NoEndpointsAvailable(public_model.to_string()));
    };

    let policy = &state.config.retry;
    let plan = AttemptPlan::new(pool, &primary, policy.max_retries);
    let stream = envelope.is_stream();
    let mut cursor = AttemptCursor::FIRST;
    let mut attempt = 0usize;

    loop {
        let endpoint = plan.endpoint(cursor);

        let delay = policy.backoff_before(cursor.retry_index, &mut rand::thread_rng());
        if let Some(delay) = delay {
            tracing::debug!(
                model = %public_model,
                region = %endpoint.region,
                retry_index = cursor.retry_index,
                delay_ms = delay.as_millis() as u64,
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        attempt += 1;
        envelope.set_model(&endpoint.upstream_model_id);
        let token = state.credentials.get_token().await?;

        let failure =
            match relay::relay(&state.http_client, &state.config, &endpoint.url, &token, &envelope)
                .await
            {
                Ok(resp) => {
                    tracing::info!(
                        model = %public_model,
                        upstream_model = %endpoint.upstream_model_id,
                        region = %endpoint.region,
                        attempt,
                        retry_index = cursor.retry_index,
                        stream,
                        "upstream attempt succeeded"
                    );
                    return Ok(resp);
                }
                Err(failure) => failure,
            };

        match plan.after_failure(cursor) {
            Transition::RetrySameEndpoint(next) => {
                tracing::warn!(
                    model = %public_model,
                    endpoint_url = %endpoint.url,
                    region = %endpoint.region,
                    attempt,
                    retry_index = cursor.retry_index,
                    upstream_status = ?failure.status(),
                    reason = failure.reason(),
                    "retryable upstream failure; retrying same endpoint"
                );
                cursor = next;
            }
            Transition::NextEndpoint(next) => {
                tracing::warn!(
                    model = %public_model,
                    endpoint_url = %endpoint.url,
                    region = %endpoint.region,
                    next_region = %plan.endpoint(next).region,
                    attempt,
                    upstream_status = ?failure.status(),
                    reason = failure.reason(),
                    "endpoint retries exhausted; attempting failover"
                );
                cursor = next;
            }
            Transition::Exhausted => {
                tracing::error!(
                    model = %public_model,
                    endpoints = plan.endpoints().len(),
                    attempts = attempt,
                    planned_attempts = plan.total_attempts(),
                    upstream_status = ?failure.status(),
                    reason = failure.reason(),
                    "all endpoints failed"
                );
                return Err(failure.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(format!("https://{name}.example"), name)
    }

    #[test]
    fn default_policy_is_valid() {
        RetryPolicy::default().validate().unwrap();
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let bad = [
            RetryPolicy {
                multiplier: 1.0,
                ..RetryPolicy::default()
            },
            RetryPolicy {
                jitter_factor: 1.5,
                ..RetryPolicy::default()
            },
            RetryPolicy {
                base_delay_secs: 0.0,
                ..RetryPolicy::default()
            },
            RetryPolicy {
                max_delay_secs: f64::NAN,
                ..RetryPolicy::default()
            },
        ];
        for policy in bad {
            assert!(
                matches!(policy.validate(), Err(ConfigError::InvalidRetryPolicy(_))),
                "{policy:?} should be invalid"
            );
        }
    }

    #[test]
    fn first_retry_delay_equals_base_without_jitter() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            no_jitter().calculate_retry_delay(0, &mut rng),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn delay_grows_then_clamps() {
        let policy = no_jitter();
        let got: Vec<f64> = (0..6).map(|a| policy.base_retry_delay(a)).collect();
        assert_eq!(got, vec![2.0, 5.0, 12.5, 31.25, 60.0, 60.0]);
        assert_eq!(policy.base_retry_delay(u32::MAX), 60.0);
        assert_eq!(policy.schedule(), vec![2.0, 5.0, 12.5]);
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let policy = RetryPolicy {
            jitter_factor: 0.25,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1_000 {
            let delay = policy.calculate_retry_delay(0, &mut rng).as_secs_f64();
            assert!((1.5..=2.5).contains(&delay), "delay {delay} outside band");
        }
    }

    #[test]
    fn delay_is_floored() {
        let policy = RetryPolicy {
            base_delay_secs: 0.01,
            jitter_factor: 1.0,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert!(policy.calculate_retry_delay(0, &mut rng) >= Duration::from_millis(100));
        }
    }

    #[test]
    fn no_backoff_before_first_try() {
        let policy = no_jitter();
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(policy.backoff_before(0, &mut rng), None);
        assert_eq!(policy.backoff_before(1, &mut rng), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff_before(2, &mut rng), Some(Duration::from_secs(5)));
    }

    #[test]
    fn plan_puts_primary_first_and_keeps_pool_order() {
        let pool = vec![endpoint("a"), endpoint("b"), endpoint("c")];
        let plan = AttemptPlan::new(&pool, &pool[1], 2);
        let names: Vec<&str> = plan
            .endpoints()
            .iter()
            .map(|e| e.upstream_model_id.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(plan.total_attempts(), 9);
    }

    #[test]
    fn plan_deduplicates_repeated_endpoints() {
        let pool = vec![endpoint("a"), endpoint("b"), endpoint("a")];
        let plan = AttemptPlan::new(&pool, &pool[0], 0);
        assert_eq!(plan.endpoints(), &[endpoint("a"), endpoint("b")]);
    }

    #[test]
    fn walking_the_plan_visits_every_pair_in_order() {
        let pool = vec![endpoint("a"), endpoint("b")];
        let plan = AttemptPlan::new(&pool, &pool[0], 2);

        let mut cursor = AttemptCursor::FIRST;
        let mut visited = vec![(plan.endpoint(cursor).upstream_model_id.clone(), 0)];
        let mut transitions = Vec::new();
        loop {
            let transition = plan.after_failure(cursor);
            transitions.push(transition);
            match transition {
                Transition::RetrySameEndpoint(next) | Transition::NextEndpoint(next) => {
                    cursor = next;
                    visited.push((plan.endpoint(cursor).upstream_model_id.clone(), cursor.retry_index));
                }
                Transition::Exhausted => break,
            }
        }

        let expected: Vec<(String, u32)> = [("a", 0), ("a", 1), ("a", 2), ("b", 0), ("b", 1), ("b", 2)]
            .into_iter()
            .map(|(n, r)| (n.to_string(), r))
            .collect();
        assert_eq!(visited, expected);
        assert_eq!(visited.len(), plan.total_attempts());
        assert_eq!(
            transitions
                .iter()
                .filter(|t| matches!(t, Transition::NextEndpoint(_)))
                .count(),
            1
        );
    }

    #[test]
    fn zero_retries_fails_over_immediately() {
        let pool = vec![endpoint("a"), endpoint("b")];
        let plan = AttemptPlan::new(&pool, &pool[0], 0);
        assert_eq!(
            plan.after_failure(AttemptCursor::FIRST),
            Transition::NextEndpoint(AttemptCursor {
                endpoint_index: 1,
                retry_index: 0
            })
        );
        assert_eq!(
            plan.after_failure(AttemptCursor {
                endpoint_index: 1,
                retry_index: 0
            }),
            Transition::Exhausted
        );
    }
}
