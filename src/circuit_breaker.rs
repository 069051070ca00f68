use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::time::Duration;

/// Consecutive failed prescreen calls before the breaker opens.
pub const BUREAU_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker type guarding outbound bureau calls.
pub type BureauCircuitBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Breaker shared by every prescreen call of one `HttpBureauClient`.
///
/// While open, calls are rejected without touching the network and the
/// record is stored as `api_error`, so a dead bureau costs one timeout per
/// threshold rather than one per record. Recovery is attempted after an
/// exponential backoff of 10s growing to 60s.
pub fn create_bureau_circuit_breaker() -> BureauCircuitBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));
    let failure_policy =
        failure_policy::consecutive_failures(BUREAU_FAILURE_THRESHOLD, backoff_strategy);
    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use failsafe::futures::CircuitBreaker;
    use failsafe::Error;

    async fn bureau_503() -> Result<u16, AppError> {
        Err(AppError::ExternalApiError(
            "bureau prescreen returned status 503".to_string(),
        ))
    }

    #[tokio::test]
    async fn opens_after_consecutive_bureau_failures() {
        let cb = create_bureau_circuit_breaker();

        for _ in 0..BUREAU_FAILURE_THRESHOLD {
            match cb.call(bureau_503()).await {
                Err(Error::Inner(AppError::ExternalApiError(msg))) => {
                    assert!(msg.contains("503"))
                }
                other => panic!("expected the bureau error to pass through, got {:?}", other),
            }
        }

        let rejected = cb.call(async { Ok::<u16, AppError>(200) }).await;
        assert!(matches!(rejected, Err(Error::Rejected)));
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let cb = create_bureau_circuit_breaker();

        for _ in 0..BUREAU_FAILURE_THRESHOLD - 1 {
            let _ = cb.call(bureau_503()).await;
        }
        let ok = cb.call(async { Ok::<u16, AppError>(200) }).await;
        assert!(matches!(ok, Ok(200)));

        // The streak restarted, so one more failure does not open it.
        let _ = cb.call(bureau_503()).await;
        assert!(cb.is_call_permitted());
    }
}
