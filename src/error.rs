// =============================================================================
// error.rs — THE TAXONOMY OF THINGS GOING WRONG
// =============================================================================
//
// Every way this system can fail, enumerated and typed. Note what is NOT
// here: a cost or rate denial from admission control is a *decision*, not
// an error — it gets its own variant so callers can tell "the portal is on
// fire" apart from "the budget said no", because those two situations have
// wildly different remediation paths (one involves retries, the other
// involves a conversation with accounting).
// =============================================================================

use std::time::Duration;

use crate::models::NotificationChannel;

/// Failures and denials surfaced by the monitoring pipeline.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The fetch to the records portal failed — network trouble, HTTP
    /// error, or a response we couldn't make sense of. Retryable.
    #[error("gateway error fetching {case_number} from {source_id}: {reason}")]
    Gateway {
        case_number: String,
        source_id: String,
        reason: String,
    },

    /// The source explicitly told us to slow down. Retryable, later.
    #[error("rate limited by {source_id}, retry after {retry_after:?}")]
    RateLimit {
        source_id: String,
        retry_after: Option<Duration>,
    },

    /// Admission control declined the spend. Not an exception path — a
    /// normal decision that defers the check to its next natural slot.
    #[error("cost limit exceeded: {reason} (estimated {estimated_cents}¢)")]
    CostLimitExceeded {
        estimated_cents: u64,
        reason: String,
    },

    /// A channel failed to deliver. Isolated per channel per event; one
    /// channel's bad day never blocks the others.
    #[error("delivery via {channel} failed: {reason}")]
    NotificationDelivery {
        channel: NotificationChannel,
        reason: String,
    },

    /// Somebody referenced a rule/case/account that doesn't exist, or fed
    /// us configuration that doesn't parse. Not retryable — fix the input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The check outlived its hard timeout. Counts as a failure for the
    /// retry policy; the worker slot was released regardless.
    #[error("check timed out after {0:?}")]
    Timeout(Duration),
}

impl MonitorError {
    /// Convenience constructor for the most common failure in the system.
    pub fn gateway(
        case_number: impl Into<String>,
        source_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        MonitorError::Gateway {
            case_number: case_number.into(),
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// Deferrals (cost/rate) reschedule without burning a retry; real
    /// failures count against `max_retries`.
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            MonitorError::CostLimitExceeded { .. } | MonitorError::RateLimit { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferrals_are_not_failures() {
        assert!(MonitorError::CostLimitExceeded {
            estimated_cents: 1000,
            reason: "daily limit".into()
        }
        .is_deferral());
        assert!(MonitorError::RateLimit {
            source_id: "pacer".into(),
            retry_after: None
        }
        .is_deferral());
        assert!(!MonitorError::gateway("2:24-cv-1", "pacer", "503").is_deferral());
        assert!(!MonitorError::Timeout(Duration::from_secs(120)).is_deferral());
    }
}
