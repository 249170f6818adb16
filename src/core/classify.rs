//! Classification of outbound call outcomes.
//!
//! The retry loop and the circuit breaker read the same outcome differently:
//! a 500 is retried but does not count against the breaker, a 4xx other than
//! 408/429 is a healthy peer saying no.

/// Transport-level failure kinds, independent of the HTTP library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    /// Connection refused, unreachable host or network, DNS failure
    Connect,
    /// The connection broke while the request was in flight (reset, aborted)
    Interrupted,
    /// The request could not be built (bad URL, bad header)
    Invalid,
    /// The response body could not be read
    Body,
    Other,
}

impl TransportFailure {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TransportFailure::Timeout | TransportFailure::Connect | TransportFailure::Interrupted
        )
    }
}

/// What one attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Status(u16),
    Transport(TransportFailure),
}

const TRANSIENT_STATUSES: [u16; 5] = [408, 429, 502, 503, 504];

/// 2xx, or a 4xx other than 408 and 429.
pub fn is_successful(outcome: CallOutcome) -> bool {
    match outcome {
        CallOutcome::Status(status) => {
            (200..300).contains(&status)
                || ((400..500).contains(&status) && status != 408 && status != 429)
        }
        CallOutcome::Transport(_) => false,
    }
}

/// Network failures and 408/429/502/503/504.
pub fn is_retryable(outcome: CallOutcome) -> bool {
    match outcome {
        CallOutcome::Status(status) => TRANSIENT_STATUSES.contains(&status),
        CallOutcome::Transport(failure) => failure.is_network(),
    }
}

/// Any transport failure and 408/429/502/503/504.
pub fn is_breaker_failure(outcome: CallOutcome) -> bool {
    match outcome {
        CallOutcome::Status(status) => TRANSIENT_STATUSES.contains(&status),
        CallOutcome::Transport(_) => true,
    }
}
