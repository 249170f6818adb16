//! Runtime error taxonomy shared by every component.
//!
//! Components return [`RuntimeError`] from their public operations. Errors that
//! cross a component boundary are wrapped with [`RuntimeError::wrap`] so the
//! original cause stays reachable through [`std::error::Error::source`].
use thiserror::Error;

/// Boxed error used for wrapped causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("config path invalid: {0}")]
    ConfigPathInvalid(String),

    #[error("component already running")]
    AlreadyRunning,

    #[error("component not running")]
    NotRunning,

    #[error("component not initialized")]
    NotInitialized,

    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("operation canceled")]
    Canceled,

    #[error("circuit breaker open for service '{0}'")]
    CircuitOpen(String),

    #[error("action publish failed: {0}")]
    PublishFailed(String),

    #[error("no publication channels for action '{0}'")]
    NoPublicationChannels(String),

    /// Outbound request failed. `status` is set when the peer answered.
    #[error("client request failed: {message}")]
    ClientRequestFailed {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("client response invalid: {0}")]
    ClientResponseInvalid(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("cron job already exists: {0}")]
    CronJobExists(String),

    #[error("cron job not found: {0}")]
    CronJobNotFound(String),

    #[error("cron job name is empty")]
    CronJobNameEmpty,

    #[error("cron expression '{spec}' invalid: {reason}")]
    CronExpressionInvalid { spec: String, reason: String },

    #[error("cron job is nil")]
    CronJobIsNil,

    #[error("cron job failed: {0}")]
    CronJobFailed(String),

    #[error("cron job timeout: {0}")]
    CronJobTimeout(String),

    #[error("cron is running")]
    CronIsRunning,

    #[error("cron scheduler stopped")]
    CronSchedulerStopped,

    #[error("middleware invalid: {0}")]
    MiddlewareInvalidType(String),

    #[error("action type unknown: {0}")]
    ActionTypeUnknown(String),

    #[error("action config invalid: {0}")]
    ActionConfigInvalid(String),

    #[error("action component is running")]
    ActionIsRunning,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("health manager is not running")]
    HealthIsNotRunning,

    #[error("documentation manager is not running")]
    DocsIsNotRunning,

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl RuntimeError {
    /// Attach context to an error while keeping it as the source.
    pub fn wrap<E>(context: impl Into<String>, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        RuntimeError::Wrapped {
            context: context.into(),
            source: err.into(),
        }
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        RuntimeError::ClientRequestFailed {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Peel `Wrapped` layers whose cause is itself a `RuntimeError`.
    pub fn innermost(&self) -> &RuntimeError {
        let mut current = self;
        while let RuntimeError::Wrapped { source, .. } = current {
            match source.downcast_ref::<RuntimeError>() {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    /// HTTP status carried by a failed outbound request, if any.
    pub fn status(&self) -> Option<u16> {
        match self.innermost() {
            RuntimeError::ClientRequestFailed { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_wrap_keeps_source() {
        let err = RuntimeError::wrap("failed to start cron", RuntimeError::CronSchedulerStopped);
        assert_eq!(
            err.to_string(),
            "failed to start cron: cron scheduler stopped"
        );
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<RuntimeError>().is_some());
    }

    #[test]
    fn test_innermost_peels_nested_wraps() {
        let err = RuntimeError::wrap(
            "component http",
            RuntimeError::wrap("bind", RuntimeError::AlreadyRunning),
        );
        assert!(matches!(err.innermost(), RuntimeError::AlreadyRunning));
    }

    #[test]
    fn test_innermost_stops_at_foreign_error() {
        let io = std::io::Error::other("boom");
        let err = RuntimeError::wrap("read", io);
        assert!(matches!(err.innermost(), RuntimeError::Wrapped { .. }));
    }

    #[test]
    fn test_status_of_request_failure() {
        let err = RuntimeError::ClientRequestFailed {
            message: "HTTP 404".to_string(),
            status: Some(404),
            source: None,
        };
        assert_eq!(RuntimeError::wrap("call", err).status(), Some(404));
        assert_eq!(RuntimeError::NotRunning.status(), None);
    }
}
