use anyhow::Error;

/// Failures surfaced by the platform and by the harness itself.
///
/// Adapters return these wrapped in `anyhow::Error`; callers classify them with
/// [`PlatformError::of`], which sees through any context added on the way up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("application bits are not staged yet: {0}")]
    StagingPending(String),
    #[error("platform API error (status {status}, code {code}): {description}")]
    Remote {
        status: u16,
        code: i64,
        description: String,
    },
    #[error("{0}")]
    Validation(String),
    #[error("application {name} was not running after {waited_secs}s")]
    ReadinessTimeout { name: String, waited_secs: u64 },
}

impl PlatformError {
    pub fn of(error: &Error) -> Option<&PlatformError> {
        error.downcast_ref::<PlatformError>()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PlatformError::Timeout(_))
    }

    pub fn is_staging_pending(&self) -> bool {
        matches!(self, PlatformError::StagingPending(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}
