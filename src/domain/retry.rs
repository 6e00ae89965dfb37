use std::{future::Future, time::Duration};

use anyhow::Error;
use log::warn;

use super::error::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff: Duration,
}

/// Run `operation`, retrying while it fails with an error `transient` accepts.
///
/// After `policy.retries` retries the last error is returned unchanged.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    action: &str,
    transient: impl Fn(&PlatformError) -> bool,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error)
                if attempt < policy.retries
                    && PlatformError::of(&error).is_some_and(&transient) =>
            {
                attempt += 1;
                warn!(
                    "{} failed with {}, retry {}/{}",
                    action, error, attempt, policy.retries
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(error) => return Err(error),
        }
    }
}
