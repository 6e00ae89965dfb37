//! Polling an application until its instances settle in the running state.
//!
//! Staging and start are asynchronous on the platform side, so a successful
//! start request says nothing about the instances. After a grace period the
//! instance states are sampled once per poll interval; the application is
//! considered ready once [`CONFIRMATIONS`] samples in a row, after a first
//! running one, report every instance as running.

use std::time::Duration;

use anyhow::{Context, Error};
use log::{debug, info};
use split_iter::Splittable;
use tokio::time::{sleep, Instant};

use super::{
    error::PlatformError,
    model::{InstanceRecord, InstanceState, Timings},
    port::PlatformClient,
    retry::{retry, RetryPolicy},
};

pub const CONFIRMATIONS: u32 = 3;

/// Take one sample of the instance states.
///
/// Staging still in progress is retried a few times; a client timeout counts
/// as "not running yet".
pub async fn sample(
    platform: &(dyn PlatformClient + Send + Sync),
    guid: &str,
    timings: &Timings,
) -> Result<bool, Error> {
    let policy = RetryPolicy {
        retries: timings.staging_retries,
        backoff: Duration::from_millis(timings.staging_backoff_ms),
    };
    let instances = retry(
        policy,
        "instance listing",
        PlatformError::is_staging_pending,
        || platform.instances(guid),
    )
    .await;
    match instances {
        Ok(instances) => Ok(all_running(instances)),
        Err(error) if PlatformError::of(&error).is_some_and(PlatformError::is_timeout) => {
            debug!("Instance listing timed out, counting as not running: {}", error);
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

fn all_running(instances: Vec<InstanceRecord>) -> bool {
    if instances.is_empty() {
        return false;
    }
    let (pending, running) = instances
        .into_iter()
        .split(|instance| instance.state == InstanceState::Running);
    let pending: Vec<InstanceRecord> = pending.collect();
    let running = running.count();
    if !pending.is_empty() {
        debug!(
            "{} instances running, waiting on {:?}",
            running,
            pending.iter().map(|instance| instance.state).collect::<Vec<_>>()
        );
    }
    pending.is_empty()
}

/// Block until `guid` is stably running or `timeout` of wall-clock time elapsed.
pub async fn wait_until_running(
    platform: &(dyn PlatformClient + Send + Sync),
    name: &str,
    guid: &str,
    timings: &Timings,
    timeout: Duration,
) -> Result<(), Error> {
    let started_at = Instant::now();
    sleep(timings.grace_period()).await;
    let mut streak = 0;
    loop {
        let running = sample(platform, guid, timings)
            .await
            .with_context(|| format!("Can't sample instances of {}", name))?;
        if running {
            streak += 1;
            if streak > CONFIRMATIONS {
                info!(
                    "Application {} is running after {}s",
                    name,
                    started_at.elapsed().as_secs()
                );
                return Ok(());
            }
        } else {
            streak = 0;
        }
        let waited = started_at.elapsed();
        if waited > timeout {
            return Err(PlatformError::ReadinessTimeout {
                name: name.to_string(),
                waited_secs: waited.as_secs(),
            }
            .into());
        }
        sleep(timings.poll_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::model::{
            AppSpec, AppState,
            InstanceState::{Crashed, Running, Starting},
        },
        infra::memory::InMemoryPlatform,
    };

    async fn started_app(platform: &InMemoryPlatform) -> String {
        let app = platform
            .create_app(&AppSpec {
                name: "app".into(),
                memory: 128,
                instances: 2,
                buildpack: None,
                command: None,
                environment: Default::default(),
            })
            .await
            .unwrap();
        platform.set_state(&app.guid, AppState::Started).await.unwrap();
        app.guid
    }

    fn timeout() -> Duration {
        Duration::from_secs(60)
    }

    #[tokio::test(start_paused = true)]
    async fn needs_four_running_samples_in_a_row() {
        let platform = InMemoryPlatform::default();
        let guid = started_app(&platform).await;
        for states in [
            vec![Starting, Running],
            vec![Running, Running],
            vec![Running, Running],
            vec![Running, Crashed],
            vec![Running, Running],
            vec![Running, Running],
            vec![Running, Running],
        ] {
            platform.push_instance_sample(Ok(states));
        }
        let started = Instant::now();
        wait_until_running(&platform, "app", &guid, &Timings::default(), timeout())
            .await
            .unwrap();
        // 7 scripted samples plus the one that completes the streak.
        assert_eq!(platform.calls("instances"), 8);
        assert_eq!(started.elapsed(), Duration::from_secs(10 + 7));
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_application_times_out() {
        let platform = InMemoryPlatform::default();
        let guid = started_app(&platform).await;
        for _ in 0..100 {
            platform.push_instance_sample(Ok(vec![Running, Running]));
            platform.push_instance_sample(Ok(vec![Running, Starting]));
        }
        let error = wait_until_running(
            &platform,
            "app",
            &guid,
            &Timings::default(),
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            PlatformError::of(&error),
            Some(PlatformError::ReadinessTimeout { waited_secs: 31, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn staging_pending_is_retried_then_propagated() {
        let platform = InMemoryPlatform::default();
        let guid = started_app(&platform).await;
        let pending = || Err(PlatformError::StagingPending("app".into()));
        for _ in 0..3 {
            platform.push_instance_sample(pending());
        }
        assert!(sample(&platform, &guid, &Timings::default()).await.unwrap());

        for _ in 0..4 {
            platform.push_instance_sample(pending());
        }
        let error = sample(&platform, &guid, &Timings::default())
            .await
            .unwrap_err();
        assert!(PlatformError::of(&error).is_some_and(PlatformError::is_staging_pending));
    }

    #[tokio::test(start_paused = true)]
    async fn client_timeouts_count_as_not_running() {
        let platform = InMemoryPlatform::default();
        let guid = started_app(&platform).await;
        platform.push_instance_sample(Err(PlatformError::Timeout("instances".into())));
        assert!(!sample(&platform, &guid, &Timings::default()).await.unwrap());

        platform.push_instance_sample(Err(PlatformError::Timeout("instances".into())));
        wait_until_running(&platform, "app", &guid, &Timings::default(), timeout())
            .await
            .unwrap();
        assert_eq!(platform.calls("instances"), 1 + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn no_instances_is_not_running() {
        let platform = InMemoryPlatform::default();
        let guid = started_app(&platform).await;
        platform.push_instance_sample(Ok(vec![]));
        assert!(!sample(&platform, &guid, &Timings::default()).await.unwrap());
    }
}
