use std::{
    collections::BTreeSet,
    sync::{Arc, RwLock},
};

use anyhow::{anyhow, Error};
use log::info;

use error::PlatformError;
use model::{ServiceInstance, Timings};
use port::{HttpProbe, PlatformClient};

pub mod application;
pub mod error;
pub mod model;
pub mod port;
pub mod readiness;
pub mod retry;
pub mod route;

pub use application::Application;

/// What every application controller of a test run shares.
pub struct Session {
    pub platform: Arc<dyn PlatformClient + Send + Sync>,
    pub prober: Arc<dyn HttpProbe + Send + Sync>,
    pub target_domain: String,
    pub timings: Timings,
    services: RwLock<BTreeSet<String>>,
}

impl Session {
    pub fn new(
        platform: Arc<dyn PlatformClient + Send + Sync>,
        prober: Arc<dyn HttpProbe + Send + Sync>,
        target_domain: impl Into<String>,
        timings: Timings,
        services: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            platform,
            prober,
            target_domain: target_domain.into(),
            timings,
            services: RwLock::new(services.into_iter().collect()),
        }
    }

    pub fn knows_service(&self, name: &str) -> Result<bool, Error> {
        let services = self
            .services
            .read()
            .map_err(|_| anyhow!("Known services lock is poisoned"))?;
        Ok(services.contains(name))
    }

    /// Resolve a service the session knows about to its remote instance.
    pub async fn service(&self, name: &str) -> Result<ServiceInstance, Error> {
        if !self.knows_service(name)? {
            return Err(PlatformError::Validation(format!("unknown service {}", name)).into());
        }
        self.platform
            .find_service_instance(name)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("service instance {}", name)).into())
    }

    /// Create a service instance, or adopt an existing one, and remember it.
    pub async fn provision_service(
        &self,
        name: &str,
        plan: Option<&str>,
    ) -> Result<ServiceInstance, Error> {
        let service = match self.platform.find_service_instance(name).await? {
            Some(service) => service,
            None => {
                info!("Provisioning service {} ({})", name, plan.unwrap_or("default plan"));
                self.platform.create_service_instance(name, plan).await?
            }
        };
        self.services
            .write()
            .map_err(|_| anyhow!("Known services lock is poisoned"))?
            .insert(name.to_string());
        Ok(service)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        domain::model::{HttpResponse, ProbeRequest},
        infra::memory::InMemoryPlatform,
    };

    /// Probe answering every request with a fixed response.
    pub struct RecordingProbe {
        pub response: HttpResponse,
        pub requests: Mutex<Vec<ProbeRequest>>,
    }

    #[async_trait]
    impl HttpProbe for RecordingProbe {
        async fn send(&self, request: ProbeRequest) -> Result<HttpResponse, Error> {
            self.requests.lock().await.push(request);
            Ok(self.response.clone())
        }
    }

    pub fn probe(code: u16, body: &str) -> Arc<RecordingProbe> {
        Arc::new(RecordingProbe {
            response: HttpResponse {
                code,
                body: body.to_string(),
            },
            requests: Mutex::new(vec![]),
        })
    }

    pub fn session(
        platform: &Arc<InMemoryPlatform>,
        probe: &Arc<RecordingProbe>,
        services: &[&str],
    ) -> Arc<Session> {
        Arc::new(Session::new(
            platform.clone(),
            probe.clone(),
            "example.com",
            Timings::default(),
            services.iter().map(|service| service.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{panic, sync::Arc};

    use super::{testing::*, *};
    use crate::infra::memory::InMemoryPlatform;

    #[tokio::test]
    async fn unknown_service_is_rejected_before_any_call() {
        let platform = Arc::new(InMemoryPlatform::default());
        let session = session(&platform, &probe(200, ""), &[]);
        let error = session.service("redis").await.unwrap_err();
        assert_eq!(
            PlatformError::of(&error),
            Some(&PlatformError::Validation("unknown service redis".into()))
        );
        assert_eq!(platform.calls("find_service_instance"), 0);
    }

    #[tokio::test]
    async fn provisioning_makes_service_known_and_is_idempotent() {
        let platform = Arc::new(InMemoryPlatform::default());
        let session = session(&platform, &probe(200, ""), &[]);
        let created = session.provision_service("redis", Some("small")).await.unwrap();
        let adopted = session.provision_service("redis", None).await.unwrap();
        assert_eq!(created, adopted);
        assert_eq!(platform.calls("create_service_instance"), 1);
        assert!(session.knows_service("redis").unwrap());
        assert_eq!(session.service("redis").await.unwrap(), created);
    }

    #[tokio::test]
    async fn poisoned_service_registry_is_not_an_unknown_service() {
        let platform = Arc::new(InMemoryPlatform::default());
        let session = session(&platform, &probe(200, ""), &["redis"]);
        let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _services = session.services.write().unwrap();
            panic!("writer died");
        }));
        let error = session.service("redis").await.unwrap_err();
        assert_eq!(PlatformError::of(&error), None);
        assert!(error.to_string().contains("poisoned"));
        assert_eq!(platform.calls("find_service_instance"), 0);
    }
}
