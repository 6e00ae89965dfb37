use std::path::Path;

use anyhow::Error;
use async_trait::async_trait;

use super::model::{
    AppEvent, AppSpec, AppState, AppUpdate, Domain, HttpResponse, InstanceRecord, InstanceStats,
    ProbeRequest, RemoteApp, Route, ServiceBinding, ServiceInstance,
};

#[async_trait]
pub trait PlatformClient {
    async fn find_app(&self, name: &str) -> Result<Option<RemoteApp>, Error>;

    async fn create_app(&self, spec: &AppSpec) -> Result<RemoteApp, Error>;

    async fn update_app(&self, guid: &str, update: &AppUpdate) -> Result<RemoteApp, Error>;

    async fn set_state(&self, guid: &str, state: AppState) -> Result<RemoteApp, Error>;

    async fn delete_app(&self, guid: &str, recursive: bool) -> Result<(), Error>;

    async fn upload_bits(&self, guid: &str, path: &Path) -> Result<(), Error>;

    async fn instances(&self, guid: &str) -> Result<Vec<InstanceRecord>, Error>;

    async fn stats(&self, guid: &str) -> Result<Vec<InstanceStats>, Error>;

    async fn env(&self, guid: &str) -> Result<serde_json::Value, Error>;

    async fn files(&self, guid: &str, instance: u32, path: &str) -> Result<String, Error>;

    async fn events(&self, guid: &str) -> Result<Vec<AppEvent>, Error>;

    async fn find_domain(&self, name: &str) -> Result<Option<Domain>, Error>;

    async fn create_domain(&self, name: &str) -> Result<Domain, Error>;

    async fn find_route(&self, host: &str, domain: &Domain) -> Result<Option<Route>, Error>;

    async fn create_route(&self, host: &str, domain: &Domain) -> Result<Route, Error>;

    async fn app_routes(&self, guid: &str) -> Result<Vec<Route>, Error>;

    async fn attach_route(&self, guid: &str, route: &Route) -> Result<(), Error>;

    async fn detach_route(&self, guid: &str, route: &Route) -> Result<(), Error>;

    async fn delete_route(&self, route: &Route) -> Result<(), Error>;

    async fn find_service_instance(&self, name: &str) -> Result<Option<ServiceInstance>, Error>;

    async fn create_service_instance(
        &self,
        name: &str,
        plan: Option<&str>,
    ) -> Result<ServiceInstance, Error>;

    async fn bind_service(
        &self,
        guid: &str,
        service: &ServiceInstance,
    ) -> Result<ServiceBinding, Error>;

    async fn app_bindings(&self, guid: &str) -> Result<Vec<ServiceBinding>, Error>;

    async fn unbind_service(&self, binding: &ServiceBinding) -> Result<(), Error>;
}

#[async_trait]
pub trait HttpProbe {
    async fn send(&self, request: ProbeRequest) -> Result<HttpResponse, Error>;
}
