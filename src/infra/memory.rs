//! In-process platform used for dry runs and for exercising the harness.
//!
//! Besides holding applications, routes and services, it lets a caller script
//! failures of any operation, of the start request, and the exact instance
//! states returned by the next instance listings, and counts every call by
//! operation name.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use log::debug;

use crate::domain::{
    error::PlatformError,
    model::{
        AppEvent, AppSpec, AppState, AppUpdate, Domain, InstanceRecord, InstanceState,
        InstanceStats, RemoteApp, Route, ServiceBinding, ServiceInstance,
    },
    port::PlatformClient,
};

use super::bits;

#[derive(Default)]
struct World {
    apps: HashMap<String, RemoteApp>,
    domains: HashMap<String, Domain>,
    routes: HashMap<String, Route>,
    attached: HashMap<String, Vec<String>>,
    services: HashMap<String, ServiceInstance>,
    bindings: HashMap<String, ServiceBinding>,
    files: HashMap<(String, u32, String), String>,
    events: HashMap<String, Vec<AppEvent>>,
    uploads: HashMap<String, usize>,
    failures: HashMap<&'static str, VecDeque<PlatformError>>,
    start_failures: VecDeque<PlatformError>,
    instance_samples: VecDeque<Result<Vec<InstanceState>, PlatformError>>,
    calls: HashMap<&'static str, usize>,
    journal: Vec<String>,
    clock: u64,
}

impl World {
    /// Count and journal a call, then fail it if a failure is scripted for it.
    fn record(&mut self, operation: &'static str, detail: String) -> Result<(), Error> {
        *self.calls.entry(operation).or_default() += 1;
        self.journal.push(format!("{} {}", operation, detail));
        match self
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn app(&self, guid: &str) -> Result<&RemoteApp, Error> {
        self.apps
            .get(guid)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", guid)).into())
    }

    fn app_mut(&mut self, guid: &str) -> Result<&mut RemoteApp, Error> {
        self.apps
            .get_mut(guid)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", guid)).into())
    }

    fn audit(&mut self, guid: &str, kind: &str) {
        self.clock += 1;
        let timestamp = format!("2024-01-01T00:00:{:02}Z", self.clock % 60);
        self.events.entry(guid.to_string()).or_default().push(AppEvent {
            kind: kind.to_string(),
            actor: "clowntest".to_string(),
            timestamp,
        });
    }

    fn default_states(&self, guid: &str) -> Result<Vec<InstanceState>, Error> {
        let app = self.app(guid)?;
        let state = match app.state {
            AppState::Started => InstanceState::Running,
            AppState::Stopped => InstanceState::Down,
        };
        Ok(vec![state; app.instances as usize])
    }
}

#[derive(Default)]
pub struct InMemoryPlatform {
    world: Mutex<World>,
}

fn new_guid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl InMemoryPlatform {
    fn world(&self) -> Result<MutexGuard<'_, World>, Error> {
        self.world
            .lock()
            .map_err(|_| anyhow!("In-memory platform state is poisoned"))
    }

    fn with_world<T>(&self, f: impl FnOnce(&mut World) -> T) -> T {
        let mut world = self
            .world
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut world)
    }

    /// Make the next calls of `operation` fail with `error`, in order.
    pub fn push_failure(&self, operation: &'static str, error: PlatformError) {
        self.with_world(|world| {
            world
                .failures
                .entry(operation)
                .or_default()
                .push_back(error)
        });
    }

    /// Make the next start requests fail with `error`, in order.
    pub fn push_start_failure(&self, error: PlatformError) {
        self.with_world(|world| world.start_failures.push_back(error));
    }

    /// Answer the next instance listing with `sample` instead of the app state.
    pub fn push_instance_sample(&self, sample: Result<Vec<InstanceState>, PlatformError>) {
        self.with_world(|world| world.instance_samples.push_back(sample));
    }

    pub fn put_file(&self, guid: &str, instance: u32, path: &str, content: &str) {
        self.with_world(|world| {
            world
                .files
                .insert((guid.to_string(), instance, path.to_string()), content.to_string())
        });
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.with_world(|world| world.calls.get(operation).copied().unwrap_or_default())
    }

    /// Every call made so far, as `"<operation> <detail>"`.
    pub fn journal(&self) -> Vec<String> {
        self.with_world(|world| world.journal.clone())
    }

    pub fn uploaded_bytes(&self, guid: &str) -> Option<usize> {
        self.with_world(|world| world.uploads.get(guid).copied())
    }

    pub fn route_count(&self) -> usize {
        self.with_world(|world| world.routes.len())
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn find_app(&self, name: &str) -> Result<Option<RemoteApp>, Error> {
        let mut world = self.world()?;
        world.record("find_app", name.to_string())?;
        Ok(world.apps.values().find(|app| app.name == name).cloned())
    }

    async fn create_app(&self, spec: &AppSpec) -> Result<RemoteApp, Error> {
        let mut world = self.world()?;
        world.record("create_app", spec.name.clone())?;
        if world.apps.values().any(|app| app.name == spec.name) {
            return Err(PlatformError::Remote {
                status: 400,
                code: 100002,
                description: format!("The app name is taken: {}", spec.name),
            }
            .into());
        }
        let app = RemoteApp {
            guid: new_guid(),
            name: spec.name.clone(),
            memory: spec.memory,
            instances: spec.instances,
            buildpack: spec.buildpack.clone(),
            command: spec.command.clone(),
            environment: spec.environment.clone(),
            state: AppState::Stopped,
        };
        world.apps.insert(app.guid.clone(), app.clone());
        world.audit(&app.guid, "audit.app.create");
        Ok(app)
    }

    async fn update_app(&self, guid: &str, update: &AppUpdate) -> Result<RemoteApp, Error> {
        let mut world = self.world()?;
        world.record("update_app", guid.to_string())?;
        let app = world.app_mut(guid)?;
        update.apply(app);
        let app = app.clone();
        world.audit(guid, "audit.app.update");
        Ok(app)
    }

    async fn set_state(&self, guid: &str, state: AppState) -> Result<RemoteApp, Error> {
        let mut world = self.world()?;
        world.record("set_state", format!("{} {:?}", guid, state))?;
        world.app(guid)?;
        if state == AppState::Started {
            if let Some(error) = world.start_failures.pop_front() {
                return Err(error.into());
            }
        }
        let app = world.app_mut(guid)?;
        app.state = state;
        let app = app.clone();
        world.audit(
            guid,
            match state {
                AppState::Started => "audit.app.start",
                AppState::Stopped => "audit.app.stop",
            },
        );
        Ok(app)
    }

    async fn delete_app(&self, guid: &str, recursive: bool) -> Result<(), Error> {
        let mut world = self.world()?;
        world.record("delete_app", guid.to_string())?;
        world.app(guid)?;
        let attached = world.attached.get(guid).map_or(0, Vec::len);
        if !recursive && attached > 0 {
            return Err(PlatformError::Remote {
                status: 400,
                code: 10006,
                description: "Please delete the app associations for your apps".to_string(),
            }
            .into());
        }
        world.apps.remove(guid);
        world.attached.remove(guid);
        world.bindings.retain(|_, binding| binding.app_guid != guid);
        Ok(())
    }

    async fn upload_bits(&self, guid: &str, path: &Path) -> Result<(), Error> {
        let packed = bits::pack(path)?;
        let mut world = self.world()?;
        world.record("upload_bits", guid.to_string())?;
        world.app(guid)?;
        debug!("Stored {} bytes of bits for {}", packed.len(), guid);
        world.uploads.insert(guid.to_string(), packed.len());
        Ok(())
    }

    async fn instances(&self, guid: &str) -> Result<Vec<InstanceRecord>, Error> {
        let mut world = self.world()?;
        world.record("instances", guid.to_string())?;
        let states = match world.instance_samples.pop_front() {
            Some(sample) => sample?,
            None => world.default_states(guid)?,
        };
        Ok(states
            .into_iter()
            .zip(0..)
            .map(|(state, index)| InstanceRecord { index, state })
            .collect())
    }

    async fn stats(&self, guid: &str) -> Result<Vec<InstanceStats>, Error> {
        let mut world = self.world()?;
        world.record("stats", guid.to_string())?;
        let uris: Vec<String> = world
            .attached
            .get(guid)
            .into_iter()
            .flatten()
            .filter_map(|route| world.routes.get(route))
            .map(Route::url)
            .collect();
        Ok(world
            .default_states(guid)?
            .into_iter()
            .zip(0..)
            .map(|(state, index)| InstanceStats {
                index,
                state,
                uptime_secs: 0,
                cpu: 0.0,
                mem_bytes: 0,
                disk_bytes: 0,
                uris: uris.clone(),
            })
            .collect())
    }

    async fn env(&self, guid: &str) -> Result<serde_json::Value, Error> {
        let mut world = self.world()?;
        world.record("env", guid.to_string())?;
        let app = world.app(guid)?;
        Ok(serde_json::json!({
            "environment_json": app.environment,
            "application_env_json": {
                "VCAP_APPLICATION": {
                    "application_id": app.guid,
                    "application_name": app.name,
                }
            }
        }))
    }

    async fn files(&self, guid: &str, instance: u32, path: &str) -> Result<String, Error> {
        let mut world = self.world()?;
        world.record("files", format!("{} {} {}", guid, instance, path))?;
        world.app(guid)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if let Some(content) = world
            .files
            .get(&(guid.to_string(), instance, path.to_string()))
        {
            return Ok(content.clone());
        }
        let listing: Vec<String> = world
            .files
            .iter()
            .filter(|((app, index, _), _)| app == guid && *index == instance)
            .filter_map(|((_, _, file), content)| {
                file.strip_prefix(&prefix)
                    .map(|name| format!("{}  {}B", name, content.len()))
            })
            .collect();
        if listing.is_empty() {
            return Err(PlatformError::NotFound(format!("file {}", path)).into());
        }
        Ok(listing.join("\n"))
    }

    async fn events(&self, guid: &str) -> Result<Vec<AppEvent>, Error> {
        let mut world = self.world()?;
        world.record("events", guid.to_string())?;
        Ok(world.events.get(guid).cloned().unwrap_or_default())
    }

    async fn find_domain(&self, name: &str) -> Result<Option<Domain>, Error> {
        let mut world = self.world()?;
        world.record("find_domain", name.to_string())?;
        Ok(world.domains.values().find(|domain| domain.name == name).cloned())
    }

    async fn create_domain(&self, name: &str) -> Result<Domain, Error> {
        let mut world = self.world()?;
        world.record("create_domain", name.to_string())?;
        let domain = Domain {
            guid: new_guid(),
            name: name.to_string(),
        };
        world.domains.insert(domain.guid.clone(), domain.clone());
        Ok(domain)
    }

    async fn find_route(&self, host: &str, domain: &Domain) -> Result<Option<Route>, Error> {
        let mut world = self.world()?;
        world.record("find_route", format!("{}.{}", host, domain.name))?;
        Ok(world
            .routes
            .values()
            .find(|route| route.host == host && route.domain.guid == domain.guid)
            .cloned())
    }

    async fn create_route(&self, host: &str, domain: &Domain) -> Result<Route, Error> {
        let mut world = self.world()?;
        world.record("create_route", format!("{}.{}", host, domain.name))?;
        let route = Route {
            guid: new_guid(),
            host: host.to_string(),
            domain: domain.clone(),
        };
        world.routes.insert(route.guid.clone(), route.clone());
        Ok(route)
    }

    async fn app_routes(&self, guid: &str) -> Result<Vec<Route>, Error> {
        let mut world = self.world()?;
        world.record("app_routes", guid.to_string())?;
        world.app(guid)?;
        Ok(world
            .attached
            .get(guid)
            .into_iter()
            .flatten()
            .filter_map(|route| world.routes.get(route).cloned())
            .collect())
    }

    async fn attach_route(&self, guid: &str, route: &Route) -> Result<(), Error> {
        let mut world = self.world()?;
        world.record("attach_route", format!("{} {}", guid, route.url()))?;
        world.app(guid)?;
        if !world.routes.contains_key(&route.guid) {
            return Err(PlatformError::NotFound(format!("route {}", route.url())).into());
        }
        let attached = world.attached.entry(guid.to_string()).or_default();
        if !attached.contains(&route.guid) {
            attached.push(route.guid.clone());
        }
        Ok(())
    }

    async fn detach_route(&self, guid: &str, route: &Route) -> Result<(), Error> {
        let mut world = self.world()?;
        world.record("detach_route", format!("{} {}", guid, route.url()))?;
        world
            .attached
            .get_mut(guid)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", guid)))?
            .retain(|attached| attached != &route.guid);
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> Result<(), Error> {
        let mut world = self.world()?;
        world.record("delete_route", route.url())?;
        world
            .routes
            .remove(&route.guid)
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("route {}", route.url())).into())
    }

    async fn find_service_instance(&self, name: &str) -> Result<Option<ServiceInstance>, Error> {
        let mut world = self.world()?;
        world.record("find_service_instance", name.to_string())?;
        Ok(world
            .services
            .values()
            .find(|service| service.name == name)
            .cloned())
    }

    async fn create_service_instance(
        &self,
        name: &str,
        plan: Option<&str>,
    ) -> Result<ServiceInstance, Error> {
        let mut world = self.world()?;
        world.record(
            "create_service_instance",
            format!("{} {}", name, plan.unwrap_or("default")),
        )?;
        let service = ServiceInstance {
            guid: new_guid(),
            name: name.to_string(),
        };
        world.services.insert(service.guid.clone(), service.clone());
        Ok(service)
    }

    async fn bind_service(
        &self,
        guid: &str,
        service: &ServiceInstance,
    ) -> Result<ServiceBinding, Error> {
        let mut world = self.world()?;
        world.record("bind_service", format!("{} {}", guid, service.name))?;
        world.app(guid)?;
        let binding = ServiceBinding {
            guid: new_guid(),
            app_guid: guid.to_string(),
            service_instance_guid: service.guid.clone(),
        };
        world.bindings.insert(binding.guid.clone(), binding.clone());
        Ok(binding)
    }

    async fn app_bindings(&self, guid: &str) -> Result<Vec<ServiceBinding>, Error> {
        let mut world = self.world()?;
        world.record("app_bindings", guid.to_string())?;
        Ok(world
            .bindings
            .values()
            .filter(|binding| binding.app_guid == guid)
            .cloned()
            .collect())
    }

    async fn unbind_service(&self, binding: &ServiceBinding) -> Result<(), Error> {
        let mut world = self.world()?;
        world.record("unbind_service", binding.guid.clone())?;
        world
            .bindings
            .remove(&binding.guid)
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("binding {}", binding.guid)).into())
    }
}
