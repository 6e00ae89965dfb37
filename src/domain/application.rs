//! Controller driving one remote application through a test.
//!
//! An [`Application`] is bound to an application *name*; the remote entity may
//! or may not exist at any moment. Operations that need it re-read it first and
//! fail with [`PlatformError::NotFound`] when it is missing. Every failure is
//! logged with the application name and the attempted action before it is
//! handed back to the caller.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error};
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::{distributions::Alphanumeric, Rng};

use super::{
    error::PlatformError,
    model::{
        AppEvent, AppManifest, AppSpec, AppState, AppUpdate, HttpResponse, HttpVerb,
        InstanceState, InstanceStats, Manifest, ProbeRequest, RemoteApp, Route, ServiceBinding,
    },
    readiness,
    retry::{retry, RetryPolicy},
    route::{host_for, RouteUrl},
    Session,
};

const CRASH_LOG: &str = "logs/stderr.log";

pub struct Application {
    session: Arc<Session>,
    name: String,
    manifest: AppManifest,
    remote: Option<RemoteApp>,
}

impl Application {
    pub fn new(session: Arc<Session>, name: impl Into<String>, manifest: AppManifest) -> Self {
        Self {
            session,
            name: name.into(),
            manifest,
            remote: None,
        }
    }

    /// Controller for the manifest entry `id`, named after it.
    pub fn from_manifest(session: Arc<Session>, manifest: &Manifest, id: &str) -> Result<Self, Error> {
        let entry = manifest
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::Validation(format!("no manifest entry for {}", id)))?;
        Ok(Self::new(session, id, entry))
    }

    /// Random, DNS friendly application name starting with `prefix`.
    pub fn unique_name(prefix: &str) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect();
        format!("{}-{}", prefix, suffix.to_ascii_lowercase())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> &AppManifest {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut AppManifest {
        &mut self.manifest
    }

    /// Last known remote state, as of the previous operation.
    pub fn remote(&self) -> Option<&RemoteApp> {
        self.remote.as_ref()
    }

    /// Default `host.domain` of the application in the target domain.
    pub fn url(&self) -> String {
        format!("{}.{}", host_for(&self.name), self.session.target_domain)
    }

    fn logged<T>(&self, action: &str, result: Result<T, Error>) -> Result<T, Error> {
        result.map_err(|e| {
            error!("Can't {} application {}: {:?}", action, self.name, e);
            e.context(format!("Can't {} application {}", action, self.name))
        })
    }

    pub async fn refresh(&mut self) -> Result<Option<&RemoteApp>, Error> {
        let found = self.session.platform.find_app(&self.name).await;
        self.remote = self.logged("look up", found)?;
        Ok(self.remote.as_ref())
    }

    pub async fn exists(&mut self) -> Result<bool, Error> {
        Ok(self.refresh().await?.is_some())
    }

    async fn require(&mut self, action: &str) -> Result<RemoteApp, Error> {
        let remote = self.refresh().await?.cloned();
        match remote {
            Some(app) => Ok(app),
            None => self.logged(
                action,
                Err(PlatformError::NotFound(format!("application {}", self.name)).into()),
            ),
        }
    }

    /// Create the application, or bring an existing one in line with the manifest.
    pub async fn push(&mut self) -> Result<(), Error> {
        let remote = self.refresh().await?.cloned();
        match remote {
            Some(app) => {
                info!("Application {} exists, synchronizing manifest", self.name);
                self.sync(&app).await?;
                if app.state == AppState::Started {
                    self.restart(true).await?;
                }
                Ok(())
            }
            None => self.create().await,
        }
    }

    pub async fn create(&mut self) -> Result<(), Error> {
        info!("Creating application {}", self.name);
        let spec = AppSpec::from_manifest(&self.name, &self.manifest);
        let created = self.session.platform.create_app(&spec).await;
        let app = self.logged("create", created)?;
        self.remote = Some(app.clone());

        if !self.manifest.no_url {
            let urls = if self.manifest.uris.is_empty() {
                vec![self.url()]
            } else {
                self.manifest.uris.clone()
            };
            for url in urls {
                self.map(&url).await?;
            }
        }
        for service in self.manifest.services.clone() {
            self.bind(&service, false).await?;
        }
        if let Some(path) = self.manifest.path.clone() {
            info!("Uploading {} for application {}", path.display(), self.name);
            let uploaded = self.session.platform.upload_bits(&app.guid, &path).await;
            self.logged("upload bits of", uploaded)?;
        }
        if !self.manifest.no_start {
            self.start(true).await?;
        }
        Ok(())
    }

    /// Push manifest changes; returns whether anything had to be updated.
    pub async fn update(&mut self) -> Result<bool, Error> {
        let app = self.require("update").await?;
        self.sync(&app).await
    }

    async fn sync(&mut self, app: &RemoteApp) -> Result<bool, Error> {
        let update = self.manifest.diff(app);
        if update.is_empty() {
            debug!("Application {} is up-to-date", self.name);
            return Ok(false);
        }
        info!("Updating application {} with {:?}", self.name, update);
        let updated = self.session.platform.update_app(&app.guid, &update).await;
        self.remote = Some(self.logged("update", updated)?);
        Ok(true)
    }

    /// Remove every route of the application, then the application itself.
    pub async fn delete(&mut self) -> Result<(), Error> {
        let app = self.require("delete").await?;
        let platform = &self.session.platform;
        let routes = self.logged("list routes of", platform.app_routes(&app.guid).await)?;
        info!(
            "Deleting application {} and its {} routes",
            self.name,
            routes.len()
        );
        let guid = app.guid.as_str();
        let removed = futures::future::join_all(routes.iter().map(|route| async move {
            platform.detach_route(guid, route).await?;
            platform.delete_route(route).await
        }))
        .await
        .into_iter()
        .collect::<Result<(), Error>>();
        self.logged("remove routes of", removed)?;
        let deleted = platform.delete_app(guid, true).await;
        self.logged("delete", deleted)?;
        self.remote = None;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), Error> {
        let app = self.require("stop").await?;
        if app.state == AppState::Stopped {
            debug!("Application {} is already stopped", self.name);
            return Ok(());
        }
        info!("Stopping application {}", self.name);
        let stopped = self
            .session
            .platform
            .set_state(&app.guid, AppState::Stopped)
            .await;
        self.remote = Some(self.logged("stop", stopped)?);
        Ok(())
    }

    /// Start the application; gateway timeouts on the request are retried.
    pub async fn start(&mut self, check_ready: bool) -> Result<(), Error> {
        let app = self.require("start").await?;
        if app.state == AppState::Started {
            debug!("Application {} is already started", self.name);
        } else {
            info!("Starting application {}", self.name);
            let timings = &self.session.timings;
            let policy = RetryPolicy {
                retries: timings.start_retries,
                backoff: Duration::from_millis(timings.start_backoff_ms),
            };
            let platform = &self.session.platform;
            let started = retry(
                policy,
                &format!("start of {}", self.name),
                PlatformError::is_timeout,
                || platform.set_state(&app.guid, AppState::Started),
            )
            .await;
            self.remote = Some(self.logged("start", started)?);
        }
        if check_ready {
            self.await_ready(&app.guid).await?;
        }
        Ok(())
    }

    pub async fn restart(&mut self, check_ready: bool) -> Result<(), Error> {
        self.stop().await?;
        self.start(check_ready).await
    }

    pub async fn wait_until_running(&mut self) -> Result<(), Error> {
        let app = self.require("wait for").await?;
        self.await_ready(&app.guid).await
    }

    async fn await_ready(&self, guid: &str) -> Result<(), Error> {
        let ready = readiness::wait_until_running(
            self.session.platform.as_ref(),
            &self.name,
            guid,
            &self.session.timings,
            self.manifest.timeout(),
        )
        .await;
        self.logged("wait for", ready)
    }

    /// One readiness sample: are all instances running right now?
    pub async fn healthy(&mut self) -> Result<bool, Error> {
        let app = self.require("check health of").await?;
        let sample =
            readiness::sample(self.session.platform.as_ref(), &app.guid, &self.session.timings)
                .await;
        self.logged("check health of", sample)
    }

    /// Change the instance count and optionally the memory; a memory change
    /// restarts a started application.
    pub async fn scale(&mut self, instances: u32, memory: Option<u32>) -> Result<(), Error> {
        let app = self.require("scale").await?;
        let update = AppUpdate {
            instances: (instances != app.instances).then_some(instances),
            memory: memory.filter(|memory| *memory != app.memory),
            ..Default::default()
        };
        if !update.is_empty() {
            info!("Scaling application {} with {:?}", self.name, update);
            let updated = self.session.platform.update_app(&app.guid, &update).await;
            self.remote = Some(self.logged("scale", updated)?);
        }
        self.manifest.instances = instances;
        if let Some(memory) = memory {
            self.manifest.memory = memory;
        }
        let started = self
            .remote
            .as_ref()
            .is_some_and(|app| app.state == AppState::Started);
        if update.memory.is_some() && started {
            self.restart(true).await?;
        }
        Ok(())
    }

    async fn resolve_route(&self, target: &RouteUrl) -> Result<Route, Error> {
        let platform = &self.session.platform;
        let domain = match platform.find_domain(&target.domain).await? {
            Some(domain) => domain,
            None => {
                info!("Creating domain {}", target.domain);
                platform.create_domain(&target.domain).await?
            }
        };
        match platform.find_route(&target.host, &domain).await? {
            Some(route) => Ok(route),
            None => {
                info!("Creating route {}", target);
                platform.create_route(&target.host, &domain).await
            }
        }
    }

    /// Attach `url` to the application, creating its domain and route if needed.
    pub async fn map(&mut self, url: &str) -> Result<Route, Error> {
        let app = self.require("map a route to").await?;
        let target = self.logged("map a route to", RouteUrl::parse(url).map_err(Error::from))?;
        let route = self.logged("map a route to", self.resolve_route(&target).await)?;
        let platform = &self.session.platform;
        let attached = self.logged("list routes of", platform.app_routes(&app.guid).await)?;
        if attached.iter().any(|existing| existing.guid == route.guid) {
            debug!("Route {} already mapped to {}", route.url(), self.name);
            return Ok(route);
        }
        info!("Mapping {} to application {}", route.url(), self.name);
        let mapped = platform.attach_route(&app.guid, &route).await;
        self.logged("map a route to", mapped)?;
        Ok(route)
    }

    /// Detach `url` from the application and optionally delete the route.
    pub async fn unmap(&mut self, url: &str, delete_route: bool) -> Result<(), Error> {
        let app = self.require("unmap a route from").await?;
        let target = self.logged(
            "unmap a route from",
            RouteUrl::parse(url).map_err(Error::from),
        )?;
        let platform = &self.session.platform;
        let routes = self.logged("list routes of", platform.app_routes(&app.guid).await)?;
        let Some(route) = routes
            .into_iter()
            .find(|route| target.matches(&route.host, &route.domain.name))
        else {
            return self.logged(
                "unmap a route from",
                Err(PlatformError::Validation(format!(
                    "url {} is not mapped to application {}",
                    url, self.name
                ))
                .into()),
            );
        };
        info!("Unmapping {} from application {}", route.url(), self.name);
        let detached = platform.detach_route(&app.guid, &route).await;
        self.logged("unmap a route from", detached)?;
        if delete_route {
            let deleted = platform.delete_route(&route).await;
            self.logged("delete a route of", deleted)?;
        }
        Ok(())
    }

    /// Provision the manifest services the session does not know yet.
    pub async fn provision_services(&self) -> Result<(), Error> {
        for service in &self.manifest.services {
            if !self.logged("provision services of", self.session.knows_service(service))? {
                let provisioned = self
                    .session
                    .provision_service(service, self.manifest.plan.as_deref())
                    .await;
                self.logged("provision services of", provisioned)?;
            }
        }
        Ok(())
    }

    pub async fn bind(&mut self, service: &str, restart: bool) -> Result<ServiceBinding, Error> {
        let instance = self.logged("bind a service to", self.session.service(service).await)?;
        let app = self.require("bind a service to").await?;
        info!("Binding service {} to application {}", service, self.name);
        let bound = self
            .session
            .platform
            .bind_service(&app.guid, &instance)
            .await;
        let binding = self.logged("bind a service to", bound)?;
        if restart {
            self.restart(true).await?;
        }
        Ok(binding)
    }

    pub async fn unbind(&mut self, service: &str, restart: bool) -> Result<(), Error> {
        let instance = self.logged("unbind a service from", self.session.service(service).await)?;
        let app = self.require("unbind a service from").await?;
        let platform = &self.session.platform;
        let bindings = self.logged("list bindings of", platform.app_bindings(&app.guid).await)?;
        let Some(binding) = bindings
            .into_iter()
            .find(|binding| binding.service_instance_guid == instance.guid)
        else {
            return self.logged(
                "unbind a service from",
                Err(PlatformError::Validation(format!(
                    "service {} is not bound to application {}",
                    service, self.name
                ))
                .into()),
            );
        };
        info!("Unbinding service {} from application {}", service, self.name);
        let unbound = platform.unbind_service(&binding).await;
        self.logged("unbind a service from", unbound)?;
        if restart {
            self.restart(true).await?;
        }
        Ok(())
    }

    /// Send an ad hoc request to `path` on the application's default URL.
    ///
    /// Any status code is returned as a response; only transport failures are
    /// errors. The call settles for a moment afterwards so the application can
    /// finish processing asynchronously.
    pub async fn request(
        &self,
        verb: HttpVerb,
        path: &str,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let separator = if path.starts_with('/') { "" } else { "/" };
        let url = format!("http://{}{}{}", self.url(), separator, path);
        let sent = self
            .session
            .prober
            .send(ProbeRequest {
                verb,
                url: url.clone(),
                body,
                timeout,
            })
            .await;
        tokio::time::sleep(self.session.timings.settle_delay()).await;
        let response = self.logged(&format!("send {:?} {} to", verb, url), sent)?;
        if !response.is_success() {
            warn!(
                "{:?} {} answered {}: {}",
                verb, url, response.code, response.body
            );
        }
        Ok(response)
    }

    pub async fn get(&self, path: &str, timeout: Duration) -> Result<HttpResponse, Error> {
        self.request(HttpVerb::Get, path, None, timeout).await
    }

    /// Distinct `host.domain` of every route mapped to the application.
    pub async fn urls(&mut self) -> Result<Vec<String>, Error> {
        let app = self.require("list urls of").await?;
        let routes = self.session.platform.app_routes(&app.guid).await;
        Ok(self
            .logged("list urls of", routes)?
            .iter()
            .map(Route::url)
            .unique()
            .collect())
    }

    pub async fn stats(&mut self) -> Result<Vec<InstanceStats>, Error> {
        let app = self.require("read stats of").await?;
        let stats = self.session.platform.stats(&app.guid).await;
        self.logged("read stats of", stats)
    }

    pub async fn env(&mut self) -> Result<serde_json::Value, Error> {
        let app = self.require("read env of").await?;
        let env = self.session.platform.env(&app.guid).await;
        self.logged("read env of", env)
    }

    pub async fn total_instances(&mut self) -> Result<usize, Error> {
        let app = self.require("count instances of").await?;
        let instances = self.session.platform.instances(&app.guid).await;
        Ok(self.logged("count instances of", instances)?.len())
    }

    /// Entry names of a directory on the first instance.
    pub async fn files(&mut self, path: &str) -> Result<Vec<String>, Error> {
        let listing = self.file(path).await?;
        Ok(listing
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(String::from)
            .collect())
    }

    /// Content of a file on the first instance.
    pub async fn file(&mut self, path: &str) -> Result<String, Error> {
        let app = self.require("read files of").await?;
        let content = self.session.platform.files(&app.guid, 0, path).await;
        self.logged("read files of", content)
    }

    pub async fn logs(&mut self) -> Result<String, Error> {
        let stdout = self.file("logs/stdout.log").await?;
        let stderr = self.file(CRASH_LOG).await?;
        Ok(format!("{}{}", stdout, stderr))
    }

    /// stderr of every crashed instance, skipping instances without one.
    pub async fn crash_logs(&mut self) -> Result<Vec<(u32, String)>, Error> {
        let app = self.require("read crash logs of").await?;
        let platform = &self.session.platform;
        let instances = self.logged(
            "read crash logs of",
            platform.instances(&app.guid).await,
        )?;
        let mut logs = vec![];
        for instance in instances
            .iter()
            .filter(|instance| instance.state == InstanceState::Crashed)
        {
            match platform.files(&app.guid, instance.index, CRASH_LOG).await {
                Ok(log) => logs.push((instance.index, log)),
                Err(e) if PlatformError::of(&e).is_some_and(PlatformError::is_not_found) => {
                    debug!(
                        "No crash log on instance {} of {}",
                        instance.index, self.name
                    );
                }
                Err(e) => {
                    return self.logged(
                        "read crash logs of",
                        Err(e.context(format!("instance {}", instance.index))),
                    )
                }
            }
        }
        Ok(logs)
    }

    pub async fn events(&mut self) -> Result<Vec<AppEvent>, Error> {
        let app = self.require("read events of").await?;
        let events = self
            .session
            .platform
            .events(&app.guid)
            .await
            .with_context(|| format!("events of {}", app.guid));
        self.logged("read events of", events)
    }
}
