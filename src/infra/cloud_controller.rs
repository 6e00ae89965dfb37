use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{Context, Error};
use async_trait::async_trait;
use log::debug;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use crate::{
    config::PlatformSettings,
    domain::{
        error::PlatformError,
        model::{
            AppEvent, AppSpec, AppState, AppUpdate, Domain, InstanceRecord, InstanceState,
            InstanceStats, RemoteApp, Route, ServiceBinding, ServiceInstance,
        },
        port::PlatformClient,
    },
};

use super::bits;

/// Error code the platform returns while an app's droplet is not staged yet.
const NOT_STAGED: i64 = 170002;

#[derive(Deserialize)]
struct Page<T> {
    resources: Vec<Resource<T>>,
}

#[derive(Deserialize)]
struct Resource<T> {
    metadata: Metadata,
    entity: T,
}

#[derive(Deserialize)]
struct Metadata {
    guid: String,
}

#[derive(Deserialize)]
struct AppEntity {
    name: String,
    memory: u32,
    instances: u32,
    buildpack: Option<String>,
    command: Option<String>,
    #[serde(default)]
    environment_json: Option<HashMap<String, String>>,
    state: AppState,
}

impl From<Resource<AppEntity>> for RemoteApp {
    fn from(resource: Resource<AppEntity>) -> Self {
        let entity = resource.entity;
        RemoteApp {
            guid: resource.metadata.guid,
            name: entity.name,
            memory: entity.memory,
            instances: entity.instances,
            buildpack: entity.buildpack,
            command: entity.command,
            environment: entity.environment_json.unwrap_or_default(),
            state: entity.state,
        }
    }
}

#[derive(Deserialize)]
struct NamedEntity {
    name: String,
}

#[derive(Deserialize)]
struct RouteEntity {
    host: String,
    domain_guid: String,
}

#[derive(Deserialize)]
struct BindingEntity {
    app_guid: String,
    service_instance_guid: String,
}

impl From<Resource<BindingEntity>> for ServiceBinding {
    fn from(resource: Resource<BindingEntity>) -> Self {
        ServiceBinding {
            guid: resource.metadata.guid,
            app_guid: resource.entity.app_guid,
            service_instance_guid: resource.entity.service_instance_guid,
        }
    }
}

#[derive(Deserialize)]
struct EventEntity {
    #[serde(rename = "type")]
    kind: String,
    actor_name: Option<String>,
    timestamp: String,
}

#[derive(Deserialize)]
struct InstanceEntry {
    state: InstanceState,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Usage {
    cpu: f64,
    mem: u64,
    disk: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct StatsDetail {
    uptime: u64,
    usage: Usage,
    uris: Vec<String>,
}

#[derive(Deserialize)]
struct StatsEntry {
    state: InstanceState,
    #[serde(default)]
    stats: StatsDetail,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ApiErrorBody {
    code: i64,
    description: String,
}

/// Map a non-2xx response to the error taxonomy.
fn classify(status: StatusCode, body: &str, what: &str) -> PlatformError {
    let api_error: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let description = if api_error.description.is_empty() {
        body.to_string()
    } else {
        api_error.description
    };
    if api_error.code == NOT_STAGED {
        PlatformError::StagingPending(description)
    } else if status == StatusCode::NOT_FOUND {
        PlatformError::NotFound(what.to_string())
    } else if status == StatusCode::GATEWAY_TIMEOUT {
        PlatformError::Timeout(what.to_string())
    } else {
        PlatformError::Remote {
            status: status.as_u16(),
            code: api_error.code,
            description,
        }
    }
}

fn transport_error(error: reqwest::Error, what: &str) -> Error {
    if error.is_timeout() {
        PlatformError::Timeout(what.to_string()).into()
    } else {
        Error::from(error).context(format!("Can't reach platform API for {}", what))
    }
}

/// Platform client speaking the v2 REST API of the controller.
#[derive(Clone)]
pub struct CloudControllerClient {
    api_url: String,
    space_guid: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl CloudControllerClient {
    pub fn new(settings: &PlatformSettings) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("Can't build platform HTTP client")?;
        Ok(Self {
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            space_guid: settings.space_guid.clone(),
            token: settings.token.clone(),
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.api_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, Error> {
        let response = builder
            .send()
            .await
            .map_err(|error| transport_error(error, what))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!("Platform API answered {} for {}: {}", status, what, body);
        Err(classify(status, &body, what).into())
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T, Error> {
        self.send(builder, what)
            .await?
            .json()
            .await
            .with_context(|| format!("Can't decode platform response for {}", what))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Vec<Resource<T>>, Error> {
        let page: Page<T> = self
            .json(self.request(Method::GET, path).query(query), what)
            .await?;
        Ok(page.resources)
    }

    async fn first<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Option<Resource<T>>, Error> {
        Ok(self.list(path, query, what).await?.into_iter().next())
    }

    async fn delete(&self, path: &str, what: &str) -> Result<(), Error> {
        self.send(self.request(Method::DELETE, path), what)
            .await
            .map(|_| ())
    }

    async fn domain(&self, guid: &str) -> Result<Domain, Error> {
        let resource: Resource<NamedEntity> = self
            .json(
                self.request(Method::GET, &format!("/v2/domains/{}", guid)),
                "domain",
            )
            .await?;
        Ok(Domain {
            guid: resource.metadata.guid,
            name: resource.entity.name,
        })
    }
}

#[async_trait]
impl PlatformClient for CloudControllerClient {
    async fn find_app(&self, name: &str) -> Result<Option<RemoteApp>, Error> {
        let query = [
            ("q", format!("name:{}", name)),
            ("q", format!("space_guid:{}", self.space_guid)),
        ];
        Ok(self
            .first::<AppEntity>("/v2/apps", &query, "app lookup")
            .await?
            .map(RemoteApp::from))
    }

    async fn create_app(&self, spec: &AppSpec) -> Result<RemoteApp, Error> {
        let body = json!({
            "name": spec.name,
            "space_guid": self.space_guid,
            "memory": spec.memory,
            "instances": spec.instances,
            "buildpack": spec.buildpack,
            "command": spec.command,
            "environment_json": spec.environment,
        });
        let resource: Resource<AppEntity> = self
            .json(self.request(Method::POST, "/v2/apps").json(&body), "app creation")
            .await?;
        Ok(resource.into())
    }

    async fn update_app(&self, guid: &str, update: &AppUpdate) -> Result<RemoteApp, Error> {
        let mut body = serde_json::to_value(update)?;
        if let Some(environment) = body.as_object_mut().and_then(|body| body.remove("environment")) {
            body["environment_json"] = environment;
        }
        let resource: Resource<AppEntity> = self
            .json(
                self.request(Method::PUT, &format!("/v2/apps/{}", guid))
                    .json(&body),
                "app update",
            )
            .await?;
        Ok(resource.into())
    }

    async fn set_state(&self, guid: &str, state: AppState) -> Result<RemoteApp, Error> {
        let resource: Resource<AppEntity> = self
            .json(
                self.request(Method::PUT, &format!("/v2/apps/{}", guid))
                    .json(&json!({ "state": state })),
                "app state change",
            )
            .await?;
        Ok(resource.into())
    }

    async fn delete_app(&self, guid: &str, recursive: bool) -> Result<(), Error> {
        self.delete(
            &format!("/v2/apps/{}?recursive={}", guid, recursive),
            "app deletion",
        )
        .await
    }

    async fn upload_bits(&self, guid: &str, path: &Path) -> Result<(), Error> {
        let packed = bits::pack(path)?;
        debug!("Uploading {} bytes of bits for {}", packed.len(), guid);
        self.send(
            self.request(Method::PUT, &format!("/v2/apps/{}/bits", guid))
                .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                .body(packed),
            "bits upload",
        )
        .await
        .map(|_| ())
    }

    async fn instances(&self, guid: &str) -> Result<Vec<InstanceRecord>, Error> {
        let entries: HashMap<String, InstanceEntry> = self
            .json(
                self.request(Method::GET, &format!("/v2/apps/{}/instances", guid)),
                "instance listing",
            )
            .await?;
        let mut instances = entries
            .into_iter()
            .map(|(index, entry)| {
                Ok(InstanceRecord {
                    index: index
                        .parse()
                        .with_context(|| format!("Invalid instance index {}", index))?,
                    state: entry.state,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        instances.sort_by_key(|instance| instance.index);
        Ok(instances)
    }

    async fn stats(&self, guid: &str) -> Result<Vec<InstanceStats>, Error> {
        let entries: HashMap<String, StatsEntry> = self
            .json(
                self.request(Method::GET, &format!("/v2/apps/{}/stats", guid)),
                "instance stats",
            )
            .await?;
        let mut stats = entries
            .into_iter()
            .map(|(index, entry)| {
                Ok(InstanceStats {
                    index: index
                        .parse()
                        .with_context(|| format!("Invalid instance index {}", index))?,
                    state: entry.state,
                    uptime_secs: entry.stats.uptime,
                    cpu: entry.stats.usage.cpu,
                    mem_bytes: entry.stats.usage.mem,
                    disk_bytes: entry.stats.usage.disk,
                    uris: entry.stats.uris,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        stats.sort_by_key(|stats| stats.index);
        Ok(stats)
    }

    async fn env(&self, guid: &str) -> Result<serde_json::Value, Error> {
        self.json(
            self.request(Method::GET, &format!("/v2/apps/{}/env", guid)),
            "app env",
        )
        .await
    }

    async fn files(&self, guid: &str, instance: u32, path: &str) -> Result<String, Error> {
        let what = format!("file {}", path);
        self.send(
            self.request(
                Method::GET,
                &format!(
                    "/v2/apps/{}/instances/{}/files/{}",
                    guid,
                    instance,
                    path.trim_start_matches('/')
                ),
            ),
            &what,
        )
        .await?
        .text()
        .await
        .with_context(|| format!("Can't read {}", what))
    }

    async fn events(&self, guid: &str) -> Result<Vec<AppEvent>, Error> {
        Ok(self
            .list::<EventEntity>("/v2/events", &[("q", format!("actee:{}", guid))], "events")
            .await?
            .into_iter()
            .map(|resource| AppEvent {
                kind: resource.entity.kind,
                actor: resource.entity.actor_name.unwrap_or_default(),
                timestamp: resource.entity.timestamp,
            })
            .collect())
    }

    async fn find_domain(&self, name: &str) -> Result<Option<Domain>, Error> {
        Ok(self
            .first::<NamedEntity>("/v2/domains", &[("q", format!("name:{}", name))], "domain lookup")
            .await?
            .map(|resource| Domain {
                guid: resource.metadata.guid,
                name: resource.entity.name,
            }))
    }

    async fn create_domain(&self, name: &str) -> Result<Domain, Error> {
        let resource: Resource<NamedEntity> = self
            .json(
                self.request(Method::POST, "/v2/shared_domains")
                    .json(&json!({ "name": name })),
                "domain creation",
            )
            .await?;
        Ok(Domain {
            guid: resource.metadata.guid,
            name: resource.entity.name,
        })
    }

    async fn find_route(&self, host: &str, domain: &Domain) -> Result<Option<Route>, Error> {
        let query = [
            ("q", format!("host:{}", host)),
            ("q", format!("domain_guid:{}", domain.guid)),
        ];
        Ok(self
            .first::<RouteEntity>("/v2/routes", &query, "route lookup")
            .await?
            .map(|resource| Route {
                guid: resource.metadata.guid,
                host: resource.entity.host,
                domain: domain.clone(),
            }))
    }

    async fn create_route(&self, host: &str, domain: &Domain) -> Result<Route, Error> {
        let body = json!({
            "host": host,
            "domain_guid": domain.guid,
            "space_guid": self.space_guid,
        });
        let resource: Resource<RouteEntity> = self
            .json(self.request(Method::POST, "/v2/routes").json(&body), "route creation")
            .await?;
        Ok(Route {
            guid: resource.metadata.guid,
            host: resource.entity.host,
            domain: domain.clone(),
        })
    }

    async fn app_routes(&self, guid: &str) -> Result<Vec<Route>, Error> {
        let resources = self
            .list::<RouteEntity>(&format!("/v2/apps/{}/routes", guid), &[], "app routes")
            .await?;
        let mut domains: HashMap<String, Domain> = HashMap::new();
        let mut routes = Vec::with_capacity(resources.len());
        for resource in resources {
            let domain = match domains.get(&resource.entity.domain_guid) {
                Some(domain) => domain.clone(),
                None => {
                    let domain = self.domain(&resource.entity.domain_guid).await?;
                    domains.insert(domain.guid.clone(), domain.clone());
                    domain
                }
            };
            routes.push(Route {
                guid: resource.metadata.guid,
                host: resource.entity.host,
                domain,
            });
        }
        Ok(routes)
    }

    async fn attach_route(&self, guid: &str, route: &Route) -> Result<(), Error> {
        self.send(
            self.request(
                Method::PUT,
                &format!("/v2/apps/{}/routes/{}", guid, route.guid),
            ),
            "route mapping",
        )
        .await
        .map(|_| ())
    }

    async fn detach_route(&self, guid: &str, route: &Route) -> Result<(), Error> {
        self.delete(
            &format!("/v2/apps/{}/routes/{}", guid, route.guid),
            "route unmapping",
        )
        .await
    }

    async fn delete_route(&self, route: &Route) -> Result<(), Error> {
        self.delete(&format!("/v2/routes/{}", route.guid), "route deletion")
            .await
    }

    async fn find_service_instance(&self, name: &str) -> Result<Option<ServiceInstance>, Error> {
        let query = [
            ("q", format!("name:{}", name)),
            ("q", format!("space_guid:{}", self.space_guid)),
        ];
        Ok(self
            .first::<NamedEntity>("/v2/service_instances", &query, "service lookup")
            .await?
            .map(|resource| ServiceInstance {
                guid: resource.metadata.guid,
                name: resource.entity.name,
            }))
    }

    async fn create_service_instance(
        &self,
        name: &str,
        plan: Option<&str>,
    ) -> Result<ServiceInstance, Error> {
        let plan = plan.unwrap_or("default");
        let plan_guid = self
            .first::<NamedEntity>("/v2/service_plans", &[("q", format!("name:{}", plan))], "service plan lookup")
            .await?
            .map(|resource| resource.metadata.guid)
            .ok_or_else(|| PlatformError::Validation(format!("unknown service plan {}", plan)))?;
        let body = json!({
            "name": name,
            "space_guid": self.space_guid,
            "service_plan_guid": plan_guid,
        });
        let resource: Resource<NamedEntity> = self
            .json(
                self.request(Method::POST, "/v2/service_instances").json(&body),
                "service creation",
            )
            .await?;
        Ok(ServiceInstance {
            guid: resource.metadata.guid,
            name: resource.entity.name,
        })
    }

    async fn bind_service(
        &self,
        guid: &str,
        service: &ServiceInstance,
    ) -> Result<ServiceBinding, Error> {
        let body = json!({
            "app_guid": guid,
            "service_instance_guid": service.guid,
        });
        let resource: Resource<BindingEntity> = self
            .json(
                self.request(Method::POST, "/v2/service_bindings").json(&body),
                "service binding",
            )
            .await?;
        Ok(resource.into())
    }

    async fn app_bindings(&self, guid: &str) -> Result<Vec<ServiceBinding>, Error> {
        Ok(self
            .list::<BindingEntity>(
                &format!("/v2/apps/{}/service_bindings", guid),
                &[],
                "service bindings",
            )
            .await?
            .into_iter()
            .map(ServiceBinding::from)
            .collect())
    }

    async fn unbind_service(&self, binding: &ServiceBinding) -> Result<(), Error> {
        self.delete(
            &format!("/v2/service_bindings/{}", binding.guid),
            "service unbinding",
        )
        .await
    }
}
