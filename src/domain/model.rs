use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Manifest entries keyed by application identifier.
pub type Manifest = HashMap<String, AppManifest>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppManifest {
    pub path: Option<PathBuf>,
    pub instances: u32,
    /// Memory in megabytes.
    pub memory: u32,
    pub buildpack: Option<String>,
    pub command: Option<String>,
    pub env: HashMap<String, String>,
    /// Service plan used when provisioning the services below.
    pub plan: Option<String>,
    pub services: Vec<String>,
    pub timeout_secs: u64,
    pub no_start: bool,
    pub no_url: bool,
    pub uris: Vec<String>,
}

impl Default for AppManifest {
    fn default() -> Self {
        Self {
            path: None,
            instances: 1,
            memory: 256,
            buildpack: None,
            command: None,
            env: HashMap::new(),
            plan: None,
            services: vec![],
            timeout_secs: 120,
            no_start: false,
            no_url: false,
            uris: vec![],
        }
    }
}

impl AppManifest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fields to push for a remote application that differs from this manifest.
    pub fn diff(&self, remote: &RemoteApp) -> AppUpdate {
        AppUpdate {
            memory: (self.memory != remote.memory).then_some(self.memory),
            instances: (self.instances != remote.instances).then_some(self.instances),
            buildpack: self
                .buildpack
                .clone()
                .filter(|buildpack| remote.buildpack.as_ref() != Some(buildpack)),
            command: self
                .command
                .clone()
                .filter(|command| remote.command.as_ref() != Some(command)),
            environment: (self.env != remote.environment).then(|| self.env.clone()),
        }
    }
}

/// Delays and retry bounds used while driving an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    pub grace_period_secs: u64,
    pub poll_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub start_retries: u32,
    pub start_backoff_ms: u64,
    pub staging_retries: u32,
    pub staging_backoff_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            poll_interval_secs: 1,
            settle_delay_secs: 1,
            start_retries: 5,
            start_backoff_ms: 1000,
            staging_retries: 3,
            staging_backoff_ms: 500,
        }
    }
}

impl Timings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Running,
    Starting,
    Down,
    Crashed,
    Flapping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteApp {
    pub guid: String,
    pub name: String,
    pub memory: u32,
    pub instances: u32,
    pub buildpack: Option<String>,
    pub command: Option<String>,
    pub environment: HashMap<String, String>,
    pub state: AppState,
}

/// Creation request for a new application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub memory: u32,
    pub instances: u32,
    pub buildpack: Option<String>,
    pub command: Option<String>,
    pub environment: HashMap<String, String>,
}

impl AppSpec {
    pub fn from_manifest(name: &str, manifest: &AppManifest) -> Self {
        Self {
            name: name.to_string(),
            memory: manifest.memory,
            instances: manifest.instances,
            buildpack: manifest.buildpack.clone(),
            command: manifest.command.clone(),
            environment: manifest.env.clone(),
        }
    }
}

/// Partial update; `None` fields are left untouched remotely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
}

impl AppUpdate {
    pub fn is_empty(&self) -> bool {
        self == &AppUpdate::default()
    }

    pub fn apply(&self, app: &mut RemoteApp) {
        if let Some(memory) = self.memory {
            app.memory = memory;
        }
        if let Some(instances) = self.instances {
            app.instances = instances;
        }
        if let Some(buildpack) = &self.buildpack {
            app.buildpack = Some(buildpack.clone());
        }
        if let Some(command) = &self.command {
            app.command = Some(command.clone());
        }
        if let Some(environment) = &self.environment {
            app.environment = environment.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub index: u32,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStats {
    pub index: u32,
    pub state: InstanceState,
    pub uptime_secs: u64,
    pub cpu: f64,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub guid: String,
    pub host: String,
    pub domain: Domain,
}

impl Route {
    pub fn url(&self) -> String {
        format!("{}.{}", self.host, self.domain.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceBinding {
    pub guid: String,
    pub app_guid: String,
    pub service_instance_guid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppEvent {
    pub kind: String,
    pub actor: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl std::str::FromStr for HttpVerb {
    type Err = super::error::PlatformError;

    fn from_str(verb: &str) -> Result<Self, Self::Err> {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpVerb::Get),
            "PUT" => Ok(HttpVerb::Put),
            "POST" => Ok(HttpVerb::Post),
            "DELETE" => Ok(HttpVerb::Delete),
            other => Err(super::error::PlatformError::Validation(format!(
                "unsupported HTTP method {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub verb: HttpVerb,
    pub url: String,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// Outcome of an ad hoc request, whatever the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use map_macro::hash_map;

    use super::*;

    fn remote(manifest: &AppManifest) -> RemoteApp {
        RemoteApp {
            guid: "guid".into(),
            name: "app".into(),
            memory: manifest.memory,
            instances: manifest.instances,
            buildpack: manifest.buildpack.clone(),
            command: manifest.command.clone(),
            environment: manifest.env.clone(),
            state: AppState::Stopped,
        }
    }

    #[test]
    fn unchanged_manifest_has_empty_diff() {
        let manifest = AppManifest {
            buildpack: Some("ruby".into()),
            env: hash_map! { "MODE".to_string() => "test".to_string() },
            ..Default::default()
        };
        assert!(manifest.diff(&remote(&manifest)).is_empty());
    }

    #[test]
    fn diff_only_carries_changed_fields() {
        let manifest = AppManifest {
            instances: 3,
            command: Some("bundle exec rackup".into()),
            ..Default::default()
        };
        let mut app = remote(&AppManifest::default());
        let update = manifest.diff(&app);
        assert_eq!(
            update,
            AppUpdate {
                instances: Some(3),
                command: Some("bundle exec rackup".into()),
                ..Default::default()
            }
        );
        update.apply(&mut app);
        assert!(manifest.diff(&app).is_empty());
    }

    #[test]
    fn unset_buildpack_does_not_clear_remote_one() {
        let manifest = AppManifest::default();
        let mut app = remote(&manifest);
        app.buildpack = Some("go".into());
        assert!(manifest.diff(&app).is_empty());
    }

    #[test]
    fn unknown_instance_states_are_tolerated() {
        let state: InstanceState = serde_json::from_str("\"EVACUATING\"").unwrap();
        assert_eq!(state, InstanceState::Unknown);
        let state: InstanceState = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(state, InstanceState::Running);
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!("delete".parse::<HttpVerb>().unwrap(), HttpVerb::Delete);
        let error = "PATCH".parse::<HttpVerb>().unwrap_err();
        assert_eq!(error.to_string(), "unsupported HTTP method PATCH");
    }
}
