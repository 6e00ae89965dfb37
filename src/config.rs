use anyhow::{Context, Error};
use config::{builder::DefaultState, Config, ConfigBuilder};

use crate::domain::model::{Manifest, Timings};

#[derive(Debug, Clone, Copy, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    CloudController,
    Memory,
}

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformSettings {
    pub kind: PlatformKind,
    pub api_url: String,
    pub token: Option<String>,
    pub space_guid: String,
    pub request_timeout_secs: u64,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            kind: PlatformKind::CloudController,
            api_url: "http://api.clowntest.local".to_string(),
            token: None,
            space_guid: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub platform: PlatformSettings,
    pub target_domain: String,
    /// Service instances the session may bind without provisioning them.
    pub services: Vec<String>,
    pub timings: Timings,
    pub apps: Manifest,
    pub keep_apps: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            platform: PlatformSettings::default(),
            target_domain: "clowntest.local".to_string(),
            services: vec![],
            timings: Timings::default(),
            apps: Manifest::new(),
            keep_apps: false,
        }
    }
}

/// Load settings from `clowntest.{yaml,toml,json}` (or the file named by
/// `CLOWNTEST_CONFIG`), overridden by `CLOWNTEST_*` environment variables.
pub fn load_config() -> Result<Settings, Error> {
    let file = std::env::var("CLOWNTEST_CONFIG").unwrap_or_else(|_| "clowntest".to_string());
    let builder = Config::builder()
        .add_source(config::File::with_name(&file).required(false))
        .add_source(
            config::Environment::with_prefix("clowntest")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("services")
                .try_parsing(true),
        );
    build(builder)
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<Settings, Error> {
    builder
        .build()
        .context("Can't load configuration")?
        .try_deserialize()
        .context("Can't deserialize Settings from loaded configuration")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use config::FileFormat;

    use super::*;

    fn from_yaml(yaml: &str) -> Result<Settings, Error> {
        build(Config::builder().add_source(config::File::from_str(yaml, FileFormat::Yaml)))
    }

    #[test]
    fn empty_configuration_uses_defaults() {
        assert_eq!(from_yaml("").unwrap(), Settings::default());
    }

    #[test]
    fn manifest_entries_fill_missing_fields() {
        let settings = from_yaml(
            r#"
platform:
  kind: memory
target_domain: apps.example.com
services: [redis]
timings:
  grace_period_secs: 2
apps:
  dora:
    path: assets/dora
    instances: 2
    env:
      mode: test
    no_url: true
"#,
        )
        .unwrap();
        assert_eq!(settings.platform.kind, PlatformKind::Memory);
        assert_eq!(settings.target_domain, "apps.example.com");
        assert_eq!(settings.services, vec!["redis".to_string()]);
        assert_eq!(settings.timings.grace_period_secs, 2);
        assert_eq!(settings.timings.poll_interval_secs, 1);
        let dora = &settings.apps["dora"];
        assert_eq!(dora.path, Some(PathBuf::from("assets/dora")));
        assert_eq!(dora.instances, 2);
        assert_eq!(dora.memory, 256);
        assert_eq!(dora.timeout_secs, 120);
        assert_eq!(dora.env["mode"], "test");
        assert!(dora.no_url);
        assert!(!dora.no_start);
    }

    #[test]
    fn unknown_platform_kind_is_rejected() {
        let error = from_yaml("platform:\n  kind: docker\n").unwrap_err();
        assert!(error.to_string().contains("deserialize"));
    }
}
