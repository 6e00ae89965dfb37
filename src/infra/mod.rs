use std::sync::Arc;

use anyhow::Error;

use crate::{
    config::{PlatformKind, Settings},
    domain::Session,
};

pub mod bits;
pub mod cloud_controller;
pub mod http;
pub mod memory;

/// Build the session for the platform the settings point at.
pub fn session(settings: &Settings) -> Result<Session, Error> {
    let platform: Arc<dyn crate::domain::port::PlatformClient + Send + Sync> =
        match settings.platform.kind {
            PlatformKind::CloudController => Arc::new(
                cloud_controller::CloudControllerClient::new(&settings.platform)?,
            ),
            PlatformKind::Memory => Arc::new(memory::InMemoryPlatform::default()),
        };
    Ok(Session::new(
        platform,
        Arc::new(http::ReqwestProbe::default()),
        settings.target_domain.clone(),
        settings.timings.clone(),
        settings.services.clone(),
    ))
}
