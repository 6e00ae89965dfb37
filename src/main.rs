use std::{error::Error, sync::Arc, time::Duration};

use clowntest::{config::load_config, domain::Application, infra};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("Start clowntest - acceptance runs against your application platform");

    let settings = load_config()?;
    info!(
        "Loaded config for {:?} platform at {}, {} applications",
        settings.platform.kind,
        settings.platform.api_url,
        settings.apps.len()
    );
    let session = Arc::new(infra::session(&settings)?);

    let mut failures = 0;
    for id in settings.apps.keys() {
        let mut app = Application::from_manifest(session.clone(), &settings.apps, id)?;
        match smoke(&mut app, settings.keep_apps).await {
            Ok(()) => info!("Application {} passed", id),
            Err(e) => {
                error!("Application {} failed: {:?}", id, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(format!("{} of {} applications failed", failures, settings.apps.len()).into());
    }
    Ok(())
}

async fn smoke(app: &mut Application, keep: bool) -> Result<(), anyhow::Error> {
    app.provision_services().await?;
    app.push().await?;
    if !app.manifest().no_start && !app.manifest().no_url {
        let response = app.get("/", Duration::from_secs(30)).await?;
        info!(
            "GET {} answered {} ({} bytes)",
            app.url(),
            response.code,
            response.body.len()
        );
    }
    if !keep {
        app.delete().await?;
    }
    Ok(())
}
