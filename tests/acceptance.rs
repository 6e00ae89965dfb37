use std::sync::Arc;

use clowntest::{
    config::{PlatformKind, Settings},
    domain::{
        error::PlatformError,
        model::{AppManifest, AppState, InstanceState, Timings},
        Application, Session,
    },
    infra::{self, http::ReqwestProbe, memory::InMemoryPlatform},
};

fn memory_session(platform: &Arc<InMemoryPlatform>, timings: Timings) -> Arc<Session> {
    Arc::new(Session::new(
        platform.clone(),
        Arc::new(ReqwestProbe::default()),
        "apps.example.com",
        timings,
        ["postgres".to_string()],
    ))
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_on_memory_platform() {
    let mut settings = Settings {
        target_domain: "apps.example.com".into(),
        services: vec!["postgres".into()],
        ..Default::default()
    };
    settings.platform.kind = PlatformKind::Memory;
    settings.apps.insert(
        "worker_app".into(),
        AppManifest {
            instances: 2,
            uris: vec!["worker.apps.example.com".into()],
            ..Default::default()
        },
    );
    let session = Arc::new(infra::session(&settings).unwrap());
    session.provision_service("postgres", None).await.unwrap();

    let mut app = Application::from_manifest(session, &settings.apps, "worker_app").unwrap();
    assert!(!app.exists().await.unwrap());
    app.push().await.unwrap();
    assert_eq!(app.remote().unwrap().state, AppState::Started);
    assert_eq!(app.urls().await.unwrap(), vec!["worker.apps.example.com"]);

    app.map("extra.apps.example.com").await.unwrap();
    let mut urls = app.urls().await.unwrap();
    urls.sort();
    assert_eq!(urls, vec!["extra.apps.example.com", "worker.apps.example.com"]);

    app.bind("postgres", true).await.unwrap();
    app.scale(4, None).await.unwrap();
    assert_eq!(app.total_instances().await.unwrap(), 4);

    app.delete().await.unwrap();
    assert!(!app.exists().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn push_fails_when_application_never_settles() {
    let platform = Arc::new(InMemoryPlatform::default());
    let session = memory_session(&platform, Timings::default());
    let mut app = Application::new(
        session,
        "flappy",
        AppManifest {
            timeout_secs: 20,
            ..Default::default()
        },
    );
    for _ in 0..50 {
        platform.push_instance_sample(Ok(vec![InstanceState::Starting]));
    }
    let error = app.push().await.unwrap_err();
    assert!(matches!(
        PlatformError::of(&error),
        Some(PlatformError::ReadinessTimeout { name, .. }) if name == "flappy"
    ));
    assert!(app.exists().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn start_rides_out_staging_and_gateway_hiccups() {
    let platform = Arc::new(InMemoryPlatform::default());
    let session = memory_session(&platform, Timings::default());
    let mut app = Application::new(
        session,
        "patient",
        AppManifest {
            no_start: true,
            ..Default::default()
        },
    );
    app.push().await.unwrap();
    for _ in 0..3 {
        platform.push_start_failure(PlatformError::Timeout("504".into()));
    }
    for _ in 0..3 {
        platform.push_instance_sample(Err(PlatformError::StagingPending("staging".into())));
    }
    platform.push_instance_sample(Err(PlatformError::Timeout("instances".into())));
    app.start(true).await.unwrap();
    assert_eq!(platform.calls("set_state"), 4);
    assert!(app.healthy().await.unwrap());
}
