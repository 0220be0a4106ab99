//! Configuration files seeding the store at startup.

mod helpers;

use helpers::FakeBackend;
use mockgate_core::config::load_and_validate;
use mockgate_core::control::ControlPlane;
use mockgate_core::reload::Reloader;
use mockgate_core::schema::ReflectionResolver;
use mockgate_core::snapshot::SnapshotHandle;
use mockgate_core::store::{CaseStore, MemoryCaseStore};
use mockgate_core::upstream::{BackendPool, PoolSettings};
use std::io::Write;
use std::sync::Arc;

#[tokio::test]
async fn test_seeded_upstream_and_case_are_published() {
    let backend = FakeBackend::start().await;
    let yaml = format!(
        r#"
schema: 1
match:
  app_key: x-app
reload:
  interval_ms: 60000
upstreams:
  - name: demo
    endpoints: ["{}"]
cases:
  - app: app1
    method: /demo.Greeter/SayHello
    name: c1
    rule: "id == 7"
    body:
      message: seeded
"#,
        backend.endpoint()
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let (config, validation) = load_and_validate(file.path()).unwrap();
    assert!(validation.is_clean());
    assert_eq!(config.matching.keys.app_key, "x-app");

    let store = Arc::new(MemoryCaseStore::new());
    for upstream in &config.upstreams {
        store.add_upstream(upstream.clone()).await.unwrap();
    }
    for case in &config.cases {
        store.set_case(case.clone()).await.unwrap();
    }

    let snapshot = SnapshotHandle::default();
    let schema = Arc::new(ReflectionResolver::new(config.max_frame_bytes));
    let pool = BackendPool::new(&PoolSettings::default()).unwrap();
    let reloader = Arc::new(Reloader::new(
        store.clone(),
        schema.clone(),
        pool.clone(),
        snapshot.clone(),
        config.reload_settings(&Default::default()),
    ));
    let control = ControlPlane::new(store, schema, pool, reloader);

    let version = control.reload().await.unwrap();
    assert_eq!(snapshot.version(), version);

    let methods = control.list_methods();
    assert_eq!(
        methods["demo.Greeter"],
        vec![
            "/demo.Greeter/Refuse".to_string(),
            "/demo.Greeter/SayHello".to_string(),
            "/demo.Greeter/SlowHello".to_string(),
        ]
    );
    assert_eq!(snapshot.load().case_count(), 1);
    assert_eq!(control.list_upstreams().await.unwrap()[0].name, "demo");
}
