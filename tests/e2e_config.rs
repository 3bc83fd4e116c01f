//! End-to-end tests for building an orchestrator from `hub.toml`.
//!
//! Tests touching `EDGEQUAKE_HUB_CONFIG` run under `#[serial]`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use edgequake_hub::config::CONFIG_ENV;
use edgequake_hub::providers::MockBackend;
use edgequake_hub::{
    CompletionRequest, HubConfig, HubError, OrchestratorBuilder, RegisterOptions,
    SelectionStrategy,
};
use serial_test::serial;

const HUB_TOML: &str = r#"
[orchestrator]
strategy = "round_robin"
enable_fallback = true
max_fallback_attempts = 2
call_timeout_ms = 5000

[cache]
enabled = true
max_size = 50
ttl_ms = 60000

[cache_key]
prefix = "test"

[circuit_breaker]
failure_threshold = 2
reset_timeout_ms = 1000
"#;

fn answered_by(content: &str) -> &str {
    content.trim_start_matches("response from ")
}

#[tokio::test]
async fn test_orchestrator_from_toml() {
    let config = HubConfig::from_toml(HUB_TOML).unwrap();
    let (a, b) = (Arc::new(MockBackend::new("a")), Arc::new(MockBackend::new("b")));
    let hub = OrchestratorBuilder::from_config(&config)
        .add_backend(a.clone(), RegisterOptions::default())
        .add_backend(b.clone(), RegisterOptions::default())
        .build()
        .await
        .unwrap();

    assert_eq!(hub.strategy(), SelectionStrategy::RoundRobin);
    assert_eq!(hub.config().call_timeout, Some(Duration::from_secs(5)));

    let first = hub.complete(CompletionRequest::from_prompt("one")).await.unwrap();
    let second = hub.complete(CompletionRequest::from_prompt("two")).await.unwrap();
    assert_eq!(answered_by(&first.content), "a");
    assert_eq!(answered_by(&second.content), "b");

    // cached, so the rotation does not advance
    hub.complete(CompletionRequest::from_prompt("one")).await.unwrap();
    assert_eq!(a.call_count() + b.call_count(), 2);
    assert_eq!(hub.cache_stats().await.unwrap().unwrap().hits, 1);
}

#[tokio::test]
async fn test_fallback_budget_from_toml() {
    let config = HubConfig::from_toml(HUB_TOML).unwrap();
    let backends: Vec<Arc<MockBackend>> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let backend = Arc::new(MockBackend::new(name));
            backend.fail_always("down");
            backend
        })
        .collect();
    let mut builder = OrchestratorBuilder::from_config(&config);
    for backend in &backends {
        builder = builder.add_backend(backend.clone(), RegisterOptions::default());
    }
    let hub = builder.build().await.unwrap();

    let err = hub
        .complete(CompletionRequest::from_prompt("hi"))
        .await
        .unwrap_err();
    match err {
        HubError::AggregateFailure { errors } => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate failure, got {other:?}"),
    }
    let total: u64 = backends.iter().map(|b| b.call_count()).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_disabled_cache_section() {
    let config = HubConfig::from_toml("[cache]\nenabled = false\n").unwrap();
    let svc = Arc::new(MockBackend::new("svc"));
    let hub = OrchestratorBuilder::from_config(&config)
        .add_backend(svc.clone(), RegisterOptions::default())
        .build()
        .await
        .unwrap();

    let request = CompletionRequest::from_prompt("hi");
    hub.complete(request.clone()).await.unwrap();
    hub.complete(request).await.unwrap();

    assert_eq!(svc.call_count(), 2);
    assert!(hub.cache_stats().await.unwrap().is_none());
}

#[test]
fn test_invalid_documents_are_rejected() {
    for doc in [
        "[orchestrator]\nstrategy = \"fastest\"\n",
        "[orchestrator]\nmax_fallback_attempts = 0\n",
        "[circuit_breaker]\nfailure_threshold = 0\n",
        "[cache_key]\nprefix = \"\"\n",
        "not toml at all =",
    ] {
        let err = HubConfig::from_toml(doc).unwrap_err();
        assert!(matches!(err, HubError::Config(_)), "{doc}: {err}");
    }
}

#[tokio::test]
#[serial]
async fn test_load_from_env_and_build() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(HUB_TOML.as_bytes()).unwrap();
    std::env::set_var(CONFIG_ENV, file.path());

    let loaded = HubConfig::load();
    std::env::remove_var(CONFIG_ENV);
    let config = loaded.unwrap();

    assert_eq!(config.cache_key.prefix, "test");
    let hub = OrchestratorBuilder::from_config(&config)
        .add_backend(Arc::new(MockBackend::new("svc")), RegisterOptions::default())
        .build()
        .await
        .unwrap();
    assert!(hub.complete(CompletionRequest::from_prompt("hi")).await.is_ok());
}

#[test]
#[serial]
fn test_saved_config_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.toml");

    let mut config = HubConfig::default();
    config.orchestrator.strategy = SelectionStrategy::CostOptimized;
    config.health.auto_disable = true;
    config.save(&path).unwrap();

    let reloaded = HubConfig::from_file(&path).unwrap();
    assert_eq!(reloaded.orchestrator.strategy, SelectionStrategy::CostOptimized);
    assert!(reloaded.health.auto_disable);
}
