//! # Discovery Agent Backend Tests
//!
//! The external backend is driven against a mock agent. Covered here:
//! - registration payload, including check settings and the bearer token
//! - duplicate detection, locally and against the agent catalog
//! - deregistration, of unknown ids and of ids cached by a previous discovery
//! - discovery parsing and the `passing=true` filter
//! - cache fallback while the agent is failing, and its TTL bound
//! - polling watches

use serde_json::{json, Value};
use service_registry::core::config::{
    AgentConfig, BackendConfig, BackendKind, ServiceConfig, SupervisorConfig,
};
use service_registry::core::types::ServiceDescriptor;
use service_registry::discovery::agent::ExternalAgentBackend;
use service_registry::discovery::backend::RegistryBackend;
use service_registry::registration::registrar::{Registrar, USER_SERVICE};
use service_registry::{RegistryConfig, RegistryError, ServiceRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn agent_config(server: &MockServer) -> AgentConfig {
    AgentConfig {
        address: server.uri().trim_start_matches("http://").to_string(),
        request_timeout: Duration::from_millis(500),
        ..AgentConfig::default()
    }
}

fn backend_for(config: AgentConfig) -> ExternalAgentBackend {
    ExternalAgentBackend::new(config, SupervisorConfig::default()).unwrap()
}

fn user_descriptor() -> ServiceDescriptor {
    Registrar::new(&ServiceConfig {
        hostname: "host1".to_string(),
        ..ServiceConfig::default()
    })
    .build(USER_SERVICE, 7530)
    .unwrap()
}

fn health_listing(ids: &[&str]) -> Value {
    Value::Array(
        ids.iter()
            .map(|id| {
                json!({
                    "Node": {"Node": "node-1"},
                    "Service": {
                        "ID": id,
                        "Service": "user-service",
                        "Address": "10.0.0.1",
                        "Port": 7530,
                        "Tags": ["service_type:microservice", "version:v1.0.0"],
                        "Meta": {"version": "v1.0.0", "type": "microservice", "environment": "development"}
                    },
                    "Checks": []
                })
            })
            .collect(),
    )
}

async fn mount_listing(server: &MockServer, ids: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_listing(ids)))
        .mount(server)
        .await;
}

async fn mount_failing_listing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
}

fn ids(descriptors: &[ServiceDescriptor]) -> Vec<String> {
    descriptors.iter().map(|d| d.id.clone()).collect()
}

async fn mount_empty_catalog(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_register_sends_descriptor_and_check() {
    let server = MockServer::start().await;
    mount_empty_catalog(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    backend.register(user_descriptor()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let put = requests
        .iter()
        .find(|r| r.url.path() == "/v1/agent/service/register")
        .expect("register request");
    let body: Value = put.body_json().unwrap();

    assert_eq!(body["id"], "user-service-host1-7530");
    assert_eq!(body["name"], "user-service");
    assert_eq!(body["port"], 7530);
    assert_eq!(body["meta"]["environment"], "development");
    assert_eq!(body["check"]["http"], "http://127.0.0.1:7530/health");
    assert_eq!(body["check"]["interval"], "10s");
    assert_eq!(body["check"]["timeout"], "3s");
    assert_eq!(body["check"]["deregister_after"], "30s");
}

#[tokio::test]
async fn test_register_rejects_invalid_descriptor_without_calling_agent() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    let mut descriptor = user_descriptor();
    descriptor.name = "Users".to_string();

    assert!(matches!(
        backend.register(descriptor).await,
        Err(RegistryError::InvalidDescriptor(_))
    ));
}

#[tokio::test]
async fn test_register_duplicate_known_to_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user-service-host1-7530": {
                "ID": "user-service-host1-7530",
                "Service": "user-service",
                "Address": "127.0.0.1",
                "Port": 7530
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    assert!(matches!(
        backend.register(user_descriptor()).await,
        Err(RegistryError::DuplicateId { .. })
    ));
}

#[tokio::test]
async fn test_register_duplicate_within_process() {
    let server = MockServer::start().await;
    mount_empty_catalog(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    backend.register(user_descriptor()).await.unwrap();
    assert!(matches!(
        backend.register(user_descriptor()).await,
        Err(RegistryError::DuplicateId { .. })
    ));
}

#[tokio::test]
async fn test_register_failure_releases_reservation() {
    let server = MockServer::start().await;
    mount_empty_catalog(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    assert!(matches!(
        backend.register(user_descriptor()).await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
    backend.register(user_descriptor()).await.unwrap();
}

#[tokio::test]
async fn test_token_is_sent_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .and(header("Authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(AgentConfig {
        token: Some("secret-token".to_string()),
        ..agent_config(&server)
    });
    assert!(backend.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deregister_unknown_id_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/user-service-ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    assert!(matches!(
        backend.deregister("user-service-ghost").await,
        Err(RegistryError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_discover_parses_passing_instances() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .and(query_param("passing", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(health_listing(&["user-service-b", "user-service-a"])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(agent_config(&server));
    let found = backend.discover("user-service").await.unwrap();

    let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["user-service-a", "user-service-b"]);
    assert_eq!(found[0].address, "10.0.0.1");
    assert_eq!(found[0].port, 7530);
    assert_eq!(found[0].tag_value("version"), Some("v1.0.0"));
    assert_eq!(found[0].metadata["type"], "microservice");
    assert_eq!(found[0].health_path, "/health");
}

#[tokio::test]
async fn test_discover_serves_cache_while_agent_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_listing(&["user-service-a"])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = backend_for(AgentConfig {
        cache_ttl: Duration::from_secs(30),
        ..agent_config(&server)
    });

    let first = backend.discover("user-service").await.unwrap();
    let second = backend.discover("user-service").await.unwrap();
    assert_eq!(first, second);

    let status = backend.cache_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].key, "service:user-service");
    assert_eq!(status[0].instances, 1);
    assert!(status[0].fresh);

    backend.clear_cache();
    assert!(matches!(
        backend.discover("user-service").await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_expired_cache_is_not_served() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(health_listing(&["user-service-a"])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let backend = backend_for(AgentConfig {
        cache_ttl: Duration::from_millis(50),
        ..agent_config(&server)
    });

    backend.discover("user-service").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(matches!(
        backend.discover("user-service").await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_slow_agent_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let backend = backend_for(AgentConfig {
        request_timeout: Duration::from_millis(100),
        ..agent_config(&server)
    });

    assert!(matches!(
        backend.list_all().await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_unreachable_agent_fails_selection_with_backend_error() {
    let config = RegistryConfig {
        backend: BackendConfig {
            kind: BackendKind::External,
            agent: AgentConfig {
                address: "127.0.0.1:1".to_string(),
                request_timeout: Duration::from_millis(200),
                ..AgentConfig::default()
            },
        },
        ..Default::default()
    };
    let registry = ServiceRegistry::from_config(&config).unwrap();

    assert!(matches!(
        registry.select_healthy("user-service").await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_deregister_drops_instance_from_later_discovery() {
    let server = MockServer::start().await;
    mount_empty_catalog(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_listing(&server, &["user-service-host1-7530", "user-service-host2-7530"]).await;

    let backend = backend_for(AgentConfig {
        cache_ttl: Duration::from_secs(30),
        ..agent_config(&server)
    });
    backend.register(user_descriptor()).await.unwrap();
    let before = backend.discover("user-service").await.unwrap();
    assert_eq!(
        ids(&before),
        vec!["user-service-host1-7530", "user-service-host2-7530"]
    );

    server.reset().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/user-service-host1-7530"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/user-service"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(health_listing(&["user-service-host2-7530"])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_failing_listing(&server).await;

    backend.deregister("user-service-host1-7530").await.unwrap();
    let after = backend.discover("user-service").await.unwrap();
    assert_eq!(ids(&after), vec!["user-service-host2-7530"]);

    // The agent now fails; the cached fallback must not resurrect the removed id.
    let fallback = backend.discover("user-service").await.unwrap();
    assert_eq!(ids(&fallback), vec!["user-service-host2-7530"]);
}

#[tokio::test]
async fn test_deregister_invalidates_cache_before_agent_failure() {
    let server = MockServer::start().await;
    mount_empty_catalog(&server).await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_listing(&server, &["user-service-host1-7530"]).await;

    let backend = backend_for(AgentConfig {
        cache_ttl: Duration::from_secs(30),
        ..agent_config(&server)
    });
    backend.register(user_descriptor()).await.unwrap();
    assert_eq!(backend.discover("user-service").await.unwrap().len(), 1);

    server.reset().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/user-service-host1-7530"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_failing_listing(&server).await;

    backend.deregister("user-service-host1-7530").await.unwrap();
    assert!(backend.cache_status().is_empty());
    assert!(matches!(
        backend.discover("user-service").await,
        Err(RegistryError::BackendUnavailable { .. })
    ));
}

/// Poll `check` every 20ms until it holds or `within` elapses
async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_watch_polls_agent_for_membership_changes() {
    let server = MockServer::start().await;
    mount_listing(&server, &["user-service-a"]).await;

    let backend = backend_for(AgentConfig {
        watch_interval: Duration::from_millis(50),
        cache_ttl: Duration::ZERO,
        ..agent_config(&server)
    });

    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = backend
        .watch(
            "user-service",
            Arc::new(move |descriptors: Vec<ServiceDescriptor>| {
                sink.lock().push(ids(&descriptors))
            }),
        )
        .await
        .unwrap();

    // Initial membership is delivered before watch returns.
    assert_eq!(*seen.lock(), vec![vec!["user-service-a".to_string()]]);

    // Unchanged polls stay silent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.lock().len(), 1);

    // Failing polls are logged and the subscription survives them.
    server.reset().await;
    mount_failing_listing(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.lock().len(), 1);
    assert!(!handle.is_cancelled());

    server.reset().await;
    mount_listing(&server, &["user-service-a", "user-service-b"]).await;
    let changed = eventually(Duration::from_secs(2), || seen.lock().len() == 2).await;
    assert!(changed, "membership change was not delivered");
    assert_eq!(
        seen.lock()[1],
        vec!["user-service-a".to_string(), "user-service-b".to_string()]
    );

    drop(handle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.reset().await;
    mount_listing(&server, &["user-service-c"]).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(seen.lock().len(), 2);
}
