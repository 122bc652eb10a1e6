//! Switchboard Core Integration Tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchboard_core::{
    Error, ErrorCode,
    classify::BackendError,
    clock::ManualClock,
    config::{Config, StoreBackend, StoreConfig},
    observability::{
        BANDIT_INIT, BANDIT_REWARD, EventRecorder, FALLBACK_ATTEMPT, FALLBACK_FAILED,
        FALLBACK_SUCCEEDED,
    },
    routing::{
        BackendDescriptor, BanditStore, EXHAUSTED_MESSAGE, InMemoryKeyValue, KeyValueBanditStore,
        KeyValueClient, RouteRequest, RoutingCoordinator, SqliteBanditStore, open_store,
    },
};
use tempfile::TempDir;

fn answering(id: &str) -> BackendDescriptor {
    let name = id.to_string();
    BackendDescriptor::new(id)
        .with_latency_ms(100.0)
        .with_fn(move |args| {
            let name = name.clone();
            async move { Ok(json!({ "backend": name, "args": args })) }
        })
}

fn broken(id: &str, err: BackendError) -> BackendDescriptor {
    BackendDescriptor::new(id)
        .with_latency_ms(100.0)
        .with_fn(move |_| {
            let err = err.clone();
            async move { Err::<serde_json::Value, _>(err) }
        })
}

#[tokio::test]
async fn test_route_event_sequence() {
    let router = RoutingCoordinator::builder().seed(11).build();
    let events = EventRecorder::attach(router.bus());

    router
        .route(RouteRequest::new(vec![answering("a")], json!({ "prompt": "hi" })))
        .await
        .unwrap();

    assert_eq!(
        events.names(),
        vec![BANDIT_INIT, FALLBACK_ATTEMPT, FALLBACK_SUCCEEDED, BANDIT_REWARD]
    );
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_break_routing() {
    let router = RoutingCoordinator::builder().seed(12).build();
    let _sub = router
        .bus()
        .subscribe(FALLBACK_ATTEMPT, |_| panic!("subscriber bug"));
    let events = EventRecorder::attach(router.bus());

    let outcome = router
        .route(RouteRequest::new(vec![answering("a")], json!({})))
        .await
        .unwrap();

    assert_eq!(outcome.backend_used, "a");
    assert_eq!(events.count(FALLBACK_SUCCEEDED), 1);
}

#[tokio::test]
async fn test_falls_back_to_next_backend() {
    let mut config = Config::default();
    config.health.auto_disable = false;
    let router = RoutingCoordinator::builder().config(config).seed(13).build();
    router.sticky().record_success("dave", "down");

    let outcome = router
        .route(
            RouteRequest::new(
                vec![
                    broken("down", BackendError::status(503, "service down")),
                    answering("up"),
                ],
                json!({ "userId": "dave" }),
            )
            .with_debug(true),
        )
        .await
        .unwrap();

    assert_eq!(outcome.backend_used, "up");
    assert_eq!(outcome.attempt, 2);
    let debug = outcome.debug.unwrap();
    assert_eq!(debug.failures.len(), 1);
    assert_eq!(debug.failures[0].code, ErrorCode::ProviderUnavailable);

    // The failed pin decays, then the success moves the pin to the new backend
    assert_eq!(router.sticky().entry("dave").unwrap().backend_id, "up");
}

#[tokio::test]
async fn test_exhaustion_surfaces_canonical_error() {
    let router = RoutingCoordinator::builder().seed(14).build();
    let events = EventRecorder::attach(router.bus());

    let err = router
        .route(RouteRequest::new(
            vec![broken("only", BackendError::message("Request timeout exceeded"))],
            json!({ "requestId": "req-42" }),
        ))
        .await
        .unwrap_err();

    let Error::Pipeline(canonical) = err else {
        panic!("expected a pipeline error");
    };
    assert_eq!(canonical.code, ErrorCode::Timeout);
    assert_eq!(canonical.message, EXHAUSTED_MESSAGE);
    assert_eq!(canonical.meta["requestId"], "req-42");
    assert_eq!(canonical.meta["cause"], "Request timeout exceeded");
    assert_eq!(events.count(FALLBACK_FAILED), 1);
    assert_eq!(events.count(BANDIT_REWARD), 0);
}

#[tokio::test]
async fn test_cooldown_returns_backend_to_rotation() {
    let clock = Arc::new(ManualClock::starting_now());
    let router = RoutingCoordinator::builder()
        .clock(clock.clone())
        .seed(15)
        .build();
    let limited = || broken("limited", BackendError::status(429, "too many requests"));

    let first = router
        .route(RouteRequest::new(vec![limited()], json!({})))
        .await
        .unwrap_err();
    assert_eq!(first.canonical_code(), Some(ErrorCode::QuotaExceeded));

    let second = router
        .route(RouteRequest::new(vec![limited()], json!({})))
        .await
        .unwrap_err();
    assert!(matches!(second, Error::AllProvidersDisabled));

    clock.advance(Duration::from_secs(60));
    let third = router
        .route(RouteRequest::new(vec![limited()], json!({})))
        .await
        .unwrap_err();
    assert!(matches!(third, Error::Pipeline(_)));
}

#[tokio::test]
async fn test_default_sticky_key_holds_the_winner() {
    let mut config = Config::default();
    config.health.auto_disable = false;
    let router = RoutingCoordinator::builder().config(config).seed(16).build();
    let backends = || {
        vec![
            broken("flaky", BackendError::message("generation failed")),
            answering("steady"),
        ]
    };

    for _ in 0..20 {
        let outcome = router
            .route(RouteRequest::new(backends(), json!({})))
            .await
            .unwrap();
        assert_eq!(outcome.backend_used, "steady");
    }

    let snapshot = router.bandit_snapshot().await;
    assert_eq!(snapshot["default:steady"].trials, 20);
    assert_eq!(snapshot["default:flaky"].trials, 0);
}

#[tokio::test]
async fn test_bandit_learns_to_avoid_failing_backend() {
    let mut config = Config::default();
    config.health.auto_disable = false;
    config.routing.record_failures = true;
    let router = RoutingCoordinator::builder().config(config).seed(17).build();

    let mut first_try_wins = 0;
    for i in 0..200 {
        let outcome = router
            .route(RouteRequest::new(
                vec![
                    broken("flaky", BackendError::message("generation failed")),
                    answering("steady"),
                ],
                json!({ "userId": format!("user-{i}") }),
            ))
            .await
            .unwrap();
        if i >= 150 && outcome.attempt == 1 {
            first_try_wins += 1;
        }
    }

    let snapshot = router.bandit_snapshot().await;
    let steady = &snapshot["default:steady"];
    let flaky = &snapshot["default:flaky"];
    assert!(steady.alpha / (steady.alpha + steady.beta) > 0.7);
    // Zero rewards only ever grow beta
    assert_eq!(flaky.alpha, 1.0);
    assert!(flaky.alpha / (flaky.alpha + flaky.beta) < steady.alpha / (steady.alpha + steady.beta));
    assert!(first_try_wins > 40, "steady ranked first {first_try_wins} of 50");
}

#[tokio::test]
async fn test_sqlite_write_through_and_hydrate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bandit.db");
    let sqlite = SqliteBanditStore::connect(&path).await.unwrap();
    sqlite.init().await.unwrap();
    let store: Arc<dyn BanditStore> = Arc::new(sqlite);

    let router = RoutingCoordinator::builder()
        .store(store.clone())
        .seed(18)
        .build();
    router
        .route(RouteRequest::new(vec![answering("a")], json!({})).with_context("chat"))
        .await
        .unwrap();

    router.flush().await;
    let saved = store.load("a", "chat").await.unwrap().unwrap();
    assert_eq!(saved.trials, 1);

    let restarted = RoutingCoordinator::builder().store(store).build();
    assert_eq!(restarted.hydrate_from_store().await.unwrap(), 1);
    let snapshot = restarted.bandit_snapshot().await;
    assert_eq!(snapshot["chat:a"].trials, 1);
    assert_eq!(snapshot, router.bandit_snapshot().await);
}

#[tokio::test]
async fn test_key_value_store_persist() {
    let store = Arc::new(KeyValueBanditStore::new(InMemoryKeyValue::new()));
    let router = RoutingCoordinator::builder()
        .store(store.clone())
        .seed(19)
        .build();

    router
        .route(RouteRequest::new(vec![answering("a"), answering("b")], json!({})))
        .await
        .unwrap();
    assert_eq!(router.persist().await.unwrap(), 2);

    let raw = store.client().get("bandit:default:a").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(value.get("rewardSum").is_some());
    assert_eq!(store.load_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_open_store_from_config() {
    let memory = StoreConfig::default().open().await.unwrap();
    assert!(memory.load_all().await.unwrap().is_empty());

    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        backend: StoreBackend::Sqlite,
        sqlite_path: Some(dir.path().join("nested").join("arms.db")),
        ..StoreConfig::default()
    };
    let sqlite = open_store(&config).await.unwrap();
    assert!(sqlite.load("a", "default").await.unwrap().is_none());

    let missing = StoreConfig {
        backend: StoreBackend::Sqlite,
        ..StoreConfig::default()
    };
    assert!(matches!(open_store(&missing).await, Err(Error::ConfigError(_))));
}
