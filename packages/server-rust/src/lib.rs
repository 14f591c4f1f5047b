//! FlashSale Server -- sale engine, generation rotation, HTTP API, and
//! durable storage.

pub mod engine;
pub mod network;
pub mod storage;

pub use engine::generation::{Generation, GenerationManager};
pub use engine::{EngineStats, SaleEngine};
pub use network::{NetworkConfig, NetworkModule, ShutdownController};
pub use storage::{BatchConfig, BatchingStore, MemoryStore, StoreBackend};


/// Integration tests for the full request pipeline.
///
/// Tests the end-to-end flow: HTTP request -> router -> generation gate ->
/// engine -> batching store -> response.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    use flashsale_core::{Clock, DurableStore, ManualClock, SaleConfig};

    use crate::engine::generation::GenerationManager;
    use crate::network::{NetworkConfig, NetworkModule};
    use crate::storage::{BatchConfig, BatchingStore, MemoryStore, StoreBackend};

    struct Harness {
        router: Router,
        manager: Arc<GenerationManager>,
        clock: Arc<ManualClock>,
    }

    async fn harness(items: usize, limit: u64) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let backend = Arc::new(MemoryStore::new());
        let store = BatchingStore::spawn(
            backend as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );
        let manager = GenerationManager::bootstrap(
            SaleConfig {
                items_per_window: items,
                per_user_limit: limit,
                ..SaleConfig::default()
            },
            store as Arc<dyn DurableStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .await
        .unwrap();

        let module = NetworkModule::new(NetworkConfig::default());
        module.shutdown_controller().set_ready();
        let router = module.build_router(Arc::clone(&manager));

        Harness { router, manager, clock }
    }

    async fn post(router: &Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn get(router: &Router, uri: &str) -> StatusCode {
        router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_then_purchase_over_http() {
        let h = harness(10, 2).await;

        let (status, body) = post(&h.router, "/reserve?user_id=1&item_id=0").await;
        assert_eq!(status, StatusCode::OK);
        let code = Uuid::parse_str(body.trim()).expect("body is a reservation code");

        let (status, body) = post(&h.router, &format!("/purchase?code={code}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let stats = h.manager.stats();
        assert_eq!(stats.sold_total, 1);
        assert_eq!(stats.counts.sold, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_queries_are_400() {
        let h = harness(10, 2).await;

        let (status, _) = post(&h.router, "/reserve?user_id=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&h.router, "/reserve?user_id=abc&item_id=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&h.router, "/purchase?code=not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_item_ids_are_400() {
        let h = harness(10, 2).await;

        let (status, _) = post(&h.router, "/reserve?user_id=1&item_id=-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&h.router, "/reserve?user_id=1&item_id=10").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn contended_item_is_409() {
        let h = harness(10, 2).await;

        let (status, _) = post(&h.router, "/reserve?user_id=1&item_id=5").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = post(&h.router, "/reserve?user_id=2&item_id=5").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("already reserved"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_code_is_409() {
        let h = harness(10, 2).await;

        let (status, body) =
            post(&h.router, &format!("/purchase?code={}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_reservation_purchase_is_409() {
        let h = harness(10, 2).await;

        let (_, body) = post(&h.router, "/reserve?user_id=3&item_id=7").await;
        let code = body.trim().to_string();

        h.clock.advance(3_001);

        let (status, body) = post(&h.router, &format!("/purchase?code={code}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn user_cap_is_409_and_final_counter_is_exact() {
        let h = harness(10, 2).await;

        for item in 0..2 {
            let (_, body) =
                post(&h.router, &format!("/reserve?user_id=9&item_id={item}")).await;
            let code = body.trim().to_string();
            let (status, _) = post(&h.router, &format!("/purchase?code={code}")).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, body) = post(&h.router, "/reserve?user_id=9&item_id=2").await;
        assert!(body.contains("purchase limit"));

        assert_eq!(h.manager.current().engine().user_purchases(9), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_generation_returns_503() {
        let h = harness(10, 2).await;

        h.manager
            .current()
            .drain(std::time::Duration::from_millis(10))
            .await;

        let (status, _) = post(&h.router, "/reserve?user_id=1&item_id=0").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn health_endpoints_respond() {
        let h = harness(10, 2).await;

        assert_eq!(get(&h.router, "/health").await, StatusCode::OK);
        assert_eq!(get(&h.router, "/health/live").await, StatusCode::OK);
        assert_eq!(get(&h.router, "/health/ready").await, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_preserves_service_through_http() {
        let h = harness(10, 2).await;

        let (_, body) = post(&h.router, "/reserve?user_id=1&item_id=0").await;
        let code = body.trim().to_string();
        let (status, _) = post(&h.router, &format!("/purchase?code={code}")).await;
        assert_eq!(status, StatusCode::OK);

        h.clock.set(3_600_000 + 1_000);
        h.manager.rotate().await.unwrap();

        // The new window serves immediately with fresh inventory.
        let (status, _) = post(&h.router, "/reserve?user_id=1&item_id=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.manager.stats().window_id, 1);
    }
}
