//! Route definitions for web server.

use axum::{
    routing::{get, post},
    Router,
};

use super::{api, AppState};

/// Create the API router.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        // Minds
        .route("/minds", get(api::list_minds))
        .route("/minds/:name/start", post(api::start_mind))
        .route("/minds/:name/stop", post(api::stop_mind))
        .route("/minds/:name/sleep", post(api::sleep_mind))
        .route("/minds/:name/wake", post(api::wake_mind))

        // Messages in, events reported by minds
        .route("/minds/:name/deliver", post(api::deliver))
        .route("/minds/:name/events", post(api::report_event))

        // Live streams
        .route("/events", get(api::stream_events))
        .route("/conversations/:id/events", get(api::conversation_events))
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSequencer, Snapshot, SnapshotSource};
    use crate::testing::TestFleet;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    struct EmptySnapshot;

    impl SnapshotSource for EmptySnapshot {
        fn snapshot(&self) -> Snapshot {
            Snapshot::default()
        }
    }

    fn app(fleet: &TestFleet) -> Router {
        create_app_router(AppState {
            coordinator: fleet.coordinator.clone(),
            hub: fleet.hub.clone(),
            sequencer: Arc::new(EventSequencer::starting_at(1)),
            snapshots: Arc::new(EmptySnapshot),
        })
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = TestFleet::new(dir.path(), &[]);
        let response = app(&fleet)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_deliver_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = TestFleet::new(dir.path(), &[("scout", 4100)]);
        let app = app(&fleet);

        let response = app
            .clone()
            .oneshot(Request::post("/api/minds/scout/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/minds/scout/deliver",
                serde_json::json!({"channel": "cli", "sender": "ada", "content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "delivered");
        assert_eq!(fleet.transport.texts(4100), vec!["hi"]);

        let response = app
            .oneshot(Request::get("/api/minds").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body[0]["name"], "scout");
        assert_eq!(body[0]["process"]["state"], "running");
        assert_eq!(body[0]["active"], true);
    }

    #[tokio::test]
    async fn test_errors_map_to_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = TestFleet::new(dir.path(), &[("scout", 4100)]);
        let app = app(&fleet);

        let response = app
            .clone()
            .oneshot(Request::post("/api/minds/ghost/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json(
                "/api/minds/scout/deliver",
                serde_json::json!({"sender": "ada", "content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains("missing channel"));
    }

    #[tokio::test]
    async fn test_mind_reports_turn_done() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = TestFleet::new(dir.path(), &[("scout", 4100)]);

        let response = app(&fleet)
            .oneshot(post_json(
                "/api/minds/scout/events",
                serde_json::json!({"type": "done", "conversation_id": "c1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_event_stream_starts_with_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = TestFleet::new(dir.path(), &[]);

        let response = app(&fleet)
            .oneshot(
                Request::get("/api/events?conversations=c1,c2")
                    .header("last-event-id", "41")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fleet.hub.conversation.topic_count(), 2);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: snapshot"), "{}", text);
        assert!(text.contains("id: 1"), "{}", text);
    }
}
