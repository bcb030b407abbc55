pub mod error;
pub mod monitoring;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::services::ServeDir;

use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    let assets = ServeDir::new(format!("{}/assets", state.config.static_path));
    let js = ServeDir::new(format!("{}/js", state.config.static_path));

    Router::new()
        .route("/monitoring", post(monitoring::monitoring))
        .route("/api/v1/server-config", get(monitoring::server_config))
        .route("/healthz", get(monitoring::healthz))
        .nest_service("/assets", assets)
        .nest_service("/js", js)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::config::{AppConfig, HttpLimits, StorageMode, Thresholds};
    use crate::storage::{SqliteStore, Storage, StorageSet, StoredEntry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> AppConfig {
        AppConfig {
            port: 0,
            storage: StorageMode::Db,
            log_path: "./logs".into(),
            database_url: "sqlite::memory:".into(),
            retention_days: 0,
            refresh_interval_seconds: 5,
            downsample_max_points: 500,
            default_table: "monitoring".into(),
            http: HttpLimits::default(),
            time_policy: crate::clock::TimePolicy::default(),
            static_path: "./static".into(),
            servers: vec![crate::config::ServerEntry {
                name: "edge-1".into(),
                address: "http://10.0.0.5:3500".into(),
                table_name: None,
                tags: None,
            }],
            heartbeats: vec![],
            thresholds: Thresholds::default(),
        }
    }

    async fn test_app(entries: usize) -> Router {
        let store = SqliteStore::test_db().await;
        store.ensure_table("monitoring").await.unwrap();
        for i in 0..entries {
            store
                .write(
                    "monitoring",
                    &StoredEntry {
                        timestamp: clock::parse(&format!(
                            "2025-03-01T{:02}:{:02}:00Z",
                            i / 60,
                            i % 60
                        ))
                        .unwrap(),
                        data: serde_json::json!({"n": i}),
                    },
                )
                .await
                .unwrap();
        }

        let state = Arc::new(AppState {
            config: test_config(),
            storages: Arc::new(StorageSet::from_backends(vec![Storage::Sqlite(store)])),
            latest: crate::collector::LatestSample::default(),
        });
        routes(state)
    }

    async fn post_monitoring(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::post("/monitoring")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    // -----------------------------------------------------------------------
    // POST /monitoring
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_range_returns_200_and_empty_array() {
        let app = test_app(0).await;
        let (status, body) = post_monitoring(
            app,
            r#"{"from":"2025-01-01T00:00:00Z","to":"2025-01-01T00:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn historical_rows_come_newest_first() {
        let app = test_app(3).await;
        let (status, body) = post_monitoring(
            app,
            r#"{"from":"2025-03-01T00:00:00Z","to":"2025-03-01T23:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["n"], 2);
    }

    #[tokio::test]
    async fn invalid_timestamp_is_400() {
        let app = test_app(0).await;
        let (status, body) = post_monitoring(app, r#"{"from":"not-a-date"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn inverted_range_is_400() {
        let app = test_app(0).await;
        let (status, _) = post_monitoring(
            app,
            r#"{"from":"2025-03-02T00:00:00Z","to":"2025-03-01T00:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_table_is_200_empty() {
        let app = test_app(3).await;
        let (status, body) = post_monitoring(
            app,
            r#"{"table_name":"server_ghost_80","from":"2025-03-01T00:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn empty_filter_returns_live_record() {
        let app = test_app(0).await;
        let (status, body) = post_monitoring(app, "{}").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["cpu"]["usage_percent"].is_number());
    }

    #[tokio::test]
    async fn missing_body_acts_as_live_request() {
        let app = test_app(0).await;
        let response = app
            .oneshot(
                Request::post("/monitoring")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -----------------------------------------------------------------------
    // GET /api/v1/server-config
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn server_config_projection() {
        let app = test_app(0).await;
        let response = app
            .oneshot(
                Request::get("/api/v1/server-config")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["refresh_interval_seconds"], 5);
        assert_eq!(body["servers"][0]["name"], "edge-1");
        assert!(body["thresholds"]["cpu"]["warning"].is_number());
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = test_app(0).await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
