//! Health and last-run endpoints for the sync service.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{info, warn};
use trailsync_sync::{LastRunRecorder, RunGuard};

pub const CRATE_NAME: &str = "trailsync-web";
pub const DEFAULT_PORT: u16 = 3003;

#[derive(Clone, Default)]
pub struct AppState {
    pub pool: Option<PgPool>,
    pub last_run: LastRunRecorder,
    pub guard: RunGuard,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, last_run: LastRunRecorder, guard: RunGuard) -> Self {
        Self { pool, last_run, guard }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum DatabaseStatus {
    Up,
    Down,
    NotConfigured,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    database: DatabaseStatus,
    run_in_progress: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/runs/last", get(last_run_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = match &state.pool {
        None => DatabaseStatus::NotConfigured,
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => DatabaseStatus::Up,
            Err(err) => {
                warn!(error = %err, "database probe failed");
                DatabaseStatus::Down
            }
        },
    };
    let (code, status) = if database == DatabaseStatus::Down {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };
    let body = HealthBody {
        status,
        database,
        run_in_progress: state.guard.is_running(),
    };
    (code, Json(body)).into_response()
}

async fn last_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_run.snapshot() {
        Some(last) => Json(last).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no run recorded yet" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use trailsync_sync::{RunEvent, RunFailure, RunObserver};

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let (status, body) = get_json(app(AppState::default()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn health_without_database_reports_not_configured() {
        let guard = RunGuard::new();
        let _token = guard.try_acquire().unwrap();
        let state = AppState::new(None, LastRunRecorder::new(), guard.clone());

        let (status, body) = get_json(app(state), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "not_configured");
        assert_eq!(body["run_in_progress"], true);
    }

    #[tokio::test]
    async fn last_run_is_404_until_a_run_finishes() {
        let recorder = LastRunRecorder::new();
        let app = app(AppState::new(None, recorder.clone(), RunGuard::new()));

        let (status, _) = get_json(app.clone(), "/runs/last").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        recorder.on_event(&RunEvent::Failed(RunFailure {
            run_id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            failed_at: chrono::Utc::now(),
            error: "board inventory query failed".into(),
        }));

        let (status, body) = get_json(app, "/runs/last").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "board inventory query failed");
    }
}
