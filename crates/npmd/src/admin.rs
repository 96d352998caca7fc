//! Admin HTTP API.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/lbgroups` | Demand and supply of every group |
//! | GET | `/api/v1/lbgroups/{id}` | Demand and supply of one group |

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use nodepool_capacity::CapacityManager;
use nodepool_core::validate_group_id;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<CapacityManager>,
}

pub fn build_router(manager: Arc<CapacityManager>) -> Router {
    let state = AdminState { manager };

    let api_routes = Router::new()
        .route("/lbgroups", get(list_groups))
        .route("/lbgroups/{id}", get(get_group))
        .with_state(state);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", api_routes)
}

/// Serve the admin router until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "admin API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/v1/lbgroups
async fn list_groups(State(state): State<AdminState>) -> impl IntoResponse {
    ApiResponse::ok(state.manager.summaries().await)
}

/// GET /api/v1/lbgroups/{id}
async fn get_group(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(e) = validate_group_id(&id) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }
    match state.manager.summary(&id).await {
        Some(summary) => ApiResponse::ok(summary).into_response(),
        None => error_response("lb group not found", StatusCode::NOT_FOUND).into_response(),
    }
}
