use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::activation::ActivationHandle;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::pipeline::SharedBlockStore;

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub block_store: SharedBlockStore,
    pub activation: ActivationHandle,
    pub reload: mpsc::Sender<()>,
    pub metrics: Arc<Metrics>,
    pub sources_store: String,
}

/// Admin router: block store inspection and edits, activation control, the
/// reload trigger, and the metrics scrape when enabled.
pub fn router(config: &Config, ctx: ApiContext) -> Router {
    let mut router = Router::new()
        .route("/blockcache", get(blockcache_summary))
        .route("/blockcache/length", get(blockcache_length))
        .route("/blockcache/exists/{key}", get(blockcache_exists))
        .route("/blockcache/get/{key}", get(blockcache_get))
        .route("/blockcache/set/{key}", get(blockcache_set))
        .route("/blockcache/remove/{key}", get(blockcache_remove))
        .route(
            "/application/active",
            get(application_active).put(application_set_active),
        )
        .route("/blocklist/update", post(blocklist_update));

    if config.metrics.enabled {
        router = router.route(&config.metrics.path, get(metrics_scrape));
    }

    router
        .layer(Extension(ctx))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
}

/// Serve the admin API until shutdown fires. Bind failures are fatal at
/// startup and surface to the caller.
pub async fn run(
    config: &Config,
    ctx: ApiContext,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let app = router(config, ctx);
    let listener = TcpListener::bind(&config.api).await?;
    info!("api server listening on {}", config.api);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("api server shutting down");
        })
        .await
}

async fn blockcache_summary(Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    Json(json!({
        "length": store.len(),
        "special": store.special_keys(),
    }))
}

async fn blockcache_length(Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    Json(json!({ "length": store.len() }))
}

async fn blockcache_exists(
    Path(key): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    Json(json!({ "exists": store.exists(&key) }))
}

async fn blockcache_get(
    Path(key): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    match store.get(&key) {
        Some(value) => Json(json!({ "success": value })),
        None => Json(json!({ "error": format!("{} not found", key) })),
    }
}

/// Add a name to the live store and persist it to `personal.list` so the
/// next import keeps it.
async fn blockcache_set(
    Path(key): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    store.set(&key);

    let personal = PathBuf::from(&ctx.sources_store).join("personal.list");
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&personal)
        .and_then(|mut file| writeln!(file, "{}", key));
    if let Err(err) = appended {
        error!("failed to persist {} to personal list: {}", key, err);
    }

    Json(json!({ "success": true }))
}

/// Remove from the live store only. A name already resolved into the
/// response cache stays there until it expires.
async fn blockcache_remove(
    Path(key): Path<String>,
    Extension(ctx): Extension<ApiContext>,
) -> impl IntoResponse {
    let store = { ctx.block_store.read().clone() };
    store.remove(&key);
    Json(json!({ "success": true }))
}

async fn application_active(Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    Json(json!({ "active": ctx.activation.query().await }))
}

#[derive(Debug, serde::Deserialize)]
struct ActiveParams {
    state: String,
    /// Seconds until blocking re-activates after being switched off.
    timeout: Option<u64>,
}

async fn application_set_active(
    Query(params): Query<ActiveParams>,
    Extension(ctx): Extension<ApiContext>,
) -> impl IntoResponse {
    let active = match params.state.as_str() {
        "on" => ctx.activation.set(true).await,
        "off" => ctx.activation.toggle_off(params.timeout.unwrap_or(0)).await,
        "toggle" => ctx.activation.toggle(params.timeout.unwrap_or(0)).await,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "state must be on, off or toggle" })),
            );
        }
    };
    (StatusCode::OK, Json(json!({ "active": active })))
}

/// Kick off a deny-list rebuild without holding the request open.
async fn blocklist_update(Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    let reload = ctx.reload.clone();
    tokio::spawn(async move {
        let _ = reload.send(()).await;
    });
    StatusCode::OK
}

async fn metrics_scrape(Extension(ctx): Extension<ApiContext>) -> impl IntoResponse {
    ctx.metrics.render()
}
