mod app_state;
mod auth;
mod error;
mod handlers;

use std::path::PathBuf;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use app_state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter("orchestrator=debug,server=debug,tower_http=debug")
        .init();

    dotenvy::dotenv().ok();

    let scratch_root = std::env::var("ORCHESTRATOR_SCRATCH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("orchestrator-scratch"));
    let host_dirs_root = std::env::var("ORCHESTRATOR_HOST_DIRS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("orchestrator-host-dirs"));

    let state = AppState::build(scratch_root, host_dirs_root)
        .await
        .expect("failed to build application state");

    state.orchestrator.reconcile().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "startup reconciliation failed");
        0
    });

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/executions", post(handlers::run).get(handlers::active_list))
        .route("/executions/:id", get(handlers::status))
        .route("/executions/:id/stop", post(handlers::stop))
        .route("/executions/:id/subscribe", get(handlers::subscribe_ws))
        .route("/admin/executions/:id/kill", post(handlers::admin_kill))
        .route("/git/:project_id/:op", post(handlers::git_execute));

    if std::env::var("DEV_SEED_ROUTES").as_deref() == Ok("1") {
        router = router.route("/dev/seed", post(handlers::dev_seed));
    }

    let app = router.with_state(state).layer(TraceLayer::new_for_http());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    info!("orchestrator server listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.expect("server crashed");
}
