pub mod handlers;

use axum::routing::{delete, get, patch, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Every route, one handler each. Method and body checks happen in the
/// router and the extractors.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/add-job", put(handlers::handle_add_job))
        .route("/job-info", get(handlers::handle_job_info))
        .route("/job-list", get(handlers::handle_job_list))
        .route("/job-peer", get(handlers::handle_job_peer))
        .route("/start-jobs", patch(handlers::handle_start_jobs))
        .route("/pause-jobs", patch(handlers::handle_pause_jobs))
        .route("/terminate-jobs", patch(handlers::handle_terminate_jobs))
        .route(
            "/remove-from-history",
            patch(handlers::handle_remove_from_history),
        )
        .route("/clear-history", patch(handlers::handle_clear_history))
        .route("/holders", get(handlers::handle_holders))
        .route("/files", get(handlers::handle_files))
        .route("/get-peers", get(handlers::handle_get_peers))
        .route("/get-peer", get(handlers::handle_get_peer))
        .route("/remove-peer", delete(handlers::handle_remove_peer))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
