use std::sync::Arc;

use axum::{routing::get, Router};

use consultation_queue_cell::create_consultation_queue_router;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "Consultation queue API is running!" }))
        .nest("/queue", create_consultation_queue_router(state.clone()))
}
