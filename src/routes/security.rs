//! Security monitoring routes

use axum::{routing::get, Router};

use crate::app_state::AppState;
use crate::handlers::security;

pub fn security_routes() -> Router<AppState> {
    Router::new().route("/security/stats", get(security::get_stats))
}
