//! Security monitoring handlers

use axum::{extract::State, Json};
use chrono::Utc;

use crate::app_state::AppState;
use crate::middleware::AuthenticatedWallet;
use crate::monitor::SecurityStats;

/// GET /security/stats - Event counts and top IPs over the last hour
pub async fn get_stats(
    State(state): State<AppState>,
    wallet: AuthenticatedWallet,
) -> Json<SecurityStats> {
    tracing::debug!(address = %wallet.wallet_address, "Security stats requested");
    Json(state.monitor.stats_at(Utc::now()).await)
}
