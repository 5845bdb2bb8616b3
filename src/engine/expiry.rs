use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Duration, interval};
use tracing::{error, info, warn};

use crate::state::AppState;

/// Caller-side poller: finds ride requests whose wait ran out and expires them through
/// the coordinator. Runs in the binary next to the HTTP server.
pub async fn run_expiry_poller(state: Arc<AppState>, every: Duration) {
    info!(interval_ms = every.as_millis() as u64, "expiry poller started");

    let mut ticker = interval(every);
    loop {
        ticker.tick().await;

        let now = Utc::now();
        let expired = match state.dispatch.expired_requests(now).await {
            Ok(expired) => expired,
            Err(err) => {
                error!(error = %err, "failed to list expired ride requests");
                continue;
            }
        };

        for request in expired {
            match state.dispatch.expire_request(request.ride_id, now).await {
                Ok(ride) => info!(ride_id = %ride.id, "ride request expired"),
                Err(err) if err.is_conflict() => {
                    warn!(ride_id = %request.ride_id, error = %err, "expiry skipped");
                }
                Err(err) => error!(ride_id = %request.ride_id, error = %err, "expiry failed"),
            }
        }
    }
}
