use std::time::Duration;

use tracing::{info, warn};

use crate::error::AppError;
use crate::services::api::ApiClient;

/// Hourly nudge for the control plane's log retention job. Always
/// non-fatal.
pub async fn start_log_retention_loop(
    api: ApiClient,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Log retention trigger started");

    loop {
        ticker.tick().await;

        info!("Triggering log cleanup...");
        match api.trigger_log_cleanup().await {
            Ok(()) => info!("Log cleanup triggered ✅"),
            Err(e) => warn!(error = %e, "Log cleanup call failed"),
        }
    }
}
