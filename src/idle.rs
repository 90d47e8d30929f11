//! Background idle monitor: periodically demotes hot services whose
//! activity has gone quiet past their configured timeout.
//!
//! Runs a tight sleep-and-sweep poll, stopping cleanly on cancellation
//! rather than being killed mid-sweep.

use {
    crate::lifecycle::LifecycleManager, std::sync::Arc, std::time::Duration,
    tokio_util::sync::CancellationToken,
};

/// Sweep interval. Short enough that idle services are demoted promptly
/// without requiring an external timer service.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Runs the idle sweep loop until `token` is cancelled. Intended to be
/// `tokio::spawn`ed once at startup.
pub async fn run(lifecycle: Arc<LifecycleManager>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("idle monitor stopping");
                return;
            }
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                lifecycle.sweep_idle().await;
            }
        }
    }
}
