//! Background tasks for the callflow server.
//!
//! Includes:
//! - Sweeping closed live streams once their linger period has passed.

use std::sync::Arc;

use callflow_stream::StreamHub;
use tokio::time::{sleep, Duration, Instant};

/// Starts the closed-stream sweep.
///
/// Runs until the runtime shuts down. A zero interval disables the sweep,
/// leaving closed streams in memory for the life of the process.
pub async fn start_stream_sweep_task(hub: Arc<StreamHub>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("stream sweep task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting stream sweep task");

    loop {
        sleep(interval).await;
        let removed = hub.sweep_closed(Instant::now());
        if removed > 0 {
            tracing::info!(count = removed, remaining = hub.len(), "swept closed call streams");
        }
    }
}
