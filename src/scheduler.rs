use crate::processor::EventProcessor;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

/// Long-running timer loop (§4.G). Sleeps until the earliest suspended
/// event's `nextActivationAt` passes, then drives the Processor. Races
/// freely with webhook-triggered ticks; the Processor's own mutex
/// serializes the two.
pub async fn run_timer(store: Arc<Store>, processor: Arc<EventProcessor>, default_interval_secs: i64) {
    loop {
        let earliest = match store.earliest_next_activation(default_interval_secs).await {
            Ok(ts) => ts,
            Err(e) => {
                error!("failed to compute earliest next activation: {e}");
                sleep(Duration::from_secs(default_interval_secs.max(1) as u64)).await;
                continue;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let wait_secs = (earliest - now).max(0) as u64;
        debug!(wait_secs, "timer sleeping until next activation");
        sleep(Duration::from_secs(wait_secs)).await;

        processor.clone().process_one().await;
    }
}
