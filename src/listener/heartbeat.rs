//! Heartbeat monitor (spec §4.7): an independent task polling
//! `latest_message_time` every 5 seconds. After 60 seconds of silence it
//! emits a single warning (not one per poll), and emits a recovery message
//! the next time a message arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::LatestMessageTime;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const SILENCE_THRESHOLD_SECS: i64 = 60;

/// Run the heartbeat monitor until `running` is cleared. `on_silence` and
/// `on_recovery` are injection points the dispatcher's notification composer
/// hooks into (spec §4.10 "notify on silence / recovery"); tests pass plain
/// closures over a shared counter instead.
pub async fn run_heartbeat_monitor(
    latest_message_time: LatestMessageTime,
    running: Arc<AtomicBool>,
    on_silence: impl Fn() + Send + 'static,
    on_recovery: impl Fn() + Send + 'static,
) {
    let mut silent = false;

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(POLL_INTERVAL).await;

        let last = *latest_message_time.read().await;
        let elapsed = (Utc::now() - last).num_seconds();

        if elapsed >= SILENCE_THRESHOLD_SECS {
            if !silent {
                tracing::warn!(elapsed_secs = elapsed, "no messages received, listener may be stalled");
                on_silence();
                silent = true;
            }
        } else if silent {
            tracing::info!("listener recovered, messages flowing again");
            on_recovery();
            silent = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn warns_once_after_sustained_silence_then_recovers() {
        let latest = super::super::new_latest_message_time();
        // Force the stored timestamp far enough into the past that the
        // first poll already observes silence.
        *latest.write().await = Utc::now() - chrono::Duration::seconds(120);

        let running = Arc::new(AtomicBool::new(true));
        let silence_count = Arc::new(AtomicUsize::new(0));
        let recovery_count = Arc::new(AtomicUsize::new(0));

        let silence_clone = silence_count.clone();
        let recovery_clone = recovery_count.clone();
        let latest_clone = latest.clone();
        let running_clone = running.clone();

        let handle = tokio::spawn(run_heartbeat_monitor(
            latest_clone,
            running_clone,
            move || {
                silence_clone.fetch_add(1, Ordering::Relaxed);
            },
            move || {
                recovery_clone.fetch_add(1, Ordering::Relaxed);
            },
        ));

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(silence_count.load(Ordering::Relaxed), 1);

        *latest.write().await = Utc::now();
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(recovery_count.load(Ordering::Relaxed), 1);

        running.store(false, Ordering::Relaxed);
        tokio::time::advance(Duration::from_secs(6)).await;
        handle.await.expect("heartbeat task panicked");
    }
}
