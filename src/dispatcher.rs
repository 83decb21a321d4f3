//! Dispatcher (spec §4.8, §4.9): the single consumer of the notice queue.
//! Filters ignored roles, invokes the handler, reports outcomes, and spawns
//! a Fermi follow-up task for GBM notices whose skymap was only guessed
//! from a lightcurve URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::db::Databases;
use crate::handler::{self, event_type_label};
use crate::listener::NoticeReceiver;
use crate::notice::{EventType, Notice, NoticeKind};
use crate::notify::Notifier;
use crate::skymap::SkymapFetcher;

/// Fermi follow-up polling window (spec §4.9): give GBM's automated
/// localization pipeline up to 10 minutes to publish a refined skymap
/// before giving up.
const FOLLOWUP_TIMEOUT: Duration = Duration::from_secs(600);
const FOLLOWUP_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Run the dispatcher until the queue closes or `running` is cleared.
pub async fn run_dispatcher(
    mut notices: NoticeReceiver,
    dbs: Databases,
    fetcher: Arc<dyn SkymapFetcher>,
    config: Arc<Config>,
    notifier: Arc<Notifier>,
    running: Arc<AtomicBool>,
) {
    let ignored_roles = config.effective_ignored_roles();

    while running.load(Ordering::Relaxed) {
        let Some(notice) =
            match tokio::time::timeout(Duration::from_millis(500), notices.recv()).await {
                Ok(n) => n,
                Err(_) => continue,
            }
        else {
            return;
        };

        if notice.core.event_type == EventType::Unknown {
            tracing::debug!(ivorn = %notice.core.ivorn, "skipping notice with unclassifiable event type");
            let _ = notifier.ignored(&notice).await;
            continue;
        }

        if ignored_roles.iter().any(|r| r == notice.core.role.as_str()) {
            tracing::debug!(ivorn = %notice.core.ivorn, role = notice.core.role.as_str(), "ignoring notice with filtered role");
            let _ = notifier.ignored(&notice).await;
            continue;
        }

        let label = event_type_label(notice.core.event_type);
        if let Err(e) = notifier.notice_received(&notice, label).await {
            tracing::warn!(error = %e, "failed to send notice-received notification");
        }

        match handler::handle_notice(&dbs, fetcher.as_ref(), &config, &notice, Utc::now()).await {
            Ok(outcome) => {
                tracing::info!(
                    event = %outcome.event_name,
                    strategy = %outcome.strategy_key,
                    targets_created = outcome.targets_created,
                    targets_tombstoned = outcome.targets_tombstoned,
                    "notice handled"
                );
                if let Err(e) = notifier.observing_report(&outcome, label).await {
                    tracing::warn!(error = %e, "failed to send observing report");
                }
                maybe_spawn_fermi_followup(&notice, &dbs, &fetcher, &config, &running);
            }
            Err(handler::HandlerError::DuplicateNotice(ivorn)) => {
                tracing::debug!(ivorn, "duplicate notice, already recorded");
            }
            Err(e) => {
                tracing::error!(ivorn = %notice.core.ivorn, error = %e, "failed to handle notice");
            }
        }
    }
}

/// If this was a Fermi GBM notice whose skymap URL was only guessed from a
/// lightcurve plot URL (spec §4.9), spawn a task that polls the guessed URL
/// until it resolves or the window expires, then re-enqueues the event
/// under an IVORN carrying the `_new_skymap` suffix so it flows back through
/// the dispatcher exactly like a fresh notice.
fn maybe_spawn_fermi_followup(
    notice: &Notice,
    dbs: &Databases,
    fetcher: &Arc<dyn SkymapFetcher>,
    config: &Arc<Config>,
    running: &Arc<AtomicBool>,
) {
    let NoticeKind::Fermi(ext) = &notice.kind else {
        return;
    };
    let Some(url) = ext.guessed_skymap_url.clone() else {
        return;
    };
    if notice.has_new_skymap_suffix() {
        return;
    }

    let notice = notice.with_new_skymap_suffix();
    let dbs = dbs.clone();
    let fetcher = fetcher.clone();
    let config = config.clone();
    let running = running.clone();

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + FOLLOWUP_TIMEOUT;
        loop {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!(ivorn = %notice.core.ivorn, "fermi follow-up window expired without a resolved skymap");
                return;
            }
            match fetcher
                .fetch(&url, Duration::from_secs(config.skymap_download_timeout_secs))
                .await
            {
                Ok(bytes) => match crate::skymap::SkyMap::from_fits(&bytes) {
                    Ok(map) => {
                        let mut resolved = notice.clone();
                        resolved.core.skymap = Some(Arc::new(map));
                        match handler::handle_notice(&dbs, fetcher.as_ref(), &config, &resolved, Utc::now()).await {
                            Ok(outcome) => tracing::info!(event = %outcome.event_name, "fermi follow-up skymap resolved and applied"),
                            Err(e) => tracing::error!(error = %e, "fermi follow-up handling failed"),
                        }
                        return;
                    }
                    Err(_) => {
                        tokio::time::sleep(FOLLOWUP_POLL_INTERVAL).await;
                    }
                },
                Err(_) => {
                    tokio::time::sleep(FOLLOWUP_POLL_INTERVAL).await;
                }
            }
        }
    });
}
