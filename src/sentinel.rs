//! Supervisor wiring the listener, heartbeat monitor and dispatcher into one
//! running process (spec §5), using the same `JoinSet` + shutdown-flag
//! supervision shape as the rest of this codebase's long-running tasks.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{Config, ListenerMode};
use crate::db::Databases;
use crate::listener::{self, heartbeat, socket::SocketMessageSource, stream::KafkaMessageSource, StartPosition};
use crate::notify::Notifier;
use crate::skymap::{HttpSkymapFetcher, SkymapFetcher};

#[derive(Debug)]
enum TaskName {
    Listener,
    Heartbeat,
    Dispatcher,
}

/// Run the sentinel to completion: spawns the listener, heartbeat monitor
/// and dispatcher as supervised tasks, and returns once all three have
/// exited (normally only on `running` being cleared, e.g. by a Ctrl+C
/// handler installed by the caller).
pub async fn run(config: Config, dbs: Databases, running: Arc<AtomicBool>) {
    let config = Arc::new(config);
    let fetcher: Arc<dyn SkymapFetcher> = Arc::new(HttpSkymapFetcher::default());
    let notifier = Arc::new(Notifier::new(config.notify.clone()));
    let latest_message_time = listener::new_latest_message_time();
    let (tx, rx) = listener::notice_channel();

    let mut tasks: JoinSet<(TaskName, ())> = JoinSet::new();

    let start_at = if config.kafka.backdate {
        StartPosition::Earliest
    } else {
        StartPosition::Latest
    };

    let listener_running = running.clone();
    let listener_latest = latest_message_time.clone();
    let listener_local_ivo = config.local_ivo.clone();
    let listener_config = config.clone();
    tasks.spawn(async move {
        info!("listener task starting");
        let source: Box<dyn listener::MessageSource> = match listener_config.listener_mode {
            ListenerMode::Stream => Box::new(KafkaMessageSource::new(listener_config.kafka.clone())),
            ListenerMode::Socket => Box::new(SocketMessageSource::new(listener_config.socket.clone())),
        };
        listener::run_listener(
            source,
            start_at,
            listener_local_ivo,
            listener_latest,
            tx,
            listener_running,
        )
        .await;
        (TaskName::Listener, ())
    });

    let heartbeat_running = running.clone();
    let heartbeat_latest = latest_message_time.clone();
    let heartbeat_notifier = notifier.clone();
    let heartbeat_notifier_recovery = notifier.clone();
    tasks.spawn(async move {
        info!("heartbeat monitor task starting");
        heartbeat::run_heartbeat_monitor(
            heartbeat_latest,
            heartbeat_running,
            move || {
                let notifier = heartbeat_notifier.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.heartbeat_silence(60).await {
                        error!(error = %e, "failed to send heartbeat silence notification");
                    }
                });
            },
            move || {
                let notifier = heartbeat_notifier_recovery.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.heartbeat_recovery().await {
                        error!(error = %e, "failed to send heartbeat recovery notification");
                    }
                });
            },
        )
        .await;
        (TaskName::Heartbeat, ())
    });

    let dispatcher_running = running.clone();
    let dispatcher_dbs = dbs.clone();
    let dispatcher_fetcher = fetcher.clone();
    let dispatcher_config = config.clone();
    let dispatcher_notifier = notifier.clone();
    tasks.spawn(async move {
        info!("dispatcher task starting");
        crate::dispatcher::run_dispatcher(
            rx,
            dispatcher_dbs,
            dispatcher_fetcher,
            dispatcher_config,
            dispatcher_notifier,
            dispatcher_running,
        )
        .await;
        (TaskName::Dispatcher, ())
    });

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((name, ())) => info!(task = ?name, "supervised task exited"),
            Err(e) => error!(error = %e, "supervised task panicked"),
        }
    }
}
