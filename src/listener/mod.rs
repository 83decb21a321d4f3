//! The listener (spec §4.7, §9 "Broker client variability -> an
//! interface"): a [`MessageSource`] abstraction implemented by the
//! streaming-broker client ([`stream`]) and the legacy socket client
//! ([`socket`]), plus the independent heartbeat monitor ([`heartbeat`]).
//! Neither transport nor the deserializer/classifier downstream of it knows
//! about the other.

pub mod heartbeat;
pub mod socket;
pub mod stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::notice::Notice;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("broker connection error: {0}")]
    Broker(String),
    #[error("socket connection error: {0}")]
    Socket(String),
    #[error("fatal initialization error: {0}")]
    Fatal(String),
}

/// Where a [`MessageSource`] starts consuming from (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Latest,
    Earliest,
}

/// A raw message read off a transport, before deserialization: `topic` lets
/// the stream listener recognize and discard heartbeat-topic traffic (spec
/// §4.7) without the deserializer ever seeing it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub bytes: Vec<u8>,
    /// Set by the transport when `topic` is a heartbeat topic (spec §4.7):
    /// the run loop discards these before they reach the deserializer.
    pub is_heartbeat: bool,
}

/// Transport abstraction both listener modes implement (spec §9): "subscribe
/// to topics, get a stream of (topic, bytes)". The socket transport has no
/// real topics, so it reports a single synthetic topic name.
#[async_trait]
pub trait MessageSource: Send {
    async fn connect(&mut self, start_at: StartPosition) -> Result<(), ListenerError>;
    /// Block for the next message, or `Ok(None)` on a clean end-of-stream
    /// (spec §4.7 "On stream end or exception: log, notify, reconnect").
    async fn recv(&mut self) -> Result<Option<RawMessage>, ListenerError>;
}

/// Producer handle for the notice queue (spec §5: single producer per
/// listener mode, single consumer in the dispatcher).
pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

/// `latest_message_time`, written by the listener and read by the heartbeat
/// monitor (spec §5 "Shared state"). A plain `RwLock` rather than an atomic
/// because `DateTime<Utc>` doesn't fit in a lock-free word; reads/writes are
/// both cheap and infrequent (one per inbound message, one per 5s poll).
pub type LatestMessageTime = std::sync::Arc<tokio::sync::RwLock<DateTime<Utc>>>;

pub fn new_latest_message_time() -> LatestMessageTime {
    std::sync::Arc::new(tokio::sync::RwLock::new(Utc::now()))
}

/// Run one listener mode to completion: connect, then loop recv -> classify
/// -> enqueue until `running` is cleared or the transport reports a fatal
/// error. Topic-aware heartbeat-message filtering (spec §4.7 "if topic is a
/// heartbeat topic, discard") happens inside each [`MessageSource`]
/// implementation, since only it knows its own topic naming.
pub async fn run_listener(
    mut source: Box<dyn MessageSource>,
    start_at: StartPosition,
    local_ivo: String,
    latest_message_time: LatestMessageTime,
    sender: NoticeSender,
    running: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    use std::sync::atomic::Ordering;

    loop {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = source.connect(start_at).await {
            tracing::error!(error = %e, "listener failed to connect, retrying");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }
        loop {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            match source.recv().await {
                Ok(Some(raw)) => {
                    *latest_message_time.write().await = Utc::now();
                    if raw.is_heartbeat {
                        continue;
                    }
                    match crate::notice::deserialize(&raw.bytes) {
                        Ok(payload) => {
                            let notice = crate::notice::classify(payload, &local_ivo, Utc::now());
                            if sender.send(notice).is_err() {
                                tracing::warn!("notice queue receiver dropped, stopping listener");
                                return;
                            }
                        }
                        Err(e) => {
                            // Drop-on-error (spec §7 `InvalidPayload`): offset
                            // is implicitly committed by moving on to the
                            // next `recv`.
                            tracing::warn!(topic = %raw.topic, error = %e, "failed to deserialize notice payload, dropping");
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!("listener stream ended, reconnecting");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "listener transport error, reconnecting");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeSource {
        messages: Vec<RawMessage>,
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn connect(&mut self, _start_at: StartPosition) -> Result<(), ListenerError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<RawMessage>, ListenerError> {
            Ok(self.messages.pop())
        }
    }

    #[tokio::test]
    async fn drains_messages_then_stops_on_running_flag() {
        let raw = RawMessage {
            topic: "gw".to_string(),
            bytes: br#"{"ivorn": "ivo://test/x#1", "role": "observation", "What": {"Param": []}}"#.to_vec(),
            is_heartbeat: false,
        };
        let source = FakeSource {
            messages: vec![raw],
        };
        let (tx, mut rx) = notice_channel();
        let running = Arc::new(AtomicBool::new(true));
        let latest = new_latest_message_time();
        let running_clone = running.clone();

        let handle = tokio::spawn(run_listener(
            Box::new(source),
            StartPosition::Latest,
            "ivo://localhost/alert-sentinel".to_string(),
            latest,
            tx,
            running_clone,
        ));

        let notice = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("channel closed");
        assert_eq!(notice.core.ivorn, "ivo://test/x#1");

        running.store(false, Ordering::Relaxed);
        handle.await.expect("listener task panicked");
    }
}
