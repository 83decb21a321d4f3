//! STREAM listener mode (spec §4.7): a Kafka-compatible broker client
//! subscribed to a static topic list, built on `rdkafka`'s
//! [`StreamConsumer`].

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};

use crate::config::{KafkaConfig, SaslMechanism};

use super::{ListenerError, MessageSource, RawMessage, StartPosition};

/// Fixed topic list this sentinel subscribes to (spec §4.7): one topic per
/// notice family. [`HEARTBEAT_TOPIC`] is appended separately at subscribe
/// time since it is also referenced on its own by the backdate fast-forward.
const NOTICE_TOPICS: &[&str] = &[
    "gcn.classic.voevent.LVC_PRELIMINARY",
    "gcn.classic.voevent.LVC_INITIAL",
    "gcn.classic.voevent.LVC_UPDATE",
    "gcn.classic.voevent.LVC_RETRACTION",
    "gcn.classic.voevent.FERMI_GBM_FIN_POS",
    "gcn.classic.voevent.SWIFT_BAT_GRB_POS",
    "gcn.classic.voevent.GECAM_FLT",
    "gcn.classic.voevent.EINSTEIN_PROBE_ALERT",
    "gcn.notices.icecube.astrotrack.gold",
    "gcn.notices.icecube.astrotrack.bronze",
    "gcn.notices.icecube.cascade",
];

const HEARTBEAT_TOPIC: &str = "gcn.heartbeat";

pub struct KafkaMessageSource {
    config: KafkaConfig,
    consumer: Option<StreamConsumer>,
}

impl KafkaMessageSource {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: None,
        }
    }

    fn build_client_config(&self, start_at: StartPosition) -> ClientConfig {
        let offset_reset = match start_at {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        };
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("session.timeout.ms", "45000")
            .set("auto.offset.reset", offset_reset);

        match self.config.mechanism {
            SaslMechanism::Plain => {
                client_config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanisms", "PLAIN")
                    .set("sasl.username", &self.config.user)
                    .set("sasl.password", &self.config.password);
            }
            SaslMechanism::Oauthbearer => {
                client_config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanisms", "OAUTHBEARER")
                    .set(
                        "sasl.oauthbearer.token.endpoint.url",
                        self.config.oauth_token_url.as_deref().unwrap_or_default(),
                    )
                    .set("sasl.oauthbearer.client.id", &self.config.user)
                    .set("sasl.oauthbearer.client.secret", &self.config.password);
            }
        }
        client_config
    }

    /// Commits the heartbeat topic's partitions to their current end offset
    /// under this client's group id, using a throwaway consumer that is
    /// dropped as soon as the commit lands.
    async fn fast_forward_heartbeat_topic(&self) -> Result<(), ListenerError> {
        let scratch: StreamConsumer = self
            .build_client_config(StartPosition::Latest)
            .create()
            .map_err(|e| ListenerError::Broker(format!("failed to create heartbeat scratch consumer: {e}")))?;

        let metadata = scratch
            .fetch_metadata(Some(HEARTBEAT_TOPIC), std::time::Duration::from_secs(10))
            .map_err(|e| ListenerError::Broker(format!("failed to fetch heartbeat topic metadata: {e}")))?;
        let Some(topic) = metadata.topics().iter().find(|t| t.name() == HEARTBEAT_TOPIC) else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        for partition in topic.partitions() {
            tpl.add_partition_offset(HEARTBEAT_TOPIC, partition.id(), Offset::End)
                .map_err(|e| ListenerError::Broker(format!("failed to seek heartbeat topic: {e}")))?;
        }
        scratch
            .assign(&tpl)
            .map_err(|e| ListenerError::Broker(format!("failed to assign heartbeat topic: {e}")))?;
        scratch
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| ListenerError::Broker(format!("failed to commit heartbeat topic offset: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn connect(&mut self, start_at: StartPosition) -> Result<(), ListenerError> {
        // Backdated EARLIEST start (spec §4.7): a full earliest replay would
        // also replay weeks of heartbeat messages under a fresh group id, so
        // fast-forward just the heartbeat topic's committed offset to its
        // end on a short-lived consumer before the real one ever subscribes.
        // `assign` on the real consumer would instead replace its whole
        // subscription with just this one topic, so the two stay separate.
        if start_at == StartPosition::Earliest {
            self.fast_forward_heartbeat_topic().await?;
        }

        let consumer: StreamConsumer = self
            .build_client_config(start_at)
            .create()
            .map_err(|e| ListenerError::Broker(format!("failed to create consumer: {e}")))?;

        let topics: Vec<&str> = NOTICE_TOPICS
            .iter()
            .copied()
            .chain(std::iter::once(HEARTBEAT_TOPIC))
            .collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| ListenerError::Broker(format!("failed to subscribe: {e}")))?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RawMessage>, ListenerError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| ListenerError::Broker("recv called before connect".to_string()))?;

        match consumer.recv().await {
            Ok(message) => {
                let topic = message.topic().to_string();
                let is_heartbeat = topic == HEARTBEAT_TOPIC;
                let bytes = if is_heartbeat {
                    Vec::new()
                } else {
                    message.payload().unwrap_or_default().to_vec()
                };
                Ok(Some(RawMessage { topic, bytes, is_heartbeat }))
            }
            Err(e) => Err(ListenerError::Broker(e.to_string())),
        }
    }
}
