use crate::conf::Config;
use crate::health::{Delivery, HealthStatus, SharedHealthState};
use crate::transform::{Message, MessageTransformer};
use anyhow::{Context, anyhow};
use futures::StreamExt;
use rdkafka::Message as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::BorrowedMessage;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const PREVIEW_BYTES: usize = 200;

type MetadataCheck = Arc<dyn Fn() -> KafkaResult<usize> + Send + Sync>;

/// Consumes the source topic, transforms each record and produces it to the
/// target topic. Offsets are committed only once the broker has acknowledged
/// the produced record, so a failure anywhere leads to redelivery.
pub struct EventRelay {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    config: Config,
    health_state: SharedHealthState,
    transformer: Arc<dyn MessageTransformer>,
}

impl EventRelay {
    /// Fetches topic metadata until the broker answers, retrying up to 10
    /// times with exponential backoff. Client creation in librdkafka is lazy,
    /// so this is where bad credentials or trust material first show up.
    async fn verify_with_retry(
        check: MetadataCheck,
        topic: &str,
        context_msg: &str,
    ) -> anyhow::Result<()> {
        const MAX_RETRIES: u8 = 10;
        const INITIAL_DELAY: Duration = Duration::from_secs(1);
        const MAX_DELAY: Duration = Duration::from_secs(30);

        let mut delay = INITIAL_DELAY;
        let mut attempt: u8 = 1;

        loop {
            info!(
                event = "broker_check",
                topic,
                attempt,
                max_attempts = MAX_RETRIES,
                "{context_msg}: fetching topic metadata"
            );

            let task_check = Arc::clone(&check);
            let result = tokio::task::spawn_blocking(move || task_check())
                .await
                .context("Metadata check task panicked")?;

            let e = match result {
                Ok(partitions) => {
                    if partitions == 0 {
                        warn!(
                            event = "broker_check_no_partitions",
                            topic, "Broker reachable but topic reports no partitions"
                        );
                    }
                    info!(
                        event = "broker_check_succeeded",
                        topic, partitions, attempt, "Broker reachable"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            error!(
                event = "broker_check_failed",
                topic,
                attempt,
                max_attempts = MAX_RETRIES,
                error = %e,
                hint = failure_hint(&format!("{e:?}")),
                "{context_msg}"
            );

            if attempt >= MAX_RETRIES {
                return Err(e).context(format!(
                    "{context_msg} after {MAX_RETRIES} attempts (topic {topic})"
                ));
            }

            warn!(delay_secs = delay.as_secs(), "Retrying broker check");
            time::sleep(delay).await;
            // Exponential backoff, capped at MAX_DELAY
            delay = std::cmp::min(delay * 2, MAX_DELAY);
            attempt += 1;
        }
    }

    /// Create Kafka clients from `config` and verify both ends are reachable.
    ///
    /// # Errors
    /// Returns an error if a client cannot be created from the configured
    /// properties or if the brokers stay unreachable through every retry.
    pub async fn new(
        config: Config,
        health_state: SharedHealthState,
        transformer: Arc<dyn MessageTransformer>,
    ) -> anyhow::Result<Self> {
        health_state.write().await.set(HealthStatus::Starting);

        info!(
            event = "relay_initializing",
            bootstrap_servers = %config.bootstrap_servers,
            source_topic = %config.source_topic,
            target_topic = %config.target_topic,
            consumer_group = %config.consumer_group,
            security_protocol = %config.security_protocol,
            oauth = config.oauth.is_some(),
            "Initializing event relay"
        );

        let consumer_settings = config.consumer_settings();
        debug!(settings = ?sanitize_settings_for_logging(&consumer_settings), "Consumer settings");
        let consumer: StreamConsumer = client_config(&consumer_settings)
            .create()
            .context("Failed to create Kafka consumer")?;
        let consumer = Arc::new(consumer);

        let producer_settings = config.producer_settings();
        debug!(settings = ?sanitize_settings_for_logging(&producer_settings), "Producer settings");
        let producer: FutureProducer = client_config(&producer_settings)
            .create()
            .context("Failed to create Kafka producer")?;

        let source_check: MetadataCheck = {
            let consumer = Arc::clone(&consumer);
            let topic = config.source_topic.clone();
            Arc::new(move || {
                consumer
                    .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                    .map(|m| partition_count(&m, &topic))
            })
        };
        Self::verify_with_retry(
            source_check,
            &config.source_topic,
            "Failed to reach source brokers",
        )
        .await
        .context("Source broker verification failed")?;

        let target_check: MetadataCheck = {
            let producer = producer.clone();
            let topic = config.target_topic.clone();
            Arc::new(move || {
                producer
                    .client()
                    .fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)
                    .map(|m| partition_count(&m, &topic))
            })
        };
        Self::verify_with_retry(
            target_check,
            &config.target_topic,
            "Failed to reach target brokers",
        )
        .await
        .context("Target broker verification failed")?;

        info!(event = "relay_initialized", "Event relay initialization complete");
        health_state.write().await.set(HealthStatus::Healthy);

        Ok(Self {
            consumer,
            producer,
            config,
            health_state,
            transformer,
        })
    }

    async fn mark_unhealthy(&self) {
        self.health_state.write().await.set(HealthStatus::Unhealthy);
    }

    async fn deliver(&self, key: Option<&[u8]>, payload: Option<&[u8]>) -> anyhow::Result<()> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.config.target_topic);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(payload) = payload {
            record = record.payload(payload);
        }

        match self
            .producer
            .send(record, Timeout::After(self.config.delivery_timeout))
            .await
        {
            Ok((partition, offset)) => {
                info!(
                    event = "message_published",
                    topic = %self.config.target_topic,
                    partition,
                    offset,
                    "Successfully published message to target"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    event = "message_publish_failed",
                    topic = %self.config.target_topic,
                    error = %e,
                    hint = failure_hint(&format!("{e:?}")),
                    "Failed to publish message"
                );
                Err(anyhow::Error::new(e).context(format!(
                    "Failed to deliver message to {}",
                    self.config.target_topic
                )))
            }
        }
    }

    async fn relay(&self, message: &BorrowedMessage<'_>) -> anyhow::Result<()> {
        match message.payload() {
            Some(payload) => info!(
                event = "message_received",
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                bytes = payload.len(),
                content = %payload_preview(payload),
                "Received message"
            ),
            None => warn!(
                event = "tombstone_received",
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "Forwarding record without payload"
            ),
        }

        let outbound =
            prepare_outbound(self.transformer.as_ref(), message.key(), message.payload()).await;

        let result = deliver_then_commit(
            self.deliver(outbound.key.as_deref(), outbound.payload.as_deref()),
            || self.commit(message),
        )
        .await;
        if result.is_err() {
            self.mark_unhealthy().await;
        }
        result?;

        self.health_state
            .write()
            .await
            .record_delivery(outbound.delivery);
        Ok(())
    }

    fn commit(&self, message: &BorrowedMessage<'_>) -> anyhow::Result<()> {
        self.consumer
            .commit_message(message, CommitMode::Async)
            .map_err(|e| {
                error!(
                    event = "offset_commit_failed",
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "Failed to commit offset"
                );
                anyhow!("Failed to commit offset: {e}")
            })
    }

    /// Relay messages until the consumer fails.
    ///
    /// # Errors
    /// Always returns an error when it stops: a subscribe, receive, delivery
    /// or commit failure, or the consumer stream ending.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            event = "consumer_subscribing",
            topic = %self.config.source_topic,
            group = %self.config.consumer_group,
            "Subscribing to source topic"
        );

        self.consumer
            .subscribe(&[self.config.source_topic.as_str()])
            .context("Failed to subscribe to source topic")?;

        info!("Consumer started, waiting for messages...");

        let mut stream = self.consumer.stream();
        while let Some(delivery_result) = stream.next().await {
            match delivery_result {
                Ok(message) => self.relay(&message).await?,
                Err(e) => {
                    error!(
                        event = "consume_failed",
                        error = %e,
                        hint = failure_hint(&format!("{e:?}")),
                        "Error receiving message"
                    );
                    self.mark_unhealthy().await;
                    return Err(anyhow!("Consumer error: {e}"));
                }
            }
        }

        warn!("Consumer stream ended");
        self.mark_unhealthy().await;
        Err(anyhow!("Consumer stream ended unexpectedly"))
    }
}

/// What gets produced for one consumed record.
#[derive(Debug)]
struct Outbound<'a> {
    key: Option<Cow<'a, [u8]>>,
    payload: Option<Cow<'a, [u8]>>,
    delivery: Delivery,
}

/// Pick the record to produce. Tombstones skip the transformer; a transformer
/// error forwards the original key and payload.
async fn prepare_outbound<'a>(
    transformer: &dyn MessageTransformer,
    key: Option<&'a [u8]>,
    payload: Option<&'a [u8]>,
) -> Outbound<'a> {
    let Some(payload) = payload else {
        return Outbound {
            key: key.map(Cow::Borrowed),
            payload: None,
            delivery: Delivery::Tombstone,
        };
    };

    match transformer.transform(Message::borrowed(key, payload)).await {
        Ok(out) => {
            // Transformers hand the input back borrowed when they leave it alone
            let delivery = if matches!(out.payload, Cow::Owned(_)) {
                Delivery::Enriched
            } else {
                Delivery::PassedThrough
            };
            Outbound {
                key: out.key,
                payload: Some(out.payload),
                delivery,
            }
        }
        Err(e) => {
            error!(
                event = "transform_failed",
                error = %e,
                content = %payload_preview(payload),
                "Transformer failed, forwarding original message"
            );
            Outbound {
                key: key.map(Cow::Borrowed),
                payload: Some(Cow::Borrowed(payload)),
                delivery: Delivery::PassedThrough,
            }
        }
    }
}

/// Commit only once `delivery` has succeeded; a failed delivery leaves the
/// offset uncommitted so the record is consumed again.
async fn deliver_then_commit<D, C>(delivery: D, commit: C) -> anyhow::Result<()>
where
    D: Future<Output = anyhow::Result<()>>,
    C: FnOnce() -> anyhow::Result<()>,
{
    delivery.await?;
    commit()
}

fn client_config(settings: &[(&'static str, String)]) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(*key, value);
    }
    config
}

fn partition_count(metadata: &Metadata, topic: &str) -> usize {
    metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .map_or(0, |t| t.partitions().len())
}

/// Map a librdkafka error rendering to a likely cause for the operator.
fn failure_hint(error: &str) -> &'static str {
    if error.contains("Authentication") || error.contains("SASL") || error.contains("OAUTH") {
        "authentication failed: check OAuth client credentials and the token endpoint"
    } else if error.contains("SSL") {
        "TLS handshake failed: check the CA location and broker certificates"
    } else if error.contains("Resolve") {
        "DNS resolution failed: check the bootstrap server hostnames"
    } else if error.contains("AllBrokersDown") || error.contains("BrokerTransportFailure") {
        "brokers unreachable: check bootstrap servers and network policy"
    } else if error.contains("TimedOut") {
        "timed out waiting for the broker"
    } else {
        "unclassified broker error"
    }
}

/// Render a payload for logs, truncated on a character boundary.
fn payload_preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) if s.len() > PREVIEW_BYTES => {
            let mut end = PREVIEW_BYTES;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Ok(s) => s.to_string(),
        Err(_) => format!("<binary data, {} bytes>", data.len()),
    }
}

/// Mask secret-bearing client properties before they reach the logs.
fn sanitize_settings_for_logging(
    settings: &[(&'static str, String)],
) -> Vec<(&'static str, String)> {
    settings
        .iter()
        .map(|(key, value)| {
            if key.contains("secret") || key.contains("password") {
                (*key, "***".to_string())
            } else {
                (*key, value.clone())
            }
        })
        .collect()
}
