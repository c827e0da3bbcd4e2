use std::collections::HashMap;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset};
use tokio::time::timeout;
use tracing::{error, info, warn};

use affiliation_common::affiliation::{AffiliationClaim, ClaimOrigin, TenantScope, TENANT_HEADER};
use affiliation_common::health::HealthHandle;
use affiliation_common::ingest::{AffiliationIngestionService, Outcome};

use crate::config::Config;
use crate::error::{ConsumerError, DecodeError};

/// Terminal state of one inbound event:
/// Received → Decoding → Ingesting → {Acknowledged | RedeliveryRequested}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event is done (applied, already applied, poisonous, or a
    /// reported conflict); its offset may be stored.
    Acknowledged,
    /// Transient failure: the offset must not advance past this event so
    /// the broker redelivers it.
    RedeliveryRequested,
}

/// Consumes affiliation-creation events and drives each through the shared
/// ingestion pipeline.
///
/// Offset handling is manual (`enable.auto.offset.store=false`): offsets
/// are stored per message once it is acknowledged, and the auto-commit
/// timer commits whatever was stored. A redelivery request seeks the
/// partition back, so nothing at or past the failed event is stored.
pub struct AffiliationEventConsumer {
    consumer: StreamConsumer,
    service: Arc<AffiliationIngestionService>,
    batch_size: usize,
    batch_timeout: Duration,
    liveness: HealthHandle,
}

impl AffiliationEventConsumer {
    pub fn new(
        config: &Config,
        service: Arc<AffiliationIngestionService>,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka.kafka_hosts)
            .set("group.id", &config.kafka.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        if config.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka.kafka_topic.as_str()])?;

        info!(
            topic = config.kafka.kafka_topic,
            group_id = config.kafka.kafka_consumer_group,
            "affiliation event consumer subscribed"
        );

        Ok(Self {
            consumer,
            service,
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            liveness,
        })
    }

    /// Run until the shutdown flag flips. In-flight batches complete;
    /// unstored offsets are redelivered after a restart, which the
    /// idempotent pipeline absorbs.
    pub async fn run(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        info!("starting affiliation consumer loop");

        loop {
            if *shutdown.borrow() {
                info!("shutdown signal received, stopping consumer loop");
                break;
            }

            self.liveness.report_healthy().await;

            let batch = self.collect_batch().await;
            if batch.is_empty() {
                continue;
            }

            let count = batch.len();
            self.process_batch(batch).await;
            metrics::counter!("affiliation_events_pulled_total").increment(count as u64);
        }

        Ok(())
    }

    /// Pull up to `batch_size` messages, bounded by `batch_timeout` per
    /// recv so an idle topic still lets the loop breathe.
    async fn collect_batch(&self) -> Vec<BorrowedMessage<'_>> {
        let mut messages = Vec::with_capacity(self.batch_size);

        while messages.len() < self.batch_size {
            match timeout(self.batch_timeout, self.consumer.recv()).await {
                Ok(Ok(message)) => messages.push(message),
                Ok(Err(error)) => {
                    warn!(error = %error, "kafka recv error");
                    break;
                }
                Err(_) => break, // idle, work with what we have
            }
        }

        messages
    }

    /// Partitions are processed concurrently; within a partition, events
    /// run strictly in order so a redelivery request can stop the
    /// remainder.
    async fn process_batch(&self, batch: Vec<BorrowedMessage<'_>>) {
        let mut partitions: HashMap<i32, Vec<BorrowedMessage<'_>>> = HashMap::new();
        for message in batch {
            partitions.entry(message.partition()).or_default().push(message);
        }

        join_all(
            partitions
                .into_values()
                .map(|messages| self.process_partition(messages)),
        )
        .await;
    }

    async fn process_partition(&self, messages: Vec<BorrowedMessage<'_>>) {
        for message in messages {
            match self.process_message(&message).await {
                EventDisposition::Acknowledged => {
                    if let Err(error) = self.consumer.store_offset_from_message(&message) {
                        warn!(
                            error = %error,
                            partition = message.partition(),
                            offset = message.offset(),
                            "failed to store offset"
                        );
                    }
                }
                EventDisposition::RedeliveryRequested => {
                    self.rewind_to(&message);
                    break;
                }
            }
        }
    }

    /// Seek the partition back to the failed event so the broker
    /// redelivers from there.
    fn rewind_to(&self, message: &BorrowedMessage<'_>) {
        if let Err(error) = self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            Duration::from_secs(5),
        ) {
            error!(
                error = %error,
                partition = message.partition(),
                offset = message.offset(),
                "failed to seek back for redelivery"
            );
        }
        metrics::counter!("affiliation_events_redelivery_requested_total").increment(1);
    }

    async fn process_message(&self, message: &BorrowedMessage<'_>) -> EventDisposition {
        // Received → Decoding
        let decoded = decode_event(message.payload(), tenant_header(message));
        let (scope, claim) = match decoded {
            Ok(decoded) => decoded,
            Err(error) => {
                // Poison message: surfaced, acknowledged-as-failed, never
                // allowed to block the partition.
                error!(
                    error = %error,
                    partition = message.partition(),
                    offset = message.offset(),
                    "dropping undecodable affiliation event"
                );
                metrics::counter!("affiliation_events_poisoned_total").increment(1);
                return EventDisposition::Acknowledged;
            }
        };

        // Decoding → Ingesting
        match self.service.ingest(&scope, claim, ClaimOrigin::ConsortiumEvent).await {
            Ok(outcome) => {
                if let Outcome::Transient { reason } = &outcome {
                    warn!(
                        reason,
                        partition = message.partition(),
                        offset = message.offset(),
                        "transient ingestion failure, requesting redelivery"
                    );
                }
                disposition_for(&outcome)
            }
            Err(validation) => {
                // The event itself is malformed; retrying cannot fix it.
                error!(
                    error = %validation,
                    partition = message.partition(),
                    offset = message.offset(),
                    "dropping invalid affiliation event"
                );
                metrics::counter!("affiliation_events_poisoned_total").increment(1);
                EventDisposition::Acknowledged
            }
        }
    }
}

/// Ingesting → {Acknowledged | RedeliveryRequested}. `Created` and
/// `AlreadyProcessed` both count as processed, which is what makes the
/// pipeline idempotent under redelivery. A `Rejected` conflict is reported
/// out-of-band by the service; the event itself is done.
pub fn disposition_for(outcome: &Outcome) -> EventDisposition {
    match outcome {
        Outcome::Created(_) | Outcome::AlreadyProcessed { .. } | Outcome::Rejected { .. } => {
            EventDisposition::Acknowledged
        }
        Outcome::Transient { .. } => EventDisposition::RedeliveryRequested,
    }
}

/// Parse an event payload and its tenant scope header into an affiliation
/// claim.
pub fn decode_event(
    payload: Option<&[u8]>,
    tenant: Option<&[u8]>,
) -> Result<(TenantScope, AffiliationClaim), DecodeError> {
    let tenant = tenant.ok_or(DecodeError::MissingTenantHeader)?;
    let tenant = str::from_utf8(tenant).map_err(|_| DecodeError::InvalidTenantHeader)?;
    let payload = payload.ok_or(DecodeError::EmptyPayload)?;
    let claim: AffiliationClaim = serde_json::from_slice(payload)?;

    Ok((TenantScope::new(tenant), claim))
}

fn tenant_header<'a>(message: &'a BorrowedMessage<'_>) -> Option<&'a [u8]> {
    message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == TENANT_HEADER)
            .and_then(|header| header.value)
    })
}
