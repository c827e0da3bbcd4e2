use thiserror::Error;

use affiliation_common::store::StoreError;

/// Enumeration of errors for operations with the affiliation event
/// consumer. Per-event failures are not errors at this level: they resolve
/// to an acknowledgment or a redelivery request instead.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Why an inbound event could not be turned into an affiliation claim.
/// All of these are poison messages: acknowledged-as-failed, never
/// retried, never allowed to wedge the partition.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("event payload is empty")]
    EmptyPayload,

    #[error("event is missing the tenant scope header")]
    MissingTenantHeader,

    #[error("tenant scope header is not valid utf-8")]
    InvalidTenantHeader,

    #[error("failed to parse event payload: {0}")]
    Payload(#[from] serde_json::Error),
}
