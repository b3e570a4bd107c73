use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;

/// Wire-format message envelope carried between pipeline stages.
///
/// The payload is MessagePack-encoded with named fields so that a consumer
/// may decode a narrower projection of the body than the publisher encoded
/// (unknown fields are skipped). The `correlation_id` ties a scheduling
/// chain together across continuations; `retries_count` travels on the
/// envelope itself so dead-letter escalation cycles survive re-publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-assigned message id, stable across a scheduling chain.
    /// Publishing an envelope with an empty id is rejected.
    pub id: String,

    /// Opaque version token of the job definition revision this message
    /// was built from.
    pub etag: String,

    /// Job-type tag used to namespace the dynamic pipeline topics.
    pub job_type: String,

    /// Optional run tag, lets concurrent runs sharing a broker ignore each
    /// other's traffic.
    pub run_id: Option<String>,

    /// Correlation id for chain tracking; attached at publish time and
    /// propagated through continuations.
    pub correlation_id: Uuid,

    /// When this envelope was created.
    pub enqueued_at: DateTime<Utc>,

    /// When set, the message becomes visible to subscribers at this time
    /// instead of immediately.
    pub scheduled_enqueue_time_utc: Option<DateTime<Utc>>,

    /// Transport-maintained in-batch redelivery counter.
    #[serde(default)]
    pub delivery_count: u32,

    /// Application-maintained dead-letter escalation counter.
    #[serde(default)]
    pub retries_count: u32,

    /// When set, only the named subscription receives this message.
    /// Used by the dead-letter retry engine so a redelivered message does
    /// not fan out to sibling subscriptions again.
    #[serde(default)]
    pub route_to: Option<String>,

    /// MessagePack-encoded (named) body bytes.
    pub payload: Vec<u8>,

    /// Envelope schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Envelope {
    /// Encode a body into a fresh envelope.
    pub fn encode<T: Serialize>(
        id: impl Into<String>,
        etag: impl Into<String>,
        job_type: impl Into<String>,
        body: &T,
    ) -> Result<Self, BusError> {
        Ok(Self {
            id: id.into(),
            etag: etag.into(),
            job_type: job_type.into(),
            run_id: None,
            correlation_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            scheduled_enqueue_time_utc: None,
            delivery_count: 0,
            retries_count: 0,
            route_to: None,
            payload: rmp_serde::to_vec_named(body)?,
            version: 1,
        })
    }

    /// Decode the body into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BusError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Serialize the whole envelope for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from transport bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Builder-style correlation override (used when publishing
    /// continuations under the incoming message's correlation id).
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
