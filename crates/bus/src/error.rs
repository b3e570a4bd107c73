use thiserror::Error;

/// Errors that can occur in the fahrplan messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid subscription name `{0}`: expected `<TopicName>_<Suffix>`")]
    InvalidNaming(String),

    #[error("subscription `{0}` is already registered")]
    DuplicateSubscription(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bus is closed")]
    Closed,
}
