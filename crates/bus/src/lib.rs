//! fahrplan-bus — typed publish/subscribe messaging for the scheduling
//! pipeline.
//!
//! At-least-once delivery with a two-tier retry model: the transport
//! redelivers a failing message within a batch, a per-subscription
//! dead-letter retry engine escalates exhausted batches with exponential
//! backoff, and spent retry budgets terminate in a permanent-errors topic.
//! Two interchangeable backends implement the [`MessageBus`] contract —
//! [`InMemoryBus`] (timers and channels, fully testable in-process) and
//! [`BrokerBus`] (peek-lock semantics over an external [`BrokerClient`]).

pub mod broker;
mod dead_letter;
mod dispatch;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod memory;
pub mod naming;
pub mod retry;
pub mod shutdown;
pub mod traits;

#[cfg(test)]
pub(crate) mod testkit;

pub use broker::{BrokerBus, BrokerBusConfig, BrokerClient, LockedMessage};
pub use envelope::Envelope;
pub use error::BusError;
pub use handler::{
    ContinueWith, HandlerError, HandlerResponse, JobExecutionContext, MessageHandler,
};
pub use memory::{InMemoryBus, InMemoryBusConfig, PublishRecord};
pub use naming::{topic_of_subscription, validate_subscription_name};
pub use retry::{RetryDefinition, RetryPolicy};
pub use shutdown::Shutdown;
pub use traits::MessageBus;
