//! Broker connectivity traits
//!
//! The conversation core only talks to a broker through these traits. A
//! backend supplies connect/close, a channel, exchange and queue declaration,
//! binding, publish, a timed fetch and explicit acknowledgement. Framing,
//! reconnection and TLS are the backend's business.

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    error::BrokerResult,
    types::{ExchangeName, QueueName, RoutingKey},
};

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route to queues whose binding key equals the routing key
    Direct,
}

/// Options for exchange and queue declaration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclareOptions {
    /// Remove the entity once nothing uses it any more
    pub auto_delete: bool,
    /// Survive a broker restart
    pub durable: bool,
}

impl DeclareOptions {
    /// Non-durable, auto-deleting declaration
    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            durable: false,
        }
    }
}

/// A message fetched from a queue and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag to pass to [`BrokerChannel::ack`]
    pub delivery_tag: u64,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Raw message body
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// What the broker reported for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed the message
    Acked,
    /// The broker refused the message
    Nacked,
    /// The channel is not in confirm mode
    Unconfirmed,
}

impl PublishOutcome {
    /// Whether the broker explicitly refused the message
    pub fn is_nack(&self) -> bool {
        matches!(self, PublishOutcome::Nacked)
    }
}

/// Entry point of a broker backend
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connection type produced by this backend
    type Connection: BrokerConnection;

    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unreachable` if the broker cannot be reached
    /// or the handshake fails.
    async fn connect(&self) -> BrokerResult<Self::Connection>;
}

/// An open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Channel type multiplexed over this connection
    type Channel: BrokerChannel;

    /// Open a channel on this connection
    async fn open_channel(&self) -> BrokerResult<Self::Channel>;

    /// Close the connection and every channel on it
    ///
    /// Unacknowledged deliveries go back to their queues.
    async fn close(&self) -> BrokerResult<()>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// A channel over which topology is declared and messages flow
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare an exchange; redeclaring with identical properties is a no-op
    async fn declare_exchange(
        &self,
        name: &ExchangeName,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()>;

    /// Declare a queue; redeclaring with identical properties is a no-op
    async fn declare_queue(&self, name: &QueueName, options: DeclareOptions)
    -> BrokerResult<()>;

    /// Bind a queue to an exchange under a routing key
    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
    ) -> BrokerResult<()>;

    /// Publish a message body through an exchange
    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        payload: &[u8],
    ) -> BrokerResult<PublishOutcome>;

    /// Fetch one message, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when the queue stays empty for the whole wait.
    async fn fetch(&self, queue: &QueueName, timeout: Duration) -> BrokerResult<Option<Delivery>>;

    /// Acknowledge a fetched delivery
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;
}
