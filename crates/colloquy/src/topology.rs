//! Exchange and queue topology for a conversation
//!
//! A topology owns the one connection and channel a session uses, the direct
//! exchange, and the ordered list of routed queues (`queues[0]` carries
//! Node1→Node2, `queues[1]` carries Node2→Node1).

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, DeclareOptions, ExchangeKind},
    error::{ConversationError, ConversationResult},
    types::{ExchangeName, QueueName, Role, RoutingKey},
};

/// A queue bound to the conversation exchange under a routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedQueue {
    pub name: QueueName,
    pub routing_key: RoutingKey,
}

/// The queue pair one role uses within a round
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Where this role publishes
    pub outbound: &'a RoutedQueue,
    /// Where this role consumes
    pub inbound: &'a RoutedQueue,
}

/// Connection, channel, exchange and queues of one session
pub struct Topology<C: BrokerConnection> {
    connection: C,
    channel: C::Channel,
    exchange: ExchangeName,
    queues: Vec<RoutedQueue>,
}

impl<C: BrokerConnection> std::fmt::Debug for Topology<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("exchange", &self.exchange)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

fn check_pairs(queue_names: &[QueueName], routing_keys: &[RoutingKey]) -> ConversationResult<()> {
    if queue_names.len() != routing_keys.len() {
        return Err(ConversationError::Configuration(format!(
            "{} queue names but {} routing keys",
            queue_names.len(),
            routing_keys.len()
        )));
    }

    let mut seen = HashSet::new();
    if let Some(dup) = queue_names.iter().find(|name| !seen.insert(*name)) {
        return Err(ConversationError::Configuration(format!(
            "queue '{}' listed twice; each direction needs its own queue",
            dup
        )));
    }

    let mut seen = HashSet::new();
    if let Some(dup) = routing_keys.iter().find(|key| !seen.insert(*key)) {
        return Err(ConversationError::Configuration(format!(
            "routing key '{}' listed twice; each direction needs its own key",
            dup
        )));
    }

    Ok(())
}

impl<C: BrokerConnection> Topology<C> {
    /// Connect and declare the exchange plus one bound queue per pair
    ///
    /// The returned queue list keeps the input order. Connection failures
    /// surface as `ConversationError::Connectivity` and are not retried. If a
    /// declaration fails after connecting, the connection is closed before
    /// the error is returned.
    pub async fn open<B>(
        broker: &B,
        exchange: &ExchangeName,
        queue_names: &[QueueName],
        routing_keys: &[RoutingKey],
    ) -> ConversationResult<Self>
    where
        B: Broker<Connection = C>,
    {
        check_pairs(queue_names, routing_keys)?;

        let connection = broker
            .connect()
            .await
            .map_err(ConversationError::Connectivity)?;

        match Self::declare(&connection, exchange, queue_names, routing_keys).await {
            Ok((channel, queues)) => {
                debug!(%exchange, queues = queues.len(), "Topology ready");
                Ok(Self {
                    connection,
                    channel,
                    exchange: exchange.clone(),
                    queues,
                })
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after setup error");
                }
                Err(err)
            }
        }
    }

    async fn declare(
        connection: &C,
        exchange: &ExchangeName,
        queue_names: &[QueueName],
        routing_keys: &[RoutingKey],
    ) -> ConversationResult<(C::Channel, Vec<RoutedQueue>)> {
        let channel = connection
            .open_channel()
            .await
            .map_err(ConversationError::Connectivity)?;

        channel
            .declare_exchange(exchange, ExchangeKind::Direct, DeclareOptions::auto_delete())
            .await
            .map_err(ConversationError::Connectivity)?;

        let mut queues = Vec::with_capacity(queue_names.len());
        for (name, routing_key) in queue_names.iter().zip(routing_keys) {
            channel
                .declare_queue(name, DeclareOptions::auto_delete())
                .await
                .map_err(ConversationError::Connectivity)?;
            channel
                .bind_queue(name, exchange, routing_key)
                .await
                .map_err(ConversationError::Connectivity)?;

            debug!(queue = %name, %routing_key, "Declared and bound queue");
            queues.push(RoutedQueue {
                name: name.clone(),
                routing_key: routing_key.clone(),
            });
        }

        Ok((channel, queues))
    }

    /// The channel every round publishes and consumes on
    pub fn channel(&self) -> &C::Channel {
        &self.channel
    }

    /// The conversation exchange
    pub fn exchange(&self) -> &ExchangeName {
        &self.exchange
    }

    /// Queues in declaration order
    pub fn queues(&self) -> &[RoutedQueue] {
        &self.queues
    }

    /// Outbound and inbound queues for `role`
    pub fn route(&self, role: Role) -> ConversationResult<Route<'_>> {
        match (
            self.queues.get(role.outbound_index()),
            self.queues.get(role.inbound_index()),
        ) {
            (Some(outbound), Some(inbound)) => Ok(Route { outbound, inbound }),
            _ => Err(ConversationError::Configuration(format!(
                "a conversation needs two queues, topology has {}",
                self.queues.len()
            ))),
        }
    }

    /// Whether the underlying connection is still open
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Close the connection, releasing channel and queues
    pub async fn close(self) -> ConversationResult<()> {
        self.connection
            .close()
            .await
            .map_err(ConversationError::Transport)?;
        debug!(exchange = %self.exchange, "Topology closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;

    fn names(list: &[&str]) -> Vec<QueueName> {
        list.iter().map(|s| QueueName::new_unchecked(*s)).collect()
    }

    fn keys(list: &[&str]) -> Vec<RoutingKey> {
        list.iter().map(|s| RoutingKey::new_unchecked(*s)).collect()
    }

    fn exchange() -> ExchangeName {
        ExchangeName::new_unchecked("colloquy.direct")
    }

    #[tokio::test]
    async fn test_open_preserves_queue_order() {
        let broker = InMemoryBroker::new();
        let topology = Topology::open(
            &broker,
            &exchange(),
            &names(&["Queue1", "Queue2"]),
            &keys(&["Queue1", "Queue2"]),
        )
        .await
        .unwrap();

        let queues = topology.queues();
        assert_eq!(queues[0].name.as_str(), "Queue1");
        assert_eq!(queues[1].name.as_str(), "Queue2");
        assert_eq!(broker.binding_count(&exchange()).await, Some(2));

        let talker = topology.route(Role::Talker).unwrap();
        let listener = topology.route(Role::Listener).unwrap();
        assert_eq!(talker.outbound, listener.inbound);
        assert_eq!(talker.inbound, listener.outbound);

        topology.close().await.unwrap();
        assert!(!broker.exchange_exists(&exchange()).await);
    }

    #[tokio::test]
    async fn test_open_twice_with_same_names() {
        let broker = InMemoryBroker::new();
        let queue_names = names(&["Queue1", "Queue2"]);
        let routing_keys = keys(&["Queue1", "Queue2"]);

        let first = Topology::open(&broker, &exchange(), &queue_names, &routing_keys)
            .await
            .unwrap();
        let second = Topology::open(&broker, &exchange(), &queue_names, &routing_keys)
            .await
            .unwrap();

        assert_eq!(first.queues(), second.queues());
        assert_eq!(broker.open_connections().await, 2);

        first.close().await.unwrap();
        assert!(second.is_open());
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connectivity_error() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);

        let err = Topology::open(
            &broker,
            &exchange(),
            &names(&["Queue1", "Queue2"]),
            &keys(&["Queue1", "Queue2"]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConversationError::Connectivity(_)));
        assert_eq!(broker.stats().await.connections_opened, 0);
    }

    #[tokio::test]
    async fn test_mismatched_pairs_rejected_before_connecting() {
        let broker = InMemoryBroker::new();

        let err = Topology::open(
            &broker,
            &exchange(),
            &names(&["Queue1", "Queue2"]),
            &keys(&["Queue1"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConversationError::Configuration(_)));

        let err = Topology::open(
            &broker,
            &exchange(),
            &names(&["Queue1", "Queue2"]),
            &keys(&["Same", "Same"]),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("routing key 'Same'"));

        assert_eq!(broker.stats().await.connections_opened, 0);
    }

    #[tokio::test]
    async fn test_failed_declaration_closes_connection() {
        let broker = InMemoryBroker::new();

        // A durable Queue1 makes the auto-delete redeclaration fail
        let conn = broker.connect().await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueName::new_unchecked("Queue1"), DeclareOptions::default())
            .await
            .unwrap();

        let err = Topology::open(
            &broker,
            &exchange(),
            &names(&["Queue1", "Queue2"]),
            &keys(&["Queue1", "Queue2"]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConversationError::Connectivity(_)));
        assert_eq!(broker.open_connections().await, 1);
        assert_eq!(broker.stats().await.close_calls, 1);
    }

    #[tokio::test]
    async fn test_route_requires_two_queues() {
        let broker = InMemoryBroker::new();
        let topology = Topology::open(&broker, &exchange(), &names(&["Solo"]), &keys(&["Solo"]))
            .await
            .unwrap();

        assert!(matches!(
            topology.route(Role::Talker),
            Err(ConversationError::Configuration(_))
        ));
        topology.close().await.unwrap();
    }
}
