//! # Colloquy
//!
//! Round-based conversation between two peers over a message broker.
//!
//! A Talker (Node1) and a Listener (Node2) share a direct exchange with two
//! routed queues, one per direction. In each round the Talker publishes a
//! line and waits for the reply; the Listener waits for the line and then
//! replies. Waiting is a poll loop governed by a [`RetryPolicy`], and every
//! poll runs side by side with a [`BackgroundTask`].
//!
//! ## Features
//!
//! - **Broker traits**: [`Broker`], [`BrokerConnection`] and [`BrokerChannel`]
//!   abstract the connection, with an in-process [`InMemoryBroker`] and an
//!   AMQP backend behind the `amqp` feature
//! - **Retry policy**: attempt limits, round deadlines and fixed or
//!   exponential backoff
//! - **Background pairing**: failures and panics in background work never
//!   fail a round
//! - **Observability**: structured `tracing` events and per-session stats
//!
//! ## Example
//!
//! ```rust,no_run
//! use colloquy::{ConversationConfig, InMemoryBroker, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = InMemoryBroker::new();
//!     let config = ConversationConfig::default();
//!
//!     let mut talker = Session::new(broker.clone(), config.clone());
//!     let mut listener = Session::new(broker, config);
//!
//!     let (talked, listened) = tokio::join!(talker.run("start"), listener.run("listen"));
//!     for log in talked?.logs.iter().chain(listened?.logs.iter()) {
//!         println!("{:?}", log);
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod topology;
pub mod transport;
pub mod types;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{
    Broker, BrokerChannel, BrokerConnection, DeclareOptions, Delivery, ExchangeKind,
    PublishOutcome,
};
pub use config::ConversationConfig;
pub use coordinator::{ExchangeLog, RoundCoordinator, RoundSettings, RoundState};
pub use error::{BrokerError, BrokerResult, ConversationError, ConversationResult};
pub use memory::{BrokerStats, InMemoryBroker, PublishRecord};
pub use retry::{Backoff, Exhaustion, RetryPolicy, RetryState};
pub use scheduler::{BackgroundTask, Heartbeat, Idle, Scheduler, TaskContext, TaskError};
pub use session::{RoundObserver, Session, SessionReport};
pub use stats::{RoundLatency, SessionStats, StatsCollector};
pub use topology::{Route, RoutedQueue, Topology};
pub use transport::{PublishConfirmPolicy, publish, try_consume};
pub use types::{ExchangeName, IdValidationError, QueueName, Role, RoutingKey};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
