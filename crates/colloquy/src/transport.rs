//! Publish and consume primitives used by every round

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{trace, warn};

use crate::{
    broker::{BrokerChannel, PublishOutcome},
    error::{BrokerError, ConversationError, ConversationResult},
    types::{ExchangeName, QueueName, RoutingKey},
};

/// How a broker's negative publish acknowledgement is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishConfirmPolicy {
    /// Any non-error publish counts as accepted; NACKs are only logged
    #[default]
    Permissive,
    /// A NACK fails the round with `ConversationError::PublishRejected`
    Strict,
}

impl PublishConfirmPolicy {
    /// Apply the policy to a publish outcome
    pub fn check(
        &self,
        outcome: PublishOutcome,
        routing_key: &RoutingKey,
    ) -> ConversationResult<()> {
        if !outcome.is_nack() {
            return Ok(());
        }

        match self {
            PublishConfirmPolicy::Permissive => {
                warn!(%routing_key, "Broker nacked publish; continuing");
                Ok(())
            }
            PublishConfirmPolicy::Strict => Err(ConversationError::PublishRejected {
                routing_key: routing_key.to_string(),
            }),
        }
    }
}

/// Publish `messages[index]` to `routing_key` through `exchange`
///
/// Returns the broker's verdict together with the line that went out.
///
/// # Errors
///
/// `Configuration` if `index` is out of range, `Transport` if the channel
/// or connection fails.
pub async fn publish<'m, Ch>(
    channel: &Ch,
    exchange: &ExchangeName,
    routing_key: &RoutingKey,
    messages: &'m [String],
    index: usize,
) -> ConversationResult<(PublishOutcome, &'m str)>
where
    Ch: BrokerChannel + ?Sized,
{
    let message = messages.get(index).ok_or_else(|| {
        ConversationError::Configuration(format!(
            "no message for round {} (sequence has {})",
            index,
            messages.len()
        ))
    })?;

    let outcome = channel
        .publish(exchange, routing_key, message.as_bytes())
        .await
        .map_err(ConversationError::Transport)?;

    trace!(%exchange, %routing_key, index, ?outcome, "Published");
    Ok((outcome, message.as_str()))
}

/// Fetch one message from `queue`, waiting at most `timeout`
///
/// A received message is acknowledged before it is returned. An empty queue
/// yields `Ok(None)`; only broker failures and undecodable bodies are errors.
pub async fn try_consume<Ch>(
    channel: &Ch,
    queue: &QueueName,
    timeout: Duration,
) -> ConversationResult<Option<String>>
where
    Ch: BrokerChannel + ?Sized,
{
    let Some(delivery) = channel
        .fetch(queue, timeout)
        .await
        .map_err(ConversationError::Transport)?
    else {
        trace!(%queue, ?timeout, "Queue empty");
        return Ok(None);
    };

    channel
        .ack(delivery.delivery_tag)
        .await
        .map_err(ConversationError::Transport)?;

    let text = String::from_utf8(delivery.body).map_err(|e| {
        ConversationError::Transport(BrokerError::InvalidPayload(format!(
            "message on '{}' is not UTF-8: {}",
            queue, e
        )))
    })?;

    trace!(%queue, redelivered = delivery.redelivered, "Consumed");
    Ok(Some(text))
}
