//! One conversational round for either role
//!
//! The Talker runs `Sending → AwaitingReply → Done`, the Listener
//! `AwaitingMessage → Replying → Done`. Both walk the same state machine; the
//! role only picks the starting state. A round returns its exchange log in
//! chronological order: `[sent, received]` for the Talker and
//! `[received, sent]` for the Listener.

use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    broker::BrokerChannel,
    error::{ConversationError, ConversationResult},
    retry::{Exhaustion, RetryPolicy, RetryState},
    scheduler::{Scheduler, TaskContext},
    stats::StatsCollector,
    topology::Route,
    transport::{self, PublishConfirmPolicy},
    types::{ExchangeName, Role},
};

/// Messages one round produced, in the order they happened
pub type ExchangeLog = Vec<String>;

/// Where a round currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Talker publishes its line
    Sending,
    /// Talker polls for the Listener's reply
    AwaitingReply,
    /// Listener polls for the Talker's line
    AwaitingMessage,
    /// Listener publishes its reply
    Replying,
    Done,
}

impl RoundState {
    /// Starting state for `role`
    pub fn initial(role: Role) -> Self {
        if role.speaks_first() {
            RoundState::Sending
        } else {
            RoundState::AwaitingMessage
        }
    }

    /// State after this one completes
    pub fn next(self) -> Self {
        match self {
            RoundState::Sending => RoundState::AwaitingReply,
            RoundState::AwaitingMessage => RoundState::Replying,
            RoundState::AwaitingReply | RoundState::Replying | RoundState::Done => {
                RoundState::Done
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        self == RoundState::Done
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Sending => "sending",
            RoundState::AwaitingReply => "awaiting_reply",
            RoundState::AwaitingMessage => "awaiting_message",
            RoundState::Replying => "replying",
            RoundState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Policies and shared collaborators a coordinator runs with
#[derive(Debug, Clone, Copy)]
pub struct RoundSettings<'a> {
    pub retry: &'a RetryPolicy,
    pub confirm: PublishConfirmPolicy,
    pub scheduler: &'a Scheduler,
    pub stats: &'a StatsCollector,
}

/// Drives a single round for one role
pub struct RoundCoordinator<'a, Ch: BrokerChannel> {
    role: Role,
    channel: &'a Ch,
    exchange: &'a ExchangeName,
    route: Route<'a>,
    settings: RoundSettings<'a>,
}

impl<'a, Ch: BrokerChannel> RoundCoordinator<'a, Ch> {
    pub fn new(
        role: Role,
        channel: &'a Ch,
        exchange: &'a ExchangeName,
        route: Route<'a>,
        settings: RoundSettings<'a>,
    ) -> Self {
        Self {
            role,
            channel,
            exchange,
            route,
            settings,
        }
    }

    /// Run round `round`, speaking `messages[round]`
    ///
    /// # Errors
    ///
    /// `Configuration` if `messages` has no entry for `round`, `Transport`
    /// on broker failure, `PublishRejected` under a strict confirm policy,
    /// and `RetryExhausted` or `DeadlineExceeded` when the retry policy
    /// gives up waiting.
    pub async fn run(&self, round: usize, messages: &[String]) -> ConversationResult<ExchangeLog> {
        let started = Instant::now();
        let mut retry = self.settings.retry.start();
        let mut log = ExchangeLog::with_capacity(2);
        let mut state = RoundState::initial(self.role);

        while !state.is_terminal() {
            debug!(role = %self.role, round, %state, "Round state");

            match state {
                RoundState::Sending | RoundState::Replying => {
                    log.push(self.send(round, messages).await?);
                }
                RoundState::AwaitingReply | RoundState::AwaitingMessage => {
                    log.push(self.await_message(round, &mut retry).await?);
                }
                RoundState::Done => {}
            }

            state = state.next();
        }

        debug!(role = %self.role, round, %state, "Round state");
        self.settings.stats.record_round(started.elapsed()).await;
        Ok(log)
    }

    async fn send(&self, round: usize, messages: &[String]) -> ConversationResult<String> {
        let routing_key = &self.route.outbound.routing_key;
        let (outcome, message) =
            transport::publish(self.channel, self.exchange, routing_key, messages, round).await?;

        self.settings.stats.record_publish().await;
        if outcome.is_nack() {
            self.settings.stats.record_publish_nack().await;
        }
        self.settings.confirm.check(outcome, routing_key)?;

        info!(role = %self.role, round, %routing_key, message = %message, "Sent");
        Ok(message.to_string())
    }

    async fn await_message(
        &self,
        round: usize,
        retry: &mut RetryState<'_>,
    ) -> ConversationResult<String> {
        let queue = &self.route.inbound.name;

        loop {
            let attempt = retry
                .begin_attempt()
                .map_err(|reason| self.exhausted(round, reason))?;
            let timeout = retry.fetch_timeout();

            let received = self
                .settings
                .scheduler
                .pair(
                    transport::try_consume(self.channel, queue, timeout),
                    TaskContext::attempt(self.role, round, attempt),
                )
                .await?;
            self.settings.stats.record_fetch(received.is_some()).await;

            if let Some(message) = received {
                info!(role = %self.role, round, %queue, attempt, message = %message, "Received");
                return Ok(message);
            }

            let backoff = retry
                .after_empty()
                .map_err(|reason| self.exhausted(round, reason))?;
            debug!(role = %self.role, round, attempt, ?backoff, "Nothing yet; backing off");
            tokio::time::sleep(backoff).await;
        }
    }

    fn exhausted(&self, round: usize, reason: Exhaustion) -> ConversationError {
        match reason {
            Exhaustion::Attempts(attempts) => ConversationError::RetryExhausted {
                role: self.role,
                round,
                attempts,
            },
            Exhaustion::Deadline(deadline) => ConversationError::DeadlineExceeded {
                role: self.role,
                round,
                deadline,
            },
        }
    }
}
