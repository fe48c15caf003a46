//! Session driver: a whole conversation for one role
//!
//! A session validates its configuration, opens the topology, runs every
//! round in order and closes the connection exactly once, whether the rounds
//! finished or one of them failed.

use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::{
    broker::Broker,
    config::ConversationConfig,
    coordinator::{ExchangeLog, RoundCoordinator, RoundSettings},
    error::ConversationResult,
    scheduler::{BackgroundTask, Heartbeat, Scheduler, TaskContext},
    stats::{SessionStats, StatsCollector},
    topology::Topology,
    types::Role,
};

/// Callback invoked with each round's log as soon as the round completes
pub type RoundObserver = Box<dyn FnMut(usize, &ExchangeLog) + Send>;

/// Outcome of a completed session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub role: Role,
    /// One log per round, in round order
    pub logs: Vec<ExchangeLog>,
    pub stats: SessionStats,
}

impl SessionReport {
    /// Rounds that completed
    pub fn rounds(&self) -> usize {
        self.logs.len()
    }
}

/// Runs a conversation for one role against a broker
pub struct Session<B: Broker> {
    broker: B,
    config: ConversationConfig,
    round_task: Arc<dyn BackgroundTask>,
    attempt_task: Arc<dyn BackgroundTask>,
    observer: Option<RoundObserver>,
}

impl<B: Broker> Session<B> {
    /// Create a session; both background slots default to [`Heartbeat`]
    pub fn new(broker: B, config: ConversationConfig) -> Self {
        Self {
            broker,
            config,
            round_task: Arc::new(Heartbeat),
            attempt_task: Arc::new(Heartbeat),
            observer: None,
        }
    }

    /// Use `task` both per round and per consume attempt
    pub fn with_background_task(mut self, task: Arc<dyn BackgroundTask>) -> Self {
        self.round_task = Arc::clone(&task);
        self.attempt_task = task;
        self
    }

    /// Task paired with each round as a whole
    pub fn with_round_task(mut self, task: Arc<dyn BackgroundTask>) -> Self {
        self.round_task = task;
        self
    }

    /// Task paired with each consume attempt
    pub fn with_attempt_task(mut self, task: Arc<dyn BackgroundTask>) -> Self {
        self.attempt_task = task;
        self
    }

    /// Register a callback for completed rounds
    pub fn on_round<F>(mut self, observer: F) -> Self
    where
        F: FnMut(usize, &ExchangeLog) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Run the conversation for a role given by name
    ///
    /// Accepts `talker`/`start` and `listener`/`listen`, case-insensitively.
    /// An unknown name is a configuration error and nothing is opened.
    pub async fn run(&mut self, role: &str) -> ConversationResult<SessionReport> {
        let role: Role = role.parse()?;
        self.run_as(role).await
    }

    /// Run the conversation as `role`
    pub async fn run_as(&mut self, role: Role) -> ConversationResult<SessionReport> {
        self.config.validate()?;

        let session_id = Uuid::new_v4();
        let span = info_span!("session", %session_id, %role, node = role.node());
        self.drive(session_id, role).instrument(span).await
    }

    async fn drive(&mut self, session_id: Uuid, role: Role) -> ConversationResult<SessionReport> {
        let stats = StatsCollector::default();
        stats.record_started().await;

        let topology = Topology::open(
            &self.broker,
            &self.config.exchange,
            &self.config.queues,
            &self.config.routing_keys,
        )
        .await?;
        info!(
            exchange = %topology.exchange(),
            rounds = self.config.rounds(),
            "Starting conversation"
        );

        let outcome = self.converse(&topology, role, &stats).await;

        info!("Closing connection");
        let closed = topology.close().await;
        stats.record_finished().await;

        let logs = match (outcome, closed) {
            (Ok(logs), Ok(())) => logs,
            (Ok(_), Err(close_err)) => return Err(close_err),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "Close failed after an aborted round");
                return Err(err);
            }
        };

        let stats = stats.snapshot().await;
        info!(
            rounds = stats.rounds_completed,
            empty_polls = stats.empty_polls,
            background_failures = stats.background_failures,
            "Conversation finished"
        );

        Ok(SessionReport {
            session_id,
            role,
            logs,
            stats,
        })
    }

    async fn converse(
        &mut self,
        topology: &Topology<B::Connection>,
        role: Role,
        stats: &StatsCollector,
    ) -> ConversationResult<Vec<ExchangeLog>> {
        let route = topology.route(role)?;
        let round_scheduler = Scheduler::new(Arc::clone(&self.round_task), stats.clone());
        let attempt_scheduler = Scheduler::new(Arc::clone(&self.attempt_task), stats.clone());
        let settings = RoundSettings {
            retry: &self.config.retry,
            confirm: self.config.publish_confirm,
            scheduler: &attempt_scheduler,
            stats,
        };

        let messages = self.config.messages_for(role);
        let rounds = self.config.rounds();
        let mut logs = Vec::with_capacity(rounds);

        for round in 0..rounds {
            let coordinator = RoundCoordinator::new(
                role,
                topology.channel(),
                topology.exchange(),
                route,
                settings,
            );
            let log = round_scheduler
                .pair(
                    coordinator.run(round, messages),
                    TaskContext::round(role, round),
                )
                .await?;

            if let Some(observer) = self.observer.as_mut() {
                observer(round, &log);
            }
            logs.push(log);

            if round + 1 < rounds && !self.config.response_delay.is_zero() {
                tokio::time::sleep(self.config.response_delay).await;
            }
        }

        Ok(logs)
    }
}
