//! Retry policy for the await phase of a round
//!
//! A [`RetryPolicy`] bounds how long a role keeps polling its inbound queue.
//! The default policy never gives up: it polls with a 5 s fetch timeout and
//! sleeps a fixed 500 ms between empty polls.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration;
use crate::error::{ConversationError, ConversationResult};

/// Delay schedule between empty polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every empty poll
    Fixed {
        #[serde(with = "duration")]
        delay: Duration,
    },
    /// Delay grows by `multiplier` after each empty poll, capped at `max`
    Exponential {
        #[serde(with = "duration")]
        initial: Duration,
        #[serde(with = "duration")]
        max: Duration,
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed {
            delay: Duration::from_millis(500),
        }
    }
}

impl Backoff {
    /// Delay to sleep after the `attempt`-th empty poll (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs.max(0.0))
                } else {
                    max
                }
            }
        }
    }

    fn validate(&self) -> ConversationResult<()> {
        if let Backoff::Exponential {
            initial,
            max,
            multiplier,
        } = self
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ConversationError::Configuration(format!(
                    "backoff multiplier must be a finite number >= 1.0, got {}",
                    multiplier
                )));
            }
            if initial > max {
                return Err(ConversationError::Configuration(format!(
                    "backoff initial delay {:?} exceeds max {:?}",
                    initial, max
                )));
            }
        }
        Ok(())
    }
}

/// Limits and pacing for polling an inbound queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up after this many consume attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Give up once the round has run this long
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
    /// How long a single fetch waits for a message
    #[serde(with = "duration")]
    pub fetch_timeout: Duration,
    /// Sleep schedule between empty polls
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            deadline: None,
            fetch_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Unbounded policy with the default pacing
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of consume attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Cap the time spent waiting in one round
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the backoff schedule
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Whether the policy can ever give up
    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.deadline.is_some()
    }

    /// Reject settings that could never allow a single attempt
    pub fn validate(&self) -> ConversationResult<()> {
        if self.max_attempts == Some(0) {
            return Err(ConversationError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(ConversationError::Configuration(
                "retry deadline must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }

    /// Start tracking one round; the deadline clock starts now
    pub fn start(&self) -> RetryState<'_> {
        RetryState {
            policy: self,
            started: Instant::now(),
            attempts: 0,
        }
    }
}

/// Why a retry loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// `max_attempts` consume attempts all came back empty
    Attempts(u32),
    /// The round-level deadline passed
    Deadline(Duration),
}

/// Progress of one round against its policy
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    started: Instant,
    attempts: u32,
}

impl RetryState<'_> {
    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn remaining(&self) -> Option<Duration> {
        self.policy
            .deadline
            .map(|deadline| deadline.saturating_sub(self.started.elapsed()))
    }

    fn check(&self) -> Result<(), Exhaustion> {
        if matches!(self.policy.max_attempts, Some(max) if self.attempts >= max) {
            return Err(Exhaustion::Attempts(self.attempts));
        }
        match (self.policy.deadline, self.remaining()) {
            (Some(deadline), Some(remaining)) if remaining.is_zero() => {
                Err(Exhaustion::Deadline(deadline))
            }
            _ => Ok(()),
        }
    }

    /// Claim the next attempt number
    pub fn begin_attempt(&mut self) -> Result<u32, Exhaustion> {
        self.check()?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Fetch timeout for the current attempt, clipped to the deadline
    pub fn fetch_timeout(&self) -> Duration {
        match self.remaining() {
            Some(remaining) => self.policy.fetch_timeout.min(remaining),
            None => self.policy.fetch_timeout,
        }
    }

    /// Backoff to sleep after an empty poll, or why polling should stop
    pub fn after_empty(&self) -> Result<Duration, Exhaustion> {
        self.check()?;
        let delay = self.policy.backoff.delay_for(self.attempts);
        Ok(match self.remaining() {
            Some(remaining) => delay.min(remaining),
            None => delay,
        })
    }
}
