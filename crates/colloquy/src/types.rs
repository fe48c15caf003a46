//! Core type definitions for conversation topology

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConversationError;

/// Error type for broker name validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The name is empty
    Empty,
    /// The name contains only whitespace
    WhitespaceOnly,
    /// The name has leading or trailing whitespace
    LeadingTrailingWhitespace,
    /// The name contains invalid characters
    InvalidCharacters,
    /// The name is longer than AMQP short strings allow
    TooLong(usize),
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::WhitespaceOnly => write!(f, "name cannot be whitespace-only"),
            Self::LeadingTrailingWhitespace => {
                write!(f, "name cannot have leading or trailing whitespace")
            }
            Self::InvalidCharacters => write!(
                f,
                "name can only contain alphanumeric characters, hyphens, underscores, dots and colons"
            ),
            Self::TooLong(len) => write!(f, "name is {len} bytes long (limit: 255)"),
        }
    }
}

impl std::error::Error for IdValidationError {}

/// Longest name an AMQP short string can carry
const MAX_NAME_LEN: usize = 255;

fn validate_name(s: &str) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }

    if s.trim().is_empty() {
        return Err(IdValidationError::WhitespaceOnly);
    }

    if s != s.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }

    if s.len() > MAX_NAME_LEN {
        return Err(IdValidationError::TooLong(s.len()));
    }

    if !s
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(IdValidationError::InvalidCharacters);
    }

    Ok(())
}

macro_rules! broker_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate a name
            pub fn parse(name: impl AsRef<str>) -> Result<Self, IdValidationError> {
                let s = name.as_ref();
                validate_name(s)?;
                Ok(Self(s.to_string()))
            }

            /// Create a name without validation (for literals known to be valid)
            pub fn new_unchecked(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Get the name as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate_name(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> Self {
                name.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

broker_name!(
    /// Name of a broker queue
    QueueName
);

broker_name!(
    /// Routing key used to match publishes to queue bindings
    RoutingKey
);

broker_name!(
    /// Name of a broker exchange
    ExchangeName
);

/// Which side of the conversation a process plays
///
/// The Talker opens every round by publishing and then waits for the reply;
/// the Listener waits for a message and then replies. The role also fixes
/// which queue of the topology is outbound and which is inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Talker,
    Listener,
}

impl Role {
    /// Node label used in console output
    pub fn node(&self) -> &'static str {
        match self {
            Role::Talker => "Node1",
            Role::Listener => "Node2",
        }
    }

    /// The role on the other end of the conversation
    pub fn peer(&self) -> Role {
        match self {
            Role::Talker => Role::Listener,
            Role::Listener => Role::Talker,
        }
    }

    /// Whether this role publishes before consuming within a round
    pub fn speaks_first(&self) -> bool {
        matches!(self, Role::Talker)
    }

    /// Index of the queue this role publishes to (`0` is Node1→Node2)
    pub fn outbound_index(&self) -> usize {
        match self {
            Role::Talker => 0,
            Role::Listener => 1,
        }
    }

    /// Index of the queue this role consumes from
    pub fn inbound_index(&self) -> usize {
        match self {
            Role::Talker => 1,
            Role::Listener => 0,
        }
    }
}

impl FromStr for Role {
    type Err = ConversationError;

    /// Accepts `talker`/`start` and `listener`/`listen`, case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "talker" | "start" => Ok(Role::Talker),
            "listener" | "listen" => Ok(Role::Listener),
            _ => Err(ConversationError::Configuration(format!(
                "unknown role '{s}', options are 'start' (talker) or 'listen' (listener)"
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Talker => write!(f, "Talker"),
            Role::Listener => write!(f, "Listener"),
        }
    }
}
