//! Subscription protocol spoken over persistent connections.
//!
//! Messages are JSON objects tagged by `type`.

use crate::state::MachineState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    /// Adds machines to the connection's explicit list.
    Subscribe { resources: Vec<Uuid>, credential: String },
    Unsubscribe { resources: Vec<Uuid> },
    /// Replaces the explicit list.
    Replace { resources: Vec<Uuid>, credential: String },
    /// Every machine the credential can see.
    SubscribeAll { credential: String },
    /// Every machine the credential owns.
    SubscribeOwned { credential: String },
    /// Drops every subscription of the connection.
    UnsubscribeAll,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Subscribe { .. } => "SUBSCRIBE",
            ClientCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            ClientCommand::Replace { .. } => "REPLACE",
            ClientCommand::SubscribeAll { .. } => "SUBSCRIBE_ALL",
            ClientCommand::SubscribeOwned { .. } => "SUBSCRIBE_OWNED",
            ClientCommand::UnsubscribeAll => "UNSUBSCRIBE_ALL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Acknowledge { command: String },
    Reject { reason: String },
    Data { states: BTreeMap<Uuid, MachineState> },
}

impl ServerMessage {
    pub fn acknowledge(command: &ClientCommand) -> Self {
        ServerMessage::Acknowledge {
            command: command.name().to_string(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        ServerMessage::Reject { reason: reason.into() }
    }
}
