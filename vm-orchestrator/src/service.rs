//! Applies subscription commands received on a connection.

use crate::error::{OrchestratorError, Result};
use crate::protocol::{ClientCommand, ServerMessage};
use crate::store::{Account, MachineStore};
use crate::subscription::{Connection, ConnectionId, SubscriptionTables};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Checks the credential carried by a command against the account the
/// connection was authenticated as when it was opened.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, account: &Account, credential: &str) -> Result<()>;
}

/// Accepts a `"<kind>:<id>"` credential only when it names the connection's
/// own account. A frame can never switch a connection to another account.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionAccountVerifier;

impl CredentialVerifier for SessionAccountVerifier {
    fn verify(&self, account: &Account, credential: &str) -> Result<()> {
        let claimed: Account = credential.parse()?;
        if &claimed != account {
            return Err(OrchestratorError::Forbidden(format!(
                "credential {} does not match connection account {}",
                claimed, account
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    tables: SubscriptionTables,
    store: MachineStore,
    verifier: Arc<dyn CredentialVerifier>,
}

impl SubscriptionService {
    pub fn new(
        tables: SubscriptionTables,
        store: MachineStore,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            tables,
            store,
            verifier,
        }
    }

    pub fn tables(&self) -> &SubscriptionTables {
        &self.tables
    }

    async fn authorize(
        &self,
        connection: &Connection,
        credential: &str,
        resources: &[Uuid],
    ) -> Result<()> {
        let account = connection.account();
        self.verifier.verify(account, credential)?;
        for &resource in resources {
            if !self.store.can_view(account, resource).await? {
                return Err(OrchestratorError::NotFound(resource.to_string()));
            }
        }
        Ok(())
    }

    async fn apply(&self, connection: &Connection, command: &ClientCommand) -> Result<()> {
        match command {
            ClientCommand::Subscribe { resources, credential } => {
                self.authorize(connection, credential, resources).await?;
                self.tables.explicit.subscribe(connection, resources.iter().copied());
            }
            ClientCommand::Unsubscribe { resources } => {
                self.tables.explicit.unsubscribe(connection.id(), resources.iter().copied());
            }
            ClientCommand::Replace { resources, credential } => {
                self.authorize(connection, credential, resources).await?;
                self.tables.explicit.replace_all(connection, resources.iter().copied());
            }
            ClientCommand::SubscribeAll { credential } => {
                self.authorize(connection, credential, &[]).await?;
                self.tables.visible.register(connection);
            }
            ClientCommand::SubscribeOwned { credential } => {
                self.authorize(connection, credential, &[]).await?;
                self.tables.owned.register(connection);
            }
            ClientCommand::UnsubscribeAll => self.tables.disconnect(connection.id()),
        }
        Ok(())
    }

    /// Applies `command` and returns the reply for the connection.
    pub async fn handle(&self, connection: &Connection, command: ClientCommand) -> ServerMessage {
        match self.apply(connection, &command).await {
            Ok(()) => {
                debug!(connection = %connection.id(), command = command.name(), "Command applied");
                ServerMessage::acknowledge(&command)
            }
            Err(e) => {
                debug!(
                    connection = %connection.id(),
                    command = command.name(),
                    error = %e,
                    "Command rejected"
                );
                ServerMessage::reject(e.to_string())
            }
        }
    }

    /// Disconnect hook: forgets the connection everywhere.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.tables.disconnect(connection_id);
    }
}
