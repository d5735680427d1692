//! Per-connection subscription tables.
//!
//! There is one [`SubscriptionManager`] per [`SubscriptionClass`]. A
//! connection has at most one entry per class. For the explicit class the
//! entry holds the machines to push; the other classes compute their machines
//! from the connection's account on every broadcast.

use crate::protocol::ServerMessage;
use crate::store::Account;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionClass {
    /// A list of machines chosen by the connection.
    Explicit,
    /// Every machine visible to the connection's account.
    Visible,
    /// Every machine owned by the connection's account.
    Owned,
}

impl SubscriptionClass {
    pub const ALL: [SubscriptionClass; 3] = [
        SubscriptionClass::Explicit,
        SubscriptionClass::Visible,
        SubscriptionClass::Owned,
    ];

    /// Whether entries are keyed by connection alone.
    pub fn is_class_keyed(self) -> bool {
        self != SubscriptionClass::Explicit
    }
}

/// Outbound half of a live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    account: Account,
    sender: mpsc::Sender<ServerMessage>,
}

impl Connection {
    pub fn new(account: Account, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account,
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queues a message without waiting. Fails when the receiver is gone or
    /// its buffer is full.
    pub fn push(&self, message: ServerMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub connection: Connection,
    pub resources: BTreeSet<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    class: SubscriptionClass,
    entries: Arc<Mutex<HashMap<ConnectionId, Subscription>>>,
}

impl SubscriptionManager {
    pub fn new(class: SubscriptionClass) -> Self {
        Self {
            class,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn class(&self) -> SubscriptionClass {
        self.class
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Subscription>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `resources` to the connection's set, creating the entry if
    /// needed. The connection handle is refreshed.
    pub fn subscribe(&self, connection: &Connection, resources: impl IntoIterator<Item = Uuid>) {
        let mut entries = self.lock();
        let entry = entries.entry(connection.id()).or_insert_with(|| Subscription {
            connection: connection.clone(),
            resources: BTreeSet::new(),
        });
        entry.connection = connection.clone();
        entry.resources.extend(resources);
        if entry.resources.is_empty() && !self.class.is_class_keyed() {
            entries.remove(&connection.id());
        }
    }

    /// Removes `resources`; an explicit entry left empty is dropped.
    pub fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        resources: impl IntoIterator<Item = Uuid>,
    ) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&connection_id) {
            for resource in resources {
                entry.resources.remove(&resource);
            }
            if entry.resources.is_empty() && !self.class.is_class_keyed() {
                entries.remove(&connection_id);
            }
        }
    }

    /// Replaces the connection's set; an empty set removes the entry for the
    /// explicit class.
    pub fn replace_all(&self, connection: &Connection, resources: impl IntoIterator<Item = Uuid>) {
        let resources: BTreeSet<Uuid> = resources.into_iter().collect();
        let mut entries = self.lock();
        if resources.is_empty() && !self.class.is_class_keyed() {
            entries.remove(&connection.id());
            return;
        }
        entries.insert(
            connection.id(),
            Subscription {
                connection: connection.clone(),
                resources,
            },
        );
    }

    /// Registers a connection for a class-keyed subscription.
    pub fn register(&self, connection: &Connection) {
        self.lock().insert(
            connection.id(),
            Subscription {
                connection: connection.clone(),
                resources: BTreeSet::new(),
            },
        );
    }

    /// Returns whether the connection had an entry.
    pub fn unsubscribe_all(&self, connection_id: ConnectionId) -> bool {
        self.lock().remove(&connection_id).is_some()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.lock().contains_key(&connection_id)
    }

    pub fn resources(&self, connection_id: ConnectionId) -> Option<BTreeSet<Uuid>> {
        self.lock()
            .get(&connection_id)
            .map(|entry| entry.resources.clone())
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// The three managers, one per class.
#[derive(Debug, Clone)]
pub struct SubscriptionTables {
    pub explicit: SubscriptionManager,
    pub visible: SubscriptionManager,
    pub owned: SubscriptionManager,
}

impl Default for SubscriptionTables {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTables {
    pub fn new() -> Self {
        Self {
            explicit: SubscriptionManager::new(SubscriptionClass::Explicit),
            visible: SubscriptionManager::new(SubscriptionClass::Visible),
            owned: SubscriptionManager::new(SubscriptionClass::Owned),
        }
    }

    pub fn get(&self, class: SubscriptionClass) -> &SubscriptionManager {
        match class {
            SubscriptionClass::Explicit => &self.explicit,
            SubscriptionClass::Visible => &self.visible,
            SubscriptionClass::Owned => &self.owned,
        }
    }

    /// Drops the connection from every class.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        for class in SubscriptionClass::ALL {
            self.get(class).unsubscribe_all(connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (Connection::new(Account::client("alice"), tx), rx)
    }

    #[test]
    fn explicit_entry_is_dropped_when_emptied() {
        let manager = SubscriptionManager::new(SubscriptionClass::Explicit);
        let (conn, _rx) = connection();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        manager.subscribe(&conn, [a, b]);
        manager.unsubscribe(conn.id(), [a]);
        assert_eq!(manager.resources(conn.id()), Some(BTreeSet::from([b])));

        manager.unsubscribe(conn.id(), [b]);
        assert!(!manager.contains(conn.id()));
    }

    #[test]
    fn replace_all_replaces_instead_of_merging() {
        let manager = SubscriptionManager::new(SubscriptionClass::Explicit);
        let (conn, _rx) = connection();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        manager.subscribe(&conn, [a]);
        manager.replace_all(&conn, [b]);
        assert_eq!(manager.resources(conn.id()), Some(BTreeSet::from([b])));

        manager.replace_all(&conn, Vec::new());
        assert!(manager.is_empty());
    }

    #[test]
    fn class_keyed_entries_survive_without_resources() {
        let manager = SubscriptionManager::new(SubscriptionClass::Owned);
        let (conn, _rx) = connection();

        manager.register(&conn);
        manager.register(&conn);

        assert_eq!(manager.len(), 1);
        assert!(manager.unsubscribe_all(conn.id()));
        assert!(!manager.unsubscribe_all(conn.id()));
    }

    #[test]
    fn push_fails_once_receiver_is_dropped() {
        let (conn, rx) = connection();
        assert!(conn.push(ServerMessage::reject("x")));

        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.push(ServerMessage::reject("y")));
    }

    #[test]
    fn disconnect_clears_every_class() {
        let tables = SubscriptionTables::new();
        let (conn, _rx) = connection();

        tables.explicit.subscribe(&conn, [Uuid::new_v4()]);
        tables.visible.register(&conn);
        tables.owned.register(&conn);
        tables.disconnect(conn.id());

        for class in SubscriptionClass::ALL {
            assert!(tables.get(class).is_empty());
        }
    }
}
