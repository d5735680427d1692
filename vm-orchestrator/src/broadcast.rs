//! Periodic push of machine state to subscribed connections.

use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::state::StateReader;
use crate::store::MachineStore;
use crate::subscription::{Subscription, SubscriptionClass, SubscriptionManager};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub pruned: usize,
    pub machines_read: usize,
}

/// Broadcast loop for one subscription class.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    manager: SubscriptionManager,
    reader: StateReader,
    store: MachineStore,
}

impl Broadcaster {
    pub fn new(manager: SubscriptionManager, reader: StateReader) -> Self {
        let store = reader.store().clone();
        Self { manager, reader, store }
    }

    pub fn class(&self) -> SubscriptionClass {
        self.manager.class()
    }

    async fn resources_of(&self, subscription: &Subscription) -> Result<BTreeSet<Uuid>> {
        let account = subscription.connection.account();
        let machines = match self.manager.class() {
            SubscriptionClass::Explicit => return Ok(subscription.resources.clone()),
            SubscriptionClass::Visible => self.store.visible_machines(account).await?,
            SubscriptionClass::Owned => self.store.owned_machines(account).await?,
        };
        Ok(machines.into_iter().collect())
    }

    /// One pass: prune closed connections, read every subscribed machine once
    /// and push a `DATA` message to each remaining connection.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut targets = Vec::new();

        for subscription in self.manager.snapshot() {
            let connection_id = subscription.connection.id();
            if subscription.connection.is_closed() {
                self.manager.unsubscribe_all(connection_id);
                report.pruned += 1;
                continue;
            }
            match self.resources_of(&subscription).await {
                Ok(resources) => targets.push((subscription, resources)),
                Err(e) => warn!(
                    connection = %connection_id,
                    error = %e,
                    "Cannot resolve subscribed machines"
                ),
            }
        }

        let machines: BTreeSet<Uuid> = targets
            .iter()
            .flat_map(|(_, resources)| resources.iter().copied())
            .collect();
        report.machines_read = machines.len();
        let states = self.reader.read_many(machines).await;

        for (subscription, resources) in targets {
            let payload: BTreeMap<_, _> = resources
                .iter()
                .filter_map(|id| states.get(id).map(|state| (*id, state.clone())))
                .collect();
            let connection = &subscription.connection;
            if connection.push(ServerMessage::Data { states: payload }) {
                report.delivered += 1;
            } else {
                debug!(connection = %connection.id(), "Push failed, dropping connection");
                self.manager.unsubscribe_all(connection.id());
                report.pruned += 1;
            }
        }
        report
    }

    /// Runs [`tick`](Self::tick) every `period`, forever.
    pub async fn run(self, period: Duration) {
        let mut interval = interval(period);
        info!(class = ?self.class(), "Broadcaster running (every {:?})", period);

        loop {
            interval.tick().await;
            let report = self.tick().await;
            if report.pruned > 0 {
                debug!(class = ?self.class(), pruned = report.pruned, "Pruned connections");
            }
        }
    }
}
