use std::sync::Arc;
use vm_orchestrator::{
    MachineOrchestrator, SessionAccountVerifier, SubscriptionService, SubscriptionTables,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: MachineOrchestrator,
    pub subscriptions: SubscriptionService,
    pub subscriber_buffer: usize,
}

impl AppState {
    pub fn new(
        orchestrator: MachineOrchestrator,
        tables: SubscriptionTables,
        subscriber_buffer: usize,
    ) -> Self {
        let subscriptions =
            orchestrator.subscription_service(tables, Arc::new(SessionAccountVerifier));
        Self {
            orchestrator,
            subscriptions,
            subscriber_buffer,
        }
    }
}
