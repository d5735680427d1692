//! Start/stop commands and the polling that confirms them.
//!
//! The hypervisor acknowledges a start or shutdown request long before the
//! guest actually reaches the new state, so every command is followed by
//! [`StateReconciler::await_transition`], which polls until the machine is
//! running, has halted, or the configured timeout has elapsed.

use crate::config::OrchestratorConfig;
use crate::domain;
use crate::error::{OrchestratorError, Result};
use crate::gateway::GatewayStore;
use crate::hypervisor::{DomainState, HypervisorHandle, ShutdownMode};
use crate::operation::{OperationKind, OperationRegistry};
use crate::state::BootRegistry;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Where a machine ended up after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Running,
    /// Shut off or crashed.
    Halted,
    /// Neither within the timeout.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    PowerOn,
    /// Intermediate running states are ignored while powering off.
    PowerOff,
}

#[derive(Debug, Clone)]
pub struct StateReconciler {
    hypervisor: HypervisorHandle,
    gateway: GatewayStore,
    operations: OperationRegistry,
    boots: BootRegistry,
    poll_interval: Duration,
    transition_timeout: Duration,
    shutdown_window: Duration,
}

impl StateReconciler {
    pub fn new(
        hypervisor: HypervisorHandle,
        gateway: GatewayStore,
        operations: OperationRegistry,
        boots: BootRegistry,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            hypervisor,
            gateway,
            operations,
            boots,
            poll_interval: config.poll_interval(),
            transition_timeout: config.transition_timeout(),
            shutdown_window: config.shutdown_window(),
        }
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    async fn domain_state(&self, machine_id: Uuid) -> Result<DomainState> {
        Ok(self.hypervisor.call(move |h| h.domain_state(machine_id)).await?)
    }

    /// Polls until the machine reaches a terminal state for `direction`, or
    /// returns [`Transition::Unknown`] once the transition timeout elapses.
    pub async fn await_transition(&self, machine_id: Uuid, direction: Direction) -> Transition {
        self.poll_until(machine_id, direction, self.transition_timeout).await
    }

    async fn poll_until(
        &self,
        machine_id: Uuid,
        direction: Direction,
        timeout: Duration,
    ) -> Transition {
        let deadline = Instant::now() + timeout;
        loop {
            match self.domain_state(machine_id).await {
                Ok(state) => match (direction, state) {
                    (Direction::PowerOn, DomainState::Running) => return Transition::Running,
                    (_, DomainState::Shutoff | DomainState::Crashed) => return Transition::Halted,
                    _ => {}
                },
                Err(e) => debug!(machine_id = %machine_id, error = %e, "State poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Transition::Unknown;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Framebuffer protocol and live port, read from the current description.
    async fn framebuffer(&self, machine_id: Uuid) -> Result<(&'static str, Option<u16>)> {
        let xml = self.hypervisor.call(move |h| h.domain_xml(machine_id)).await?;
        let parsed = domain::parse(&xml)?;
        Ok((parsed.framebuffer.kind.as_str(), parsed.live_port))
    }

    async fn publish_port(&self, machine_id: Uuid, protocol: &str, port: u16) {
        if let Err(e) = self.gateway.set_port(machine_id, protocol, port).await {
            warn!(machine_id = %machine_id, error = %e, "Failed to update gateway port");
        }
    }

    /// Starts a stopped machine and waits until it runs.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn start_machine(&self, machine_id: Uuid) -> Result<()> {
        let _guard = self.operations.try_begin(machine_id, OperationKind::Start)?;
        if self.domain_state(machine_id).await?.is_active() {
            return Err(OrchestratorError::InvalidState(format!(
                "machine {} is already running",
                machine_id
            )));
        }

        info!("Starting machine");
        self.hypervisor.call(move |h| h.start_domain(machine_id)).await?;

        match self.await_transition(machine_id, Direction::PowerOn).await {
            Transition::Running => {
                self.boots.record(machine_id);
                match self.framebuffer(machine_id).await {
                    Ok((protocol, Some(port))) => {
                        self.publish_port(machine_id, protocol, port).await
                    }
                    Ok((protocol, None)) => {
                        warn!(protocol, "Running machine reports no framebuffer port")
                    }
                    Err(e) => warn!(error = %e, "Cannot read framebuffer after start"),
                }
                info!("Machine running");
                Ok(())
            }
            Transition::Halted => Err(OrchestratorError::TransitionFailed(format!(
                "machine {} halted while starting",
                machine_id
            ))),
            Transition::Unknown => Err(OrchestratorError::TransitionFailed(format!(
                "machine {} did not reach running within {:?}",
                machine_id, self.transition_timeout
            ))),
        }
    }

    /// Stops a running machine, gracefully if possible.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn stop_machine(&self, machine_id: Uuid) -> Result<()> {
        let _guard = self.operations.try_begin(machine_id, OperationKind::Stop)?;
        self.power_off(machine_id).await
    }

    /// Stop sequence for a caller that already holds the machine's operation.
    pub(crate) async fn power_off(&self, machine_id: Uuid) -> Result<()> {
        if !self.domain_state(machine_id).await?.is_active() {
            return Err(OrchestratorError::InvalidState(format!(
                "machine {} is not running",
                machine_id
            )));
        }
        let framebuffer = self.framebuffer(machine_id).await;

        info!(machine_id = %machine_id, "Stopping machine");
        if !self.shut_down_gracefully(machine_id).await {
            warn!(machine_id = %machine_id, "Graceful shutdown failed, destroying");
            self.hypervisor.call(move |h| h.destroy_domain(machine_id)).await?;
            if self.await_transition(machine_id, Direction::PowerOff).await != Transition::Halted {
                return Err(OrchestratorError::TransitionFailed(format!(
                    "machine {} did not halt after destroy",
                    machine_id
                )));
            }
        }

        self.boots.clear(machine_id);
        match framebuffer {
            Ok((protocol, _)) => self.publish_port(machine_id, protocol, 0).await,
            Err(e) => warn!(machine_id = %machine_id, error = %e, "Cannot reset gateway port"),
        }
        info!(machine_id = %machine_id, "Machine stopped");
        Ok(())
    }

    /// Tries each shutdown mode in turn, giving each its own window.
    async fn shut_down_gracefully(&self, machine_id: Uuid) -> bool {
        for mode in ShutdownMode::DESCENDING {
            let request = self
                .hypervisor
                .call(move |h| h.shutdown_domain(machine_id, mode))
                .await;
            if let Err(e) = request {
                debug!(machine_id = %machine_id, ?mode, error = %e, "Shutdown mode refused");
                continue;
            }
            let outcome = self
                .poll_until(machine_id, Direction::PowerOff, self.shutdown_window)
                .await;
            if outcome == Transition::Halted {
                debug!(machine_id = %machine_id, ?mode, "Machine halted");
                return true;
            }
        }
        false
    }
}
