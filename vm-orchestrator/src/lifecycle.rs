//! Machine creation, bulk creation and deletion.
//!
//! Creation spans three systems with no shared transaction: the relational
//! store, the storage pools and the hypervisor's domain registry. Edges are
//! written in a store transaction that is only committed once the domain is
//! defined; any failure rolls that transaction back and then tears down
//! whatever disks and domains were created. Bulk creation applies the same
//! teardown to every clone of the batch.
//!
//! Deletion goes the other way and never aborts: each [`DeletionStep`] runs
//! in order and its outcome is recorded in a [`DeletionReport`].

use crate::config::OrchestratorConfig;
use crate::disk::DiskManager;
use crate::domain::{self, MachineRequest, MachineSpecification, ParsedDomain};
use crate::error::{OrchestratorError, Result};
use crate::hypervisor::{HypervisorError, HypervisorHandle};
use crate::operation::{OperationGuard, OperationKind, OperationRegistry};
use crate::reconciler::StateReconciler;
use crate::state::StateReader;
use crate::store::{Account, MachineStore};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How many clones a bulk request produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkTarget {
    /// Independent clones sharing the request's assigned clients.
    Count(usize),
    /// One clone per group member, assigned to that member only.
    Group(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStep {
    AcquireOperation,
    ReadDescription,
    StopMachine,
    DeleteDisks,
    DeleteStoreEdges,
    UndefineDomain,
}

impl DeletionStep {
    /// Steps run after the operation is acquired, in order.
    pub const SEQUENCE: [DeletionStep; 5] = [
        DeletionStep::ReadDescription,
        DeletionStep::StopMachine,
        DeletionStep::DeleteDisks,
        DeletionStep::DeleteStoreEdges,
        DeletionStep::UndefineDomain,
    ];
}

impl fmt::Display for DeletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeletionStep::AcquireOperation => "acquire operation",
            DeletionStep::ReadDescription => "read description",
            DeletionStep::StopMachine => "stop machine",
            DeletionStep::DeleteDisks => "delete disks",
            DeletionStep::DeleteStoreEdges => "delete store edges",
            DeletionStep::UndefineDomain => "undefine domain",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    /// Failed, but deletion does not depend on it.
    Tolerated(String),
    /// Not attempted.
    Skipped(String),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: DeletionStep,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub machine_id: Uuid,
    pub steps: Vec<StepRecord>,
}

impl DeletionReport {
    fn new(machine_id: Uuid) -> Self {
        Self {
            machine_id,
            steps: Vec::new(),
        }
    }

    fn record(&mut self, step: DeletionStep, outcome: StepOutcome) {
        self.steps.push(StepRecord { step, outcome });
    }

    pub fn success(&self) -> bool {
        !self.steps.iter().any(|record| record.outcome.is_failure())
    }

    pub fn failed_steps(&self) -> Vec<DeletionStep> {
        self.steps
            .iter()
            .filter(|record| record.outcome.is_failure())
            .map(|record| record.step)
            .collect()
    }

    pub fn outcome(&self, step: DeletionStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| &record.outcome)
    }
}

/// State threaded through the deletion steps.
#[derive(Default)]
struct DeletionContext {
    description: Option<ParsedDomain>,
}

/// A clone of a bulk batch and how far it got.
struct BatchMember {
    machine_id: Uuid,
    request: MachineRequest,
    specification: Option<MachineSpecification>,
    defined: bool,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    hypervisor: HypervisorHandle,
    disks: DiskManager,
    store: MachineStore,
    reader: StateReader,
    reconciler: StateReconciler,
    operations: OperationRegistry,
    domain_type: String,
    max_bulk_count: usize,
}

impl LifecycleManager {
    pub fn new(
        hypervisor: HypervisorHandle,
        disks: DiskManager,
        store: MachineStore,
        reader: StateReader,
        reconciler: StateReconciler,
        operations: OperationRegistry,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            hypervisor,
            disks,
            store,
            reader,
            reconciler,
            operations,
            domain_type: config.domain_type.clone(),
            max_bulk_count: config.max_bulk_count,
        }
    }

    async fn define(&self, machine_id: Uuid, specification: &MachineSpecification) -> Result<()> {
        let xml = domain::encode(specification, machine_id, &self.domain_type);
        let defined = self.hypervisor.call(move |h| h.define_domain(&xml, true)).await?;
        if defined != machine_id {
            warn!(
                machine_id = %machine_id,
                defined = %defined,
                "Hypervisor reported a different domain id"
            );
        }
        debug!(machine_id = %machine_id, "Defined domain");
        Ok(())
    }

    fn check_batch_size(&self, count: usize) -> Result<()> {
        if count > self.max_bulk_count {
            return Err(OrchestratorError::InvalidInput(format!(
                "batch of {} exceeds the limit of {} machines",
                count, self.max_bulk_count
            )));
        }
        Ok(())
    }

    async fn undefine(&self, machine_id: Uuid) -> std::result::Result<(), HypervisorError> {
        self.hypervisor.call(move |h| h.undefine_domain(machine_id)).await
    }

    /// Removes every side effect of a machine that never became visible:
    /// disks, the domain if it was defined, and any committed edges.
    async fn teardown(
        &self,
        machine_id: Uuid,
        specification: Option<&MachineSpecification>,
        defined: bool,
    ) {
        if let Some(specification) = specification {
            let failures = self.disks.cleanup_all(specification).await;
            if failures > 0 {
                error!(machine_id = %machine_id, failures, "Disks left behind by failed creation");
            }
        }
        if defined {
            if let Err(e) = self.undefine(machine_id).await {
                error!(
                    machine_id = %machine_id,
                    error = %e,
                    "Domain left behind by failed creation"
                );
            }
        }
        if let Err(e) = self.store.delete_edges(machine_id).await {
            error!(machine_id = %machine_id, error = %e, "Edges left behind by failed creation");
        }
    }

    /// Defines one machine owned by `owner`. All-or-nothing.
    #[instrument(skip(self, request), fields(owner = %owner, title = %request.title))]
    pub async fn create_machine(&self, request: MachineRequest, owner: &Account) -> Result<Uuid> {
        request.validate()?;
        let machine_id = Uuid::new_v4();
        let _guard = self.operations.try_begin(machine_id, OperationKind::Create)?;

        let mut tx = self.store.begin().await?;
        self.store
            .insert_edges(&mut tx, machine_id, owner, &request.assigned_clients)
            .await?;

        let specification = match self.disks.allocate_all(request).await {
            Ok(specification) => specification,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        if let Err(e) = self.define(machine_id, &specification).await {
            error!(machine_id = %machine_id, error = %e, "Definition failed, rolling back");
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            self.teardown(machine_id, Some(&specification), false).await;
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            error!(machine_id = %machine_id, error = %e, "Commit failed, rolling back");
            self.teardown(machine_id, Some(&specification), true).await;
            return Err(e.into());
        }

        info!(machine_id = %machine_id, "Machine created");
        Ok(machine_id)
    }

    /// Defines a batch of clones of `request`. Either every clone is created
    /// or none is.
    #[instrument(skip(self, request), fields(owner = %owner, title = %request.title))]
    pub async fn create_machines_bulk(
        &self,
        request: MachineRequest,
        owner: &Account,
        target: BulkTarget,
    ) -> Result<Vec<Uuid>> {
        request.validate()?;

        let requests = match target {
            BulkTarget::Count(0) => {
                return Err(OrchestratorError::InvalidInput("count must be positive".into()));
            }
            BulkTarget::Count(count) => {
                self.check_batch_size(count)?;
                vec![request; count]
            }
            BulkTarget::Group(group_id) => {
                let members = self.store.group_members(&group_id).await?;
                if members.is_empty() {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "group {} has no members",
                        group_id
                    )));
                }
                self.check_batch_size(members.len())?;
                members
                    .into_iter()
                    .map(|member| MachineRequest {
                        assigned_clients: BTreeSet::from([member]),
                        ..request.clone()
                    })
                    .collect()
            }
        };

        let mut clones: Vec<BatchMember> = requests
            .into_iter()
            .map(|request| BatchMember {
                machine_id: Uuid::new_v4(),
                request,
                specification: None,
                defined: false,
            })
            .collect();
        let _guards = clones
            .iter()
            .map(|clone| self.operations.try_begin(clone.machine_id, OperationKind::Create))
            .collect::<Result<Vec<OperationGuard>>>()?;
        info!(count = clones.len(), "Creating machine batch");

        let mut tx = self.store.begin().await?;
        for clone in &clones {
            self.store
                .insert_edges(&mut tx, clone.machine_id, owner, &clone.request.assigned_clients)
                .await?;
        }

        let allocations = join_all(
            clones
                .iter()
                .map(|clone| self.disks.allocate_all(clone.request.clone())),
        )
        .await;
        let mut first_error = None;
        for (clone, allocation) in clones.iter_mut().zip(allocations) {
            match allocation {
                Ok(specification) => clone.specification = Some(specification),
                Err(e) => {
                    warn!(machine_id = %clone.machine_id, error = %e, "Clone allocation failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if first_error.is_none() {
            let definitions = join_all(clones.iter().map(|clone| async move {
                match &clone.specification {
                    Some(specification) => self.define(clone.machine_id, specification).await,
                    None => Ok(()),
                }
            }))
            .await;
            for (clone, definition) in clones.iter_mut().zip(definitions) {
                match definition {
                    Ok(()) => clone.defined = true,
                    Err(e) => {
                        warn!(
                            machine_id = %clone.machine_id,
                            error = %e,
                            "Clone definition failed"
                        );
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }

        let commit = match first_error {
            None => tx.commit().await.map_err(OrchestratorError::from),
            Some(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        };

        match commit {
            Ok(()) => {
                info!(count = clones.len(), "Machine batch created");
                Ok(clones.iter().map(|clone| clone.machine_id).collect())
            }
            Err(e) => {
                error!(error = %e, "Batch failed, tearing down every clone");
                join_all(clones.iter().map(|clone| {
                    self.teardown(clone.machine_id, clone.specification.as_ref(), clone.defined)
                }))
                .await;
                Err(e)
            }
        }
    }

    /// Deletes a machine, reporting every step. Never raises.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn delete_machine_report(&self, machine_id: Uuid) -> DeletionReport {
        let mut report = DeletionReport::new(machine_id);
        let _guard = match self.operations.try_begin(machine_id, OperationKind::Delete) {
            Ok(guard) => {
                report.record(DeletionStep::AcquireOperation, StepOutcome::Succeeded);
                guard
            }
            Err(e) => {
                warn!(error = %e, "Deletion rejected");
                report.record(DeletionStep::AcquireOperation, StepOutcome::Failed(e.to_string()));
                return report;
            }
        };

        let mut context = DeletionContext::default();
        for step in DeletionStep::SEQUENCE {
            let outcome = self.run_step(machine_id, step, &mut context).await;
            match &outcome {
                StepOutcome::Failed(reason) => warn!(%step, %reason, "Deletion step failed"),
                StepOutcome::Tolerated(reason) => {
                    debug!(%step, %reason, "Deletion step failure tolerated")
                }
                _ => {}
            }
            report.record(step, outcome);
        }

        if report.success() {
            info!("Machine deleted");
        } else {
            let failed: Vec<String> = report
                .failed_steps()
                .iter()
                .map(ToString::to_string)
                .collect();
            error!(failed = ?failed, "Machine only partially deleted, manual cleanup required");
        }
        report
    }

    /// Deletes a machine; true only if every step succeeded.
    pub async fn delete_machine(&self, machine_id: Uuid) -> bool {
        self.delete_machine_report(machine_id).await.success()
    }

    async fn run_step(
        &self,
        machine_id: Uuid,
        step: DeletionStep,
        context: &mut DeletionContext,
    ) -> StepOutcome {
        match step {
            DeletionStep::AcquireOperation => StepOutcome::Succeeded,
            DeletionStep::ReadDescription => match self.reader.read_description(machine_id).await {
                Ok(description) => {
                    context.description = Some(description);
                    StepOutcome::Succeeded
                }
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
            DeletionStep::StopMachine => match self.reconciler.power_off(machine_id).await {
                Ok(()) => StepOutcome::Succeeded,
                Err(OrchestratorError::InvalidState(_)) => {
                    StepOutcome::Skipped("machine is not running".into())
                }
                Err(e) => StepOutcome::Tolerated(e.to_string()),
            },
            DeletionStep::DeleteDisks => {
                let Some(description) = &context.description else {
                    return StepOutcome::Skipped("description unavailable".into());
                };
                let deletions = description
                    .disks()
                    .map(|disk| self.disks.delete_disk(disk.uuid, disk.pool));
                let failures = join_all(deletions)
                    .await
                    .into_iter()
                    .filter(|deleted| !deleted)
                    .count();
                if failures == 0 {
                    StepOutcome::Succeeded
                } else {
                    StepOutcome::Failed(format!("{} disk(s) not deleted", failures))
                }
            }
            DeletionStep::DeleteStoreEdges => match self.store.delete_edges(machine_id).await {
                Ok(_) => StepOutcome::Succeeded,
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
            DeletionStep::UndefineDomain => match self.undefine(machine_id).await {
                Ok(()) => StepOutcome::Succeeded,
                Err(e) => StepOutcome::Failed(e.to_string()),
            },
        }
    }

    /// Hands the machine to another account.
    pub async fn transfer_ownership(
        &self,
        machine_id: Uuid,
        new_owner: &Account,
    ) -> Result<Account> {
        let previous = self.store.transfer_owner(machine_id, new_owner).await?;
        info!(machine_id = %machine_id, from = %previous, to = %new_owner, "Ownership transferred");
        Ok(previous)
    }
}
