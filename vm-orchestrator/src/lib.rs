//! Virtual machine lifecycle orchestration
//!
//! Defines, starts, stops and deletes machines on one hypervisor host while
//! keeping the hypervisor's domain registry, the relational ownership store
//! and the remote-access gateway consistent, and pushes machine state to
//! subscribed connections. It is consumed by the vm-api HTTP service but can
//! also be driven by CLI commands, background workers, or other entry points.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod disk;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod hypervisor;
pub mod lifecycle;
pub mod operation;
pub mod orchestrator;
pub mod protocol;
pub mod reconciler;
pub mod service;
pub mod state;
pub mod store;
pub mod subscription;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broadcast::{Broadcaster, TickReport};
pub use config::OrchestratorConfig;
pub use domain::{
    Disk, DiskFormat, DiskRequest, Framebuffer, FramebufferKind, FramebufferPort, InstallMedia,
    InterfaceSource, Listen, MachineRequest, MachineSpec, MachineSpecification, NetworkInterface,
    StoragePool,
};
pub use error::{OrchestratorError, Result};
pub use hypervisor::{
    DomainState, Hypervisor, HypervisorError, HypervisorHandle, MemoryHypervisor, ShutdownMode,
};
pub use lifecycle::{BulkTarget, DeletionReport, DeletionStep, StepOutcome};
pub use operation::{OperationKind, OperationRegistry, OperationTask};
pub use orchestrator::MachineOrchestrator;
pub use protocol::{ClientCommand, ServerMessage};
pub use reconciler::{Direction, Transition};
pub use service::{CredentialVerifier, SubscriptionService, SessionAccountVerifier};
pub use state::{DiskState, MachineState};
pub use store::{Account, AccountKind};
pub use subscription::{Connection, SubscriptionClass, SubscriptionManager, SubscriptionTables};
