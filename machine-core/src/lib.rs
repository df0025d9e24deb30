//! Idempotent reconciler for the ployz overlay: identity, local state,
//! the CRDT registry client, platform adapters, and the orchestrator
//! that ties them together.

pub mod adapter;
pub mod docker;
pub mod host_access;
pub mod join;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod state;
pub mod supervisor;

pub use host_access::HostAccessSession;
pub use join::{JoinPlan, JoinSession};
pub use orchestrator::{Orchestrator, Status};
pub use reconciler::Reconciler;
pub use registry::{MachineEvent, MachineRow, RegistryClient};
pub use state::{PeerRecord, State, StateStore};
