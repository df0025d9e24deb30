pub mod client;
pub mod events;

pub use client::{MachineEvent, RegistryClient};
pub use events::MachineRow;
