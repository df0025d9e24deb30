pub mod config;
pub mod error;
pub mod fs;
pub mod identity;
pub mod ipam;

pub use config::{NetworkConfig, NetworkConfigInput};
pub use error::{Error, Result};
