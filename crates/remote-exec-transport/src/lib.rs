//! Control-plane transport for remote executions.
//!
//! Provides:
//! - Wire payloads exchanged with the control plane
//! - `ControlPlaneClient` - HTTP implementation of the session store, event
//!   sink, toolset resolver and metadata cache (requires `http` feature)

pub mod config;
pub mod protocol;

#[cfg(feature = "http")]
pub mod control_plane;

pub use config::ControlPlaneConfig;
#[cfg(feature = "http")]
pub use control_plane::{ControlPlaneClient, ControlPlaneError};
