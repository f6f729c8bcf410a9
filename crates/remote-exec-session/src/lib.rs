//! Session continuity and storage for remote executions.
//!
//! Provides:
//! - `SessionContinuityManager` - Load and persist conversation history with retries
//! - Storage implementations (memory)

pub mod continuity;
pub mod storage;

pub use continuity::SessionContinuityManager;
#[cfg(feature = "memory")]
pub use storage::MemorySessionStore;
