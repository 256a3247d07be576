//! # ChatClaw Core
//!
//! Shared building blocks for the ChatClaw dispatch stack:
//! configuration, the error type, and the activation collaborator trait.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ChatClawConfig;
pub use error::{ChatClawError, Result};
pub use traits::Activator;
pub use types::ActivationOutcome;
