//! Shared value types.

use serde::{Deserialize, Serialize};

/// What the activation collaborator did for one dispatch.
///
/// The dispatcher treats this as opaque bookkeeping; it only feeds history and stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// A response was produced and delivered.
    Replied { actions: u32 },
    /// The collaborator looked at the stream and chose not to respond.
    Skipped,
}

impl ActivationOutcome {
    pub fn replied(actions: u32) -> Self {
        Self::Replied { actions }
    }
}
