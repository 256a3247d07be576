//! Activator trait — the response-generation collaborator invoked when a stream's trigger fires.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ActivationOutcome;

/// Runs one activation/response cycle for a stream.
///
/// Implementations should watch `cancel` and return early (typically with
/// [`ChatClawError::Cancelled`](crate::error::ChatClawError::Cancelled)) when it fires.
/// Cancellation is best-effort: finishing the current unit of work first is fine.
#[async_trait]
pub trait Activator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn activate(&self, stream_id: &str, cancel: CancellationToken) -> Result<ActivationOutcome>;
}
