//! ChatClaw error types.

use std::time::Duration;

/// Errors raised across the ChatClaw crates.
#[derive(Debug, thiserror::Error)]
pub enum ChatClawError {
    /// Malformed or inconsistent configuration. Raised at load time, never on the hot path.
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Insert-only registration hit a live trigger for the same stream.
    #[error("Trigger already registered for stream '{0}'")]
    DuplicateTrigger(String),

    /// The activation collaborator reported a domain failure.
    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Activation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Activation cancelled")]
    Cancelled,

    /// Scheduler lifecycle misuse, such as starting a running engine.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, ChatClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = ChatClawError::DuplicateTrigger("s1".into());
        assert_eq!(e.to_string(), "Trigger already registered for stream 's1'");

        let e = ChatClawError::Timeout(Duration::from_secs(3));
        assert!(e.to_string().contains("3s"));
    }

    #[test]
    fn test_io_conversion() {
        fn read_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/definitely/not/here.toml")?)
        }
        assert!(matches!(read_missing(), Err(ChatClawError::Io(_))));
    }
}
