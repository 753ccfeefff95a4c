use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config manifest tamper: {0}")]
    ConfigTamper(String),

    #[error("insecure secrets: {0}")]
    InsecureSecrets(String),

    #[error("state signature verification failed")]
    StateSignature,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("arming error: {0}")]
    Arming(String),

    #[error("wal error: {0}")]
    Wal(String),

    #[error("event store error: {0}")]
    EventStore(String),

    #[error("budget denied: {0}")]
    BudgetDenied(String),

    #[error("halt: {0}")]
    Halt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unexpected error: {0}")]
    Other(String),
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_variant_carries_reason() {
        let err = BotError::Halt("ORPHAN_RISK".to_string());
        assert_eq!(err.to_string(), "halt: ORPHAN_RISK");
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> BotResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(BotError::Io(_))));
    }
}
