use thiserror::Error;

/// Failures are contained per operation; none of these ever tears down the
/// process or crosses from one actor to another.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interaction event: {0}")]
    Validation(String),
    #[error("alert persistence failed: {0}")]
    Persistence(String),
    #[error("delivery to subscriber failed: {0}")]
    Delivery(String),
    #[error("housekeeping pass incomplete: {0}")]
    Scheduling(String),
    #[error("actor mailbox closed")]
    MailboxClosed,
}
