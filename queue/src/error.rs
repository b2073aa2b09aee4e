#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("binding queue is already running")]
    AlreadyRunning,
    #[error("binding queue is still stopping; previous dispatch loop has not exited")]
    Stopping,
    #[error("binding queue must be started from within a tokio runtime")]
    NoRuntime,
}
