use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("session is still resolving")]
    SessionLoading,
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("cannot message yourself")]
    SelfMessage,
    #[error("identity changed while the request was in flight")]
    Superseded,
    #[error("platform url must start with http:// or https://: {0}")]
    InvalidPlatformUrl(String),
    #[error("realtime subscription rejected: {0}")]
    SubscriptionRejected(String),
}
