use thiserror::Error;

/// Errors surfaced by the persistent datastore handle (`crate::db::Database`).
///
/// Transport errors are the only variant that the reconnect-once recovery
/// path in `Database::with_retry` retries on; everything else is surfaced
/// straight to the caller.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("datastore transport error: {0}")]
    Transport(#[from] sqlx::Error),
    #[error("datastore migration failed: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("alert hash already exists")]
    HashCollision,
}

#[derive(Debug, Error)]
pub enum SuppressionStoreError {
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat API rejected the call: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("auth API rejected the call: {0}")]
    Api(String),
    #[error("no push-capable device enrolled for this user")]
    NoPushDevice,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required message key: {0}")]
    MissingMessageKey(String),
    #[error("unknown command handler: {0}")]
    UnknownHandler(String),
}

/// Construction-time failures for `crate::fsm::StateMachine`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("duplicate state name encountered while building the state machine")]
    DuplicateState,
    #[error("transition references an unknown source state")]
    UnknownSource,
    #[error("transition references an unknown destination state")]
    UnknownDest,
    #[error("initial state is not a member of the declared state set")]
    UnknownInitial,
}

/// Domain-invariant errors raised while admitting a task:
/// surfaced to the caller as a short diagnostic and coerced to
/// `AWAITING_VERIFICATION` rather than aborting the coordinator.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("invalid user")]
    InvalidUser,
    #[error("blacklisted")]
    Blacklisted,
}
