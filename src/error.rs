use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid id: {0}")]
    InvalidId(#[from] uuid::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Lock '{resource_key}' held by {holder_id} until {expires_at}")]
    LockBusy {
        resource_key: String,
        holder_id: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Send to {target} timed out after {timeout:?}")]
    SendTimeout {
        target: String,
        timeout: std::time::Duration,
    },

    #[error("Recovery suspended for project '{project_id}': {recoveries} recovery dispatches within {window_secs}s")]
    RecoverySuspended {
        project_id: String,
        recoveries: usize,
        window_secs: u64,
    },

    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    #[error("Unknown report category: {0}")]
    UnknownCategory(String),
}

pub type Result<T> = std::result::Result<T, Error>;
