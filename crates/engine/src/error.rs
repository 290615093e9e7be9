use thiserror::Error;

/// Broad failure classes; the HTTP layer maps these to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Exhausted,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid agent name: {0}")]
    InvalidName(String),
    #[error("agent name already taken: {0}")]
    NameTaken(String),
    #[error("color must be 0-15 or a hex string like #FF0000")]
    InvalidColor,
    #[error("coordinates ({x}, {y}) out of bounds for {width}x{height} canvas")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    },
    #[error("unknown config key: {0}")]
    UnknownConfigKey(String),
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("unauthorized")]
    Unauthorized,
    #[error("no pixels available; next pixel in {wait_ms} ms")]
    PoolExhausted { wait_ms: i64 },
    #[error("faction not found: {0}")]
    FactionNotFound(String),
    #[error("agent not found")]
    AgentNotFound,
    #[error("operation cancelled")]
    Cancelled,
    #[error("storage busy, retry later")]
    Busy,
    #[error("sqlite error: {0}")]
    Storage(rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                EngineError::Busy
            }
            _ => EngineError::Storage(e),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidName(_)
            | EngineError::InvalidColor
            | EngineError::OutOfBounds { .. }
            | EngineError::UnknownConfigKey(_) => ErrorKind::Validation,
            EngineError::InvalidApiKey | EngineError::Unauthorized => ErrorKind::Authorization,
            EngineError::PoolExhausted { .. } => ErrorKind::Exhausted,
            EngineError::FactionNotFound(_) | EngineError::AgentNotFound => ErrorKind::NotFound,
            EngineError::NameTaken(_) => ErrorKind::Conflict,
            EngineError::Busy | EngineError::Cancelled => ErrorKind::Unavailable,
            EngineError::Storage(_) | EngineError::Io(_) | EngineError::Serde(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidName(_) => "invalid_name",
            EngineError::NameTaken(_) => "name_taken",
            EngineError::InvalidColor => "invalid_color",
            EngineError::OutOfBounds { .. } => "out_of_bounds",
            EngineError::UnknownConfigKey(_) => "unknown_config_key",
            EngineError::InvalidApiKey => "invalid_api_key",
            EngineError::Unauthorized => "unauthorized",
            EngineError::PoolExhausted { .. } => "pool_exhausted",
            EngineError::FactionNotFound(_) => "faction_not_found",
            EngineError::AgentNotFound => "agent_not_found",
            EngineError::Cancelled => "cancelled",
            EngineError::Busy => "busy",
            EngineError::Storage(_) | EngineError::Io(_) | EngineError::Serde(_) => "internal",
        }
    }

    pub fn retry_after_seconds(&self) -> Option<i64> {
        match self {
            EngineError::PoolExhausted { wait_ms } => Some(wait_seconds(*wait_ms)),
            _ => None,
        }
    }
}

/// Whole seconds to wait, rounded up so a retry never lands early.
pub fn wait_seconds(wait_ms: i64) -> i64 {
    (wait_ms.max(0) + 999) / 1000
}
