use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Referenced car, user, insurance, rental or reservation does not exist.
    NotFound(Ulid),
    /// Malformed request: bad window, past start, too short, wrong role.
    InvalidInput(String),
    /// Well-formed request the current bookings refuse; may succeed later.
    Conflict(String),
    /// Role or ownership violation.
    Forbidden(&'static str),
    /// Status change the lifecycle does not allow.
    IllegalTransition(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable category name, used for metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::IllegalTransition(_) => "illegal_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::IllegalTransition(msg) => write!(f, "illegal transition: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
