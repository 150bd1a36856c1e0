use knotd_store::StoreError;
use thiserror::Error;

/// Engine-level failures. Every variant maps onto one of the wire error
/// codes via [`EngineError::code`]; iterator EOF and budget exhaustion are
/// not represented here (they are values of `Found` and `Step`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("syntax error at byte {at}: {message}")]
    Syntax { at: usize, message: String },
    #[error("semantics: {0}")]
    Semantics(String),
    /// The request matched nothing, or an `asof` predates the store.
    #[error("null result")]
    NotFound,
    #[error("result exceeds {0}")]
    TooMany(String),
    #[error("a primitive matching the unique clause already exists: {0}")]
    UniqueExists(String),
    #[error("request deadline exceeded")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("writes are refused: {0}")]
    SmpWrite(String),
    #[error("smp coordination failed: {0}")]
    Smp(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn syntax(at: usize, message: impl Into<String>) -> EngineError {
        EngineError::Syntax {
            at,
            message: message.into(),
        }
    }

    pub fn semantics(message: impl Into<String>) -> EngineError {
        EngineError::Semantics(message.into())
    }

    pub fn internal(message: impl Into<String>) -> EngineError {
        EngineError::Internal(message.into())
    }

    /// The wire code of the `error "CODE message"` reply line.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Syntax { .. } => "SYNTAX",
            EngineError::Semantics(_) => "SEMANTICS",
            EngineError::NotFound => "EMPTY",
            EngineError::TooMany(_) => "TOOMANY",
            EngineError::UniqueExists(_) => "UNIQUE_EXISTS",
            EngineError::Timeout => "TIMEOUT",
            EngineError::Cancelled => "SYSTEM",
            EngineError::SmpWrite(_) => "SMPWRITE",
            EngineError::Smp(_) => "SMP",
            EngineError::Store(StoreError::TooBig { .. }) => "TOOBIG",
            EngineError::Store(_) | EngineError::Internal(_) => "SYSTEM",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> EngineError {
        EngineError::Store(err)
    }
}
