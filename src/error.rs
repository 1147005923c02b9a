use thiserror::Error;

use crate::ir::Diagnostic;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model failed validation ({} diagnostic(s))", .0.len())]
    ModelInvalid(Vec<Diagnostic>),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("action evaluation failed fatally: {0}")]
    Action(#[from] ActionError),

    #[error("event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("co-simulation engine is unavailable")]
    EngineUnavailable,

    #[error("co-simulation command of kind {kind} timed out")]
    Timeout { kind: String },

    #[error("operation attempted after engine halted")]
    Halted,

    #[error("variable '{name}' does not match declared type {expected}")]
    VarTypeMismatch { name: String, expected: String },
}

/// Classification of a guard/action evaluation failure (§4.2, §7).
#[derive(Debug, Clone, Error)]
#[error("{kind:?} in '{source_fragment}'{}", .location.as_deref().unwrap_or(""))]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub source_fragment: String,
    pub location: Option<String>,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, source_fragment: impl Into<String>) -> Self {
        Self {
            kind,
            source_fragment: source_fragment.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl std::fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalErrorKind {
    SyntaxError,
    NameError,
    TypeError,
    DivideByZero,
    Other,
}

/// Fatal escalation of an `EvalError` raised while executing an action, when
/// `halt_on_action_error` is enabled (§4.3 Failure semantics).
#[derive(Debug, Clone, Error)]
#[error("action error: {0}")]
pub struct ActionError(#[from] pub EvalError);

/// Transport errors from the hardware serial link or the co-sim TCP channel (§7.5).
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial link error at {location}: {cause}")]
    Serial { location: String, cause: String },

    #[error("TCP link error at {location}: {cause}")]
    Tcp { location: String, cause: String },

    #[error("co-simulation process error: {0}")]
    Process(String),
}
