use ulid::Ulid;

use crate::model::{AppointmentStatus, Minutes};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input; rejected before any state change.
    Validation(String),
    /// Slot is taken or no longer inside the tutor's availability. Retryable.
    SlotUnavailable,
    InsufficientBalance {
        required: Minutes,
        available: Minutes,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Store-level exclusion check hit an existing appointment.
    /// Translated to `SlotUnavailable` by the booking service.
    Overlap(Ulid),
    /// Window has scheduled appointments inside it and can't change.
    WindowInUse(Ulid),
    Forbidden(String),
    LimitExceeded(&'static str),
    WalError(String),
    /// Hours may have drifted; needs manual reconciliation.
    Reconciliation(String),
}

impl EngineError {
    /// Lost a race for the slot; the caller may retry after refreshing state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::SlotUnavailable | EngineError::Overlap(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::SlotUnavailable => write!(f, "slot no longer available"),
            EngineError::InsufficientBalance { required, available } => write!(
                f,
                "insufficient balance: {required} minutes required, {available} available"
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            EngineError::Overlap(id) => write!(f, "overlaps appointment: {id}"),
            EngineError::WindowInUse(id) => {
                write!(f, "window {id} has scheduled appointments and cannot change")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Reconciliation(msg) => write!(f, "reconciliation required: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
