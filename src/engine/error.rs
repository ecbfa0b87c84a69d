use ulid::Ulid;

use crate::model::VisitStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bad input shape: fix the request and retry.
    InvalidRequest(String),
    /// Unknown mechanic.
    ResourceNotFound(Ulid),
    /// Unknown visit.
    NotFound(Ulid),
    /// Lost a booking race: re-query availability and pick again.
    SlotNoLongerAvailable { mechanic_id: Ulid, conflicting: Ulid },
    IllegalTransition {
        visit_id: Ulid,
        from: VisitStatus,
        to: VisitStatus,
    },
    AlreadyExists(Ulid),
    HasVisits(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidRequest(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::ResourceNotFound(id) => write!(f, "mechanic not found: {id}"),
            EngineError::NotFound(id) => write!(f, "visit not found: {id}"),
            EngineError::SlotNoLongerAvailable {
                mechanic_id,
                conflicting,
            } => write!(
                f,
                "slot no longer available on mechanic {mechanic_id}: conflicts with visit {conflicting}"
            ),
            EngineError::IllegalTransition { visit_id, from, to } => {
                write!(f, "illegal transition for visit {visit_id}: {from} -> {to}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasVisits(id) => {
                write!(f, "cannot delete mechanic {id}: has visits")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
