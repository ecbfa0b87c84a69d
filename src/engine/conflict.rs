use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::invalid("visit must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("visit longer than a day"));
    }
    Ok(())
}

/// At least one service, no repeats.
pub(crate) fn validate_services(service_ids: &[Ulid]) -> Result<(), EngineError> {
    if service_ids.is_empty() {
        return Err(EngineError::invalid("at least one service is required"));
    }
    if service_ids.len() > MAX_SERVICES_PER_VISIT {
        return Err(EngineError::LimitExceeded("too many services on visit"));
    }
    let mut seen = HashSet::with_capacity(service_ids.len());
    if let Some(dup) = service_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(EngineError::invalid(format!("service {dup} listed twice")));
    }
    Ok(())
}

/// The overlap check of the conditional write. Caller holds the mechanic's
/// write lock so nothing can land between this check and the append.
pub(crate) fn check_no_conflict(ms: &MechanicState, span: &Span) -> Result<(), EngineError> {
    match ms.overlapping(span).next() {
        Some(existing) => Err(EngineError::SlotNoLongerAvailable {
            mechanic_id: ms.id,
            conflicting: existing.id,
        }),
        None => Ok(()),
    }
}
