use tracing::info;
use ulid::Ulid;

use crate::engine::{EngineError, VisitStore};
use crate::model::{Ms, Visit, VisitStatus};
use crate::observability::VISIT_TRANSITIONS_TOTAL;

use super::Scheduler;

/// Every legal move. Each status has at most one successor and nothing goes back.
const TRANSITIONS: [(VisitStatus, VisitStatus); 3] = [
    (VisitStatus::Scheduled, VisitStatus::InProgress),
    (VisitStatus::InProgress, VisitStatus::Done),
    (VisitStatus::Done, VisitStatus::Delivered),
];

impl VisitStatus {
    /// Status of a freshly booked visit.
    pub const INITIAL: VisitStatus = VisitStatus::Scheduled;

    pub fn successor(self) -> Option<VisitStatus> {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
    }

    pub fn is_terminal(self) -> bool {
        self.successor().is_none()
    }
}

pub fn check_transition(visit_id: Ulid, from: VisitStatus, to: VisitStatus) -> Result<(), EngineError> {
    if from.successor() == Some(to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { visit_id, from, to })
    }
}

/// Move `visit` one step forward and stamp it. On error the visit is untouched.
/// `updated_at` never moves backwards even if the clock does.
pub fn advance(visit: &mut Visit, target: VisitStatus, at: Ms) -> Result<(), EngineError> {
    check_transition(visit.id, visit.status, target)?;
    visit.status = target;
    visit.updated_at = at.max(visit.updated_at);
    Ok(())
}

impl Scheduler {
    /// Apply one lifecycle step through the store. The store checks the
    /// transition under the mechanic's write lock, so two callers racing to
    /// make the same step cannot both succeed.
    pub async fn advance_visit<S>(
        &self,
        store: &S,
        visit_id: Ulid,
        target: VisitStatus,
    ) -> Result<Visit, EngineError>
    where
        S: VisitStore + ?Sized,
    {
        let visit = store.update_visit_status(visit_id, target).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "status" => target.as_str()).increment(1);
        info!("visit {visit_id} now {target}");
        Ok(visit)
    }
}
