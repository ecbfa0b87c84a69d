use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// The persistence seam the scheduler runs against.
///
/// `create_visit` is the only write that must be conditional: it re-checks
/// for overlap and inserts as one atomic step per mechanic, answering
/// `SlotNoLongerAvailable` when it loses.
#[async_trait]
pub trait VisitStore: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<Mechanic>, EngineError>;

    async fn list_committed_intervals(
        &self,
        mechanic_id: Ulid,
        window: Span,
    ) -> Result<Vec<CommittedInterval>, EngineError>;

    async fn create_visit(&self, visit: NewVisit) -> Result<Visit, EngineError>;

    async fn update_visit_status(&self, visit_id: Ulid, status: VisitStatus) -> Result<Visit, EngineError>;
}

#[async_trait]
impl VisitStore for Engine {
    async fn list_resources(&self) -> Result<Vec<Mechanic>, EngineError> {
        Ok(self.list_mechanics().await)
    }

    async fn list_committed_intervals(
        &self,
        mechanic_id: Ulid,
        window: Span,
    ) -> Result<Vec<CommittedInterval>, EngineError> {
        self.committed_intervals(mechanic_id, window).await
    }

    async fn create_visit(&self, visit: NewVisit) -> Result<Visit, EngineError> {
        Engine::create_visit(self, visit).await
    }

    async fn update_visit_status(&self, visit_id: Ulid, status: VisitStatus) -> Result<Visit, EngineError> {
        Engine::update_visit_status(self, visit_id, status).await
    }
}
