use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedMechanicState};

impl Engine {
    /// All mechanics, ordered by name then id.
    pub async fn list_mechanics(&self) -> Vec<Mechanic> {
        // Collect first: never hold a DashMap shard across an await.
        let states: Vec<SharedMechanicState> = self.mechanics.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for ms in states {
            out.push(ms.read().await.info());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Visits on `mechanic_id` overlapping `window`, ascending by start.
    pub async fn committed_intervals(
        &self,
        mechanic_id: Ulid,
        window: Span,
    ) -> Result<Vec<CommittedInterval>, EngineError> {
        let ms = self
            .get_mechanic(&mechanic_id)
            .ok_or(EngineError::ResourceNotFound(mechanic_id))?;
        let guard = ms.read().await;
        Ok(guard.committed_intervals(&window))
    }

    pub async fn get_visit(&self, visit_id: Ulid) -> Result<Visit, EngineError> {
        let mechanic_id = self
            .get_mechanic_for_visit(&visit_id)
            .ok_or(EngineError::NotFound(visit_id))?;
        let ms = self
            .get_mechanic(&mechanic_id)
            .ok_or(EngineError::NotFound(visit_id))?;
        let guard = ms.read().await;
        guard.visit(visit_id).cloned().ok_or(EngineError::NotFound(visit_id))
    }

    /// Every visit, or one mechanic's, ordered by start then id.
    pub async fn list_visits(&self, mechanic_id: Option<Ulid>) -> Result<Vec<Visit>, EngineError> {
        let states: Vec<SharedMechanicState> = match mechanic_id {
            Some(id) => vec![self.get_mechanic(&id).ok_or(EngineError::ResourceNotFound(id))?],
            None => self.mechanics.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for ms in states {
            out.extend(ms.read().await.visits.iter().cloned());
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn mechanic_count(&self) -> usize {
        self.mechanics.len()
    }
}
