use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::scheduler::lifecycle;

use super::conflict::{check_no_conflict, now_ms, validate_services, validate_span};
use super::{Engine, EngineError, SharedMechanicState, WalCommand};

impl Engine {
    pub async fn create_mechanic(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::invalid("mechanic name is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("mechanic name too long"));
        }
        let _catalog = self.catalog.lock().await;
        if self.mechanics.len() >= MAX_MECHANICS_PER_SHOP {
            return Err(EngineError::LimitExceeded("too many mechanics"));
        }
        if self.mechanics.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::MechanicCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.mechanics
            .insert(id, Arc::new(RwLock::new(MechanicState::new(id, name))));
        self.notify.send(id, &event);
        info!("mechanic {id} created");
        Ok(())
    }

    /// Only a mechanic with no visits at all (any status) can be removed.
    pub async fn delete_mechanic(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let ms = self.get_mechanic(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let guard = ms.write().await;
        if !guard.visits.is_empty() {
            return Err(EngineError::HasVisits(id));
        }

        let event = Event::MechanicDeleted { id };
        self.wal_append(&event).await?;
        self.mechanics.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("mechanic {id} deleted");
        Ok(())
    }

    /// The conditional write: insert `visit` only if its span overlaps no
    /// committed visit on the mechanic. Check, append and apply all happen
    /// under the mechanic's write lock.
    pub async fn create_visit(&self, visit: NewVisit) -> Result<Visit, EngineError> {
        validate_span(&visit.span)?;
        validate_services(&visit.service_ids)?;
        let mechanic_id = visit.mechanic_id;
        let ms = self
            .get_mechanic(&mechanic_id)
            .ok_or(EngineError::ResourceNotFound(mechanic_id))?;
        let mut guard = ms.write().await;
        // A delete may have won the lock first.
        if !self.mechanics.contains_key(&mechanic_id) {
            return Err(EngineError::ResourceNotFound(mechanic_id));
        }
        if guard.visits.len() >= MAX_VISITS_PER_MECHANIC {
            return Err(EngineError::LimitExceeded("too many visits on mechanic"));
        }
        check_no_conflict(&guard, &visit.span)?;
        // Visit ids are unique across mechanics, and other mechanics' locks
        // are not held here. Claim the id before the append.
        match self.visit_to_mechanic.entry(visit.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(visit.id)),
            Entry::Vacant(slot) => {
                slot.insert(mechanic_id);
            }
        }

        let event = Event::VisitBooked {
            id: visit.id,
            mechanic_id,
            client_id: visit.client_id,
            vehicle_id: visit.vehicle_id,
            service_ids: visit.service_ids,
            span: visit.span,
            at: now_ms(),
        };
        if let Err(e) = self.persist_and_apply(mechanic_id, &mut guard, &event).await {
            self.visit_to_mechanic.remove(&visit.id);
            return Err(e);
        }
        guard
            .visit(visit.id)
            .cloned()
            .ok_or(EngineError::NotFound(visit.id))
    }

    /// One lifecycle step, checked against the status under the write lock.
    pub async fn update_visit_status(&self, visit_id: Ulid, status: VisitStatus) -> Result<Visit, EngineError> {
        let (mechanic_id, mut guard) = self.resolve_visit_write(&visit_id).await?;
        let mut next = guard
            .visit(visit_id)
            .cloned()
            .ok_or(EngineError::NotFound(visit_id))?;
        lifecycle::advance(&mut next, status, now_ms())?;

        let event = Event::VisitAdvanced {
            id: visit_id,
            mechanic_id,
            status,
            at: next.updated_at,
        };
        self.persist_and_apply(mechanic_id, &mut guard, &event).await?;
        Ok(next)
    }

    /// Administrative removal, whatever the status. Frees the interval.
    pub async fn delete_visit(&self, visit_id: Ulid) -> Result<Visit, EngineError> {
        let (mechanic_id, mut guard) = self.resolve_visit_write(&visit_id).await?;
        let visit = guard
            .visit(visit_id)
            .cloned()
            .ok_or(EngineError::NotFound(visit_id))?;

        let event = Event::VisitDeleted { id: visit_id, mechanic_id };
        self.persist_and_apply(mechanic_id, &mut guard, &event).await?;
        warn!("visit {visit_id} ({}) deleted from mechanic {mechanic_id}", visit.status);
        Ok(visit)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    ///
    /// The catalog lock and a read lock on every mechanic are held until the
    /// new file is in place. Every writer appends while holding one of those,
    /// so no event can slip in between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let catalog = self.catalog.lock().await;
        let mut states: Vec<(Ulid, SharedMechanicState)> = self
            .mechanics
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(states.len());
        for (_, ms) in &states {
            guards.push(ms.read().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::MechanicCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for visit in &guard.visits {
                events.push(Event::VisitBooked {
                    id: visit.id,
                    mechanic_id: guard.id,
                    client_id: visit.client_id,
                    vehicle_id: visit.vehicle_id,
                    service_ids: visit.service_ids.clone(),
                    span: visit.span,
                    at: visit.created_at,
                });
                if visit.status != VisitStatus::INITIAL {
                    events.push(Event::VisitAdvanced {
                        id: visit.id,
                        mechanic_id: guard.id,
                        status: visit.status,
                        at: visit.updated_at,
                    });
                }
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(catalog);

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
