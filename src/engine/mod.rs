pub(crate) mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use store::VisitStore;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedMechanicState = Arc<RwLock<MechanicState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // A compaction queued behind appends runs only after they are durable.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch (callers are told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One shop's board: every mechanic and their visits, durable through the WAL.
pub struct Engine {
    pub(super) mechanics: DashMap<Ulid, SharedMechanicState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: visit id → mechanic id
    pub(super) visit_to_mechanic: DashMap<Ulid, Ulid>,
    /// Serializes adding and removing mechanics against compaction.
    pub(super) catalog: Mutex<()>,
}

/// Apply a visit event to a mechanic (no locking, caller holds the lock).
fn apply_to_mechanic(ms: &mut MechanicState, event: &Event, visit_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::VisitBooked {
            id,
            mechanic_id,
            client_id,
            vehicle_id,
            service_ids,
            span,
            at,
        } => {
            ms.insert_visit(Visit {
                id: *id,
                client_id: *client_id,
                vehicle_id: *vehicle_id,
                mechanic_id: *mechanic_id,
                service_ids: service_ids.clone(),
                span: *span,
                status: VisitStatus::INITIAL,
                created_at: *at,
                updated_at: *at,
            });
            visit_map.insert(*id, *mechanic_id);
        }
        Event::VisitAdvanced { id, status, at, .. } => {
            if let Some(v) = ms.visit_mut(*id) {
                v.status = *status;
                v.updated_at = *at;
            }
        }
        Event::VisitDeleted { id, .. } => {
            ms.remove_visit(*id);
            visit_map.remove(id);
        }
        // MechanicCreated/Deleted are handled at the DashMap level, not here
        Event::MechanicCreated { .. } | Event::MechanicDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay `wal_path` and start the writer task. Must be called inside a
    /// tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            mechanics: DashMap::new(),
            wal_tx,
            notify,
            visit_to_mechanic: DashMap::new(),
            catalog: Mutex::new(()),
        };

        // Rebuild plain state first, wrap it in locks once replay is done.
        let mut replayed: HashMap<Ulid, MechanicState> = HashMap::new();
        for event in &events {
            match event {
                Event::MechanicCreated { id, name } => {
                    replayed.insert(*id, MechanicState::new(*id, name.clone()));
                }
                Event::MechanicDeleted { id } => {
                    replayed.remove(id);
                }
                other => {
                    if let Some(ms) = replayed.get_mut(&other.mechanic_id()) {
                        apply_to_mechanic(ms, other, &engine.visit_to_mechanic);
                    }
                }
            }
        }
        let visits: usize = replayed.values().map(|ms| ms.visits.len()).sum();
        for (id, ms) in replayed {
            engine.mechanics.insert(id, Arc::new(RwLock::new(ms)));
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events from {}: {} mechanics, {visits} visits",
                events.len(),
                wal_path.display(),
                engine.mechanics.len()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_mechanic(&self, id: &Ulid) -> Option<SharedMechanicState> {
        self.mechanics.get(id).map(|e| e.value().clone())
    }

    pub fn get_mechanic_for_visit(&self, visit_id: &Ulid) -> Option<Ulid> {
        self.visit_to_mechanic.get(visit_id).map(|e| *e.value())
    }

    /// WAL-append, then apply, then notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        mechanic_id: Ulid,
        ms: &mut MechanicState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_mechanic(ms, event, &self.visit_to_mechanic);
        self.notify.send(mechanic_id, event);
        Ok(())
    }

    /// Lookup visit → mechanic, acquire that mechanic's write lock.
    pub(super) async fn resolve_visit_write(
        &self,
        visit_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<MechanicState>), EngineError> {
        let mechanic_id = self
            .get_mechanic_for_visit(visit_id)
            .ok_or(EngineError::NotFound(*visit_id))?;
        let ms = self
            .get_mechanic(&mechanic_id)
            .ok_or(EngineError::NotFound(*visit_id))?;
        let guard = ms.write_owned().await;
        // Deleted while we waited for the lock.
        if guard.visit(*visit_id).is_none() {
            return Err(EngineError::NotFound(*visit_id));
        }
        Ok((mechanic_id, guard))
    }
}
