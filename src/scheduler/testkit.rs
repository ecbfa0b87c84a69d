use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{HOUR_MS, MINUTE_MS, Ms, NewVisit, Span, Visit};
use crate::notify::NotifyHub;

use super::Scheduler;

/// 2030-01-07T00:00:00Z, a Monday.
pub const MIDNIGHT: Ms = 1_893_974_400_000;

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

pub fn at(hour: i64, minute: i64) -> Ms {
    MIDNIGHT + hour * HOUR_MS + minute * MINUTE_MS
}

pub fn wal_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("workbay_test");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{name}_{}.wal", Ulid::new()))
}

pub fn setup(name: &str) -> (Arc<Engine>, Arc<Scheduler>) {
    let engine = Engine::new(wal_path(name), Arc::new(NotifyHub::new())).unwrap();
    (Arc::new(engine), Arc::new(Scheduler::default()))
}

pub async fn add_mechanic(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine.create_mechanic(id, name.to_string()).await.unwrap();
    id
}

pub async fn book(engine: &Engine, mechanic_id: Ulid, start: Ms, end: Ms) -> Visit {
    engine
        .create_visit(NewVisit {
            id: Ulid::new(),
            mechanic_id,
            client_id: Ulid::new(),
            vehicle_id: Ulid::new(),
            service_ids: vec![Ulid::new()],
            span: Span::new(start, end),
        })
        .await
        .unwrap()
}
