use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine, WAL and compactor per shop. A shop is the database name the
/// client connects to; shops never see each other's mechanics or visits.
pub struct ShopManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Held while opening a new shop so two connections can't both open its WAL.
    opening: Mutex<()>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn sanitize(shop: &str) -> io::Result<String> {
    if shop.len() > MAX_SHOP_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "shop name too long"));
    }
    let safe: String = shop
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty shop name"));
    }
    Ok(safe)
}

impl ShopManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            opening: Mutex::new(()),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `shop`, replaying its WAL.
    pub fn get_or_create(&self, shop: &str) -> io::Result<Arc<Engine>> {
        let key = sanitize(shop)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }

        let _opening = self.opening.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_SHOPS {
            return Err(io::Error::other("too many shops"));
        }

        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(key.clone(), engine.clone());
        metrics::gauge!(crate::observability::SHOPS_ACTIVE).set(self.engines.len() as f64);
        info!("shop {key} opened ({} mechanics)", engine.mechanic_count());
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
