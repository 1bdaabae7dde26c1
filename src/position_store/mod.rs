//! Durable open-position bookkeeping.
//!
//! One JSON file per wallet (`data/positions_<shortaddr>.json`) maps
//! token id → position record. Every mutation rewrites the file via
//! write-to-temp-then-rename, so a crash can never leave a torn file.
//! The ordering contract: a position reaches disk before it reaches the
//! in-memory map on entry, and leaves the in-memory map before it leaves
//! disk on exit — on-disk state is always a superset of memory.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::VenueTag;
use crate::orderbook::Side;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Exiting,
    Closed,
    Failed,
}

/// One order of a (possibly multi-leg) position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLeg {
    pub token_id: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub venue: VenueTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Legs sharing a group are exited together.
    pub group_id: String,
    pub strategy_name: String,
    pub question: String,
    pub legs: Vec<PositionLeg>,
    pub entry_time: DateTime<Utc>,
    /// Exit trigger for single-leg positions (entry × sell multiplier).
    pub target_price: Option<Decimal>,
    pub status: PositionStatus,
    /// Set by the streamer on adverse ticks; observed by the monitor loop.
    pub force_exit: bool,
}

impl Position {
    #[inline]
    pub fn is_pair(&self) -> bool {
        self.legs.len() >= 2
    }

    #[inline]
    pub fn token_ids(&self) -> Vec<String> {
        self.legs.iter().map(|l| l.token_id.clone()).collect()
    }

    /// Per-unit entry cost: the sum of leg entry prices.
    #[inline]
    pub fn entry_cost_per_unit(&self) -> Decimal {
        self.legs.iter().map(|l| l.entry_price).sum()
    }

    /// Dollars committed at entry.
    #[inline]
    pub fn committed_capital(&self) -> Decimal {
        self.legs.iter().map(|l| l.entry_price * l.size).sum()
    }
}

pub struct PositionStore {
    filepath: PathBuf,
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionStore {
    /// Opens (or creates) the store at `filepath`. A corrupt file is
    /// renamed aside with a timestamp suffix and replaced by an empty
    /// store; the engine never aborts on a bad file.
    pub fn open(filepath: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = filepath.parent() {
            fs::create_dir_all(parent)?;
        }

        let positions = match fs::read_to_string(&filepath) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Position>>(&raw) {
                Ok(map) => {
                    info!("📂 Loaded {} positions from {}", map.len(), filepath.display());
                    map
                }
                Err(e) => {
                    let ts = Utc::now().format("%Y%m%d_%H%M%S");
                    let backup = filepath.with_extension(format!("corrupt_{}.json", ts));
                    match fs::rename(&filepath, &backup) {
                        Ok(()) => error!(
                            "Failed to load positions: {}. Backed up to {}",
                            e,
                            backup.display()
                        ),
                        Err(be) => error!("Failed to backup corrupted positions file: {}", be),
                    }
                    HashMap::new()
                }
            },
            Err(_) => {
                info!("No existing positions file at {}", filepath.display());
                HashMap::new()
            }
        };

        Ok(Self {
            filepath,
            positions: RwLock::new(positions),
        })
    }

    fn persist(&self, map: &HashMap<String, Position>) -> Result<(), StoreError> {
        let tmp_path = self.filepath.with_extension("tmp");
        let json = serde_json::to_string_pretty(map)?;
        fs::write(&tmp_path, json)?;
        // Atomic on POSIX.
        fs::rename(&tmp_path, &self.filepath)?;
        Ok(())
    }

    /// Registers a position under every one of its token ids. Disk write
    /// happens first; memory is only updated once the file is durable.
    pub fn add(&self, position: Position) -> Result<(), StoreError> {
        let mut map = self.positions.write();

        let mut staged = map.clone();
        for token_id in position.token_ids() {
            staged.insert(token_id, position.clone());
        }
        self.persist(&staged)?;
        *map = staged;

        info!(
            "💾 Saved position {} ({} legs, ${:.4}/unit)",
            position.group_id,
            position.legs.len(),
            position.entry_cost_per_unit()
        );
        Ok(())
    }

    pub fn get(&self, token_id: &str) -> Option<Position> {
        self.positions.read().get(token_id).cloned()
    }

    pub fn has(&self, token_id: &str) -> bool {
        self.positions.read().contains_key(token_id)
    }

    /// Removes every entry that shares the position's group. Memory is
    /// updated first; a failed disk write leaves disk as a superset and
    /// is reported as critical.
    pub fn remove(&self, token_id: &str) -> Option<Position> {
        let mut map = self.positions.write();
        let position = map.remove(token_id)?;

        let group = position.group_id.clone();
        map.retain(|_, p| p.group_id != group);

        if let Err(e) = self.persist(&map) {
            error!("CRITICAL: failed to persist removal of {}: {}", group, e);
        } else {
            info!("🗑️ Removed position {}", group);
        }
        Some(position)
    }

    /// Applies `mutate` to the position under `token_id` (and its group
    /// twins) and persists. Returns false if no such position exists.
    pub fn update<F>(&self, token_id: &str, mutate: F) -> bool
    where
        F: Fn(&mut Position),
    {
        let mut map = self.positions.write();
        let Some(group) = map.get(token_id).map(|p| p.group_id.clone()) else {
            return false;
        };

        for position in map.values_mut().filter(|p| p.group_id == group) {
            mutate(position);
        }

        if let Err(e) = self.persist(&map) {
            warn!("Failed to persist update of {}: {}", token_id, e);
        }
        true
    }

    /// Snapshot of all positions, deduplicated by group.
    pub fn get_all(&self) -> Vec<Position> {
        let map = self.positions.read();
        let mut seen = std::collections::HashSet::new();
        map.values()
            .filter(|p| seen.insert(p.group_id.clone()))
            .cloned()
            .collect()
    }

    pub fn get_by_strategy(&self, strategy_name: &str) -> Vec<Position> {
        self.get_all()
            .into_iter()
            .filter(|p| p.strategy_name == strategy_name)
            .collect()
    }

    pub fn count(&self) -> usize {
        let map = self.positions.read();
        let mut seen = std::collections::HashSet::new();
        map.values().filter(|p| seen.insert(p.group_id.clone())).count()
    }

    pub fn committed_capital(&self) -> Decimal {
        self.get_all()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.committed_capital())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(group: &str, tokens: &[&str]) -> Position {
        Position {
            group_id: group.to_string(),
            strategy_name: "TestStrategy".to_string(),
            question: "Will it?".to_string(),
            legs: tokens
                .iter()
                .map(|t| PositionLeg {
                    token_id: t.to_string(),
                    side: Side::Buy,
                    entry_price: dec!(0.40),
                    size: dec!(10),
                    venue: VenueTag::Primary,
                })
                .collect(),
            entry_time: Utc::now(),
            target_price: None,
            status: PositionStatus::Open,
            force_exit: false,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions_test.json");

        {
            let store = PositionStore::open(path.clone()).unwrap();
            store.add(sample_position("G1", &["t1", "t2"])).unwrap();
            assert!(store.has("t1"));
            assert!(store.has("t2"));
        }

        // Fresh open sees the same state.
        let store = PositionStore::open(path).unwrap();
        assert_eq!(store.count(), 1);
        let restored = store.get("t1").unwrap();
        assert_eq!(restored.group_id, "G1");
        assert_eq!(restored.entry_cost_per_unit(), dec!(0.80));
    }

    #[test]
    fn corrupt_file_is_backed_up_and_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions_test.json");
        fs::write(&path, "{not valid json").unwrap();

        let store = PositionStore::open(path.clone()).unwrap();
        assert_eq!(store.count(), 0);

        // The corrupt original was renamed aside.
        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt_"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn remove_clears_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("p.json")).unwrap();
        store.add(sample_position("G1", &["t1", "t2"])).unwrap();

        let removed = store.remove("t1").unwrap();
        assert_eq!(removed.group_id, "G1");
        assert!(!store.has("t2"));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn update_touches_group_twins() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("p.json")).unwrap();
        store.add(sample_position("G1", &["t1", "t2"])).unwrap();

        assert!(store.update("t1", |p| p.force_exit = true));
        assert!(store.get("t2").unwrap().force_exit);
        assert!(!store.update("missing", |p| p.force_exit = true));
    }

    #[test]
    fn filters_by_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("p.json")).unwrap();

        store.add(sample_position("G1", &["t1"])).unwrap();
        let mut other = sample_position("G2", &["t2"]);
        other.strategy_name = "Other".to_string();
        store.add(other).unwrap();

        assert_eq!(store.get_by_strategy("TestStrategy").len(), 1);
        assert_eq!(store.get_by_strategy("Other").len(), 1);
        assert_eq!(store.get_by_strategy("None").len(), 0);
    }
}
