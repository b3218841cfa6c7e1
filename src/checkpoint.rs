//! Checkpoint store: atomic snapshot of a session's ledger, positions,
//! orders and NBBO cache, used to truncate the WAL and to recover a
//! session after a restart.

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::TimestampNs;
use crate::models::{AccountState, Nbbo, Order, Position};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub session_id: String,
    pub checkpoint_ns: i64,
    pub last_event_ns: TimestampNs,
    pub events_processed: u64,
    pub account: AccountState,
    pub positions: Vec<(String, Position)>,
    pub orders: Vec<Order>,
    pub nbbo_cache: Vec<(String, Nbbo)>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            checkpoint_ns: 0,
            last_event_ns: 0,
            events_processed: 0,
            account: AccountState::new(0.0),
            positions: Vec::new(),
            orders: Vec::new(),
            nbbo_cache: Vec::new(),
        }
    }
}

impl Checkpoint {
    pub fn positions_map(&self) -> FxHashMap<String, Position> {
        self.positions.iter().cloned().collect()
    }

    pub fn nbbo_map(&self) -> FxHashMap<String, Nbbo> {
        self.nbbo_cache.iter().cloned().collect()
    }
}

pub fn checkpoint_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("session_{session_id}.ckpt.json"))
}

pub fn wal_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("session_{session_id}.wal.jsonl"))
}

/// Serializes to JSON and writes via a temp file + atomic rename, so a
/// crash mid-write never leaves a half-written checkpoint in place.
pub fn save_checkpoint(ckpt: &Checkpoint, dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir, &ckpt.session_id);
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(ckpt)?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Returns `None` if the file is missing or fails to parse; a malformed
/// checkpoint is logged and treated as "no checkpoint", not a hard error.
pub fn load_checkpoint(session_id: &str, dir: &Path) -> Option<Checkpoint> {
    let path = checkpoint_path(dir, session_id);
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(ckpt) => Some(ckpt),
        Err(e) => {
            tracing::warn!(session_id, error = %e, "corrupt checkpoint, starting fresh");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let mut ckpt = Checkpoint {
            session_id: "abc".to_string(),
            checkpoint_ns: 123,
            last_event_ns: 99,
            events_processed: 7,
            ..Default::default()
        };
        ckpt.positions.push(("AAPL".to_string(), Position::default()));
        save_checkpoint(&ckpt, dir.path()).unwrap();

        let loaded = load_checkpoint("abc", dir.path()).unwrap();
        assert_eq!(loaded.last_event_ns, 99);
        assert_eq!(loaded.events_processed, 7);
        assert_eq!(loaded.positions.len(), 1);
    }

    #[test]
    fn missing_checkpoint_returns_none() {
        let dir = tempdir().unwrap();
        assert!(load_checkpoint("nope", dir.path()).is_none());
    }

    #[test]
    fn corrupt_checkpoint_returns_none_not_error() {
        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "bad");
        fs::write(&path, "{ this is not json").unwrap();
        assert!(load_checkpoint("bad", dir.path()).is_none());
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "partial");
        fs::write(&path, r#"{"session_id": "partial"}"#).unwrap();
        let loaded = load_checkpoint("partial", dir.path()).unwrap();
        assert_eq!(loaded.last_event_ns, 0);
        assert_eq!(loaded.events_processed, 0);
    }
}
