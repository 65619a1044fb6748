//! Order Store: persists a user-defined sidebar ordering and applies it to
//! a live list of session names (spec §4.7). Writes are atomic whole-file
//! rewrites, matching the teacher's projects.json persistence idiom.

use crate::error::OrderError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const ORDER_FILE: &str = "session-order.json";

pub struct OrderStore {
    path: PathBuf,
    order: Mutex<Vec<String>>,
}

impl OrderStore {
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(ORDER_FILE);
        let order = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            path,
            order: Mutex::new(order),
        }
    }

    pub fn get(&self) -> Vec<String> {
        self.order.lock().expect("order lock").clone()
    }

    /// Replace the saved order. Duplicates in `list` are forbidden by the
    /// data model; the caller is expected to pass a deduplicated list, but
    /// this dedups defensively (keeping first occurrence) to preserve the
    /// no-duplicates invariant even under a buggy caller.
    pub fn save(&self, list: Vec<String>) -> Result<(), OrderError> {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = list.into_iter().filter(|n| seen.insert(n.clone())).collect();
        {
            let mut guard = self.order.lock().expect("order lock");
            *guard = deduped;
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), OrderError> {
        let guard = self.order.lock().expect("order lock");
        let data = serde_json::to_vec_pretty(&*guard).map_err(|e| OrderError::Io(std::io::Error::other(e)))?;
        drop(guard);
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(OrderError::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(OrderError::Io)?;
        Ok(())
    }

    /// Apply the saved order to a live list of session names: known
    /// sessions first in saved order, then unknown sessions in the order
    /// the caller supplied them. The result is always a permutation of
    /// `sessions` — no drops, no duplicates.
    pub fn apply(&self, sessions: &[String]) -> Vec<String> {
        let saved = self.get();
        let live: std::collections::HashSet<&String> = sessions.iter().collect();

        let mut result: Vec<String> = saved.iter().filter(|n| live.contains(n)).cloned().collect();
        let placed: std::collections::HashSet<&String> = result.iter().collect();
        for name in sessions {
            if !placed.contains(name) {
                result.push(name.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OrderStore::load(tmp.path());
        store.save(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        assert_eq!(store.get(), vec!["a", "b", "c"]);
    }

    #[test]
    fn save_persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OrderStore::load(tmp.path());
        store.save(vec!["a".into(), "b".into()]).unwrap();
        let reloaded = OrderStore::load(tmp.path());
        assert_eq!(reloaded.get(), vec!["a", "b"]);
    }

    #[test]
    fn apply_places_known_first_then_unknown_in_server_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OrderStore::load(tmp.path());
        store.save(vec!["b".into(), "a".into()]).unwrap();

        let live = vec!["a".to_string(), "c".to_string(), "b".to_string()];
        let applied = store.apply(&live);
        assert_eq!(applied, vec!["b", "a", "c"]);
    }

    #[test]
    fn apply_is_a_permutation_no_drops_no_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OrderStore::load(tmp.path());
        store.save(vec!["x".into(), "gone".into()]).unwrap();

        let live = vec!["a".to_string(), "b".to_string(), "x".to_string()];
        let mut applied = store.apply(&live);
        applied.sort();
        let mut expected = live.clone();
        expected.sort();
        assert_eq!(applied, expected);
    }

    #[test]
    fn save_deduplicates_defensively() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OrderStore::load(tmp.path());
        store.save(vec!["a".into(), "a".into(), "b".into()]).unwrap();
        assert_eq!(store.get(), vec!["a", "b"]);
    }
}
