//! Technology priority per operation family.
//!
//! A [`PriorityList`] is a validated, duplicate-free, never-empty ordering
//! of technologies capable of one family. The [`PriorityStore`] holds one
//! list per family and exposes exactly two mutation primitives, `swap_up`
//! and `reset`. There is no "set priority N": every stored ordering is
//! reachable from the catalog default through adjacent swaps, so an
//! invalid or partial ordering can never reach storage.
//!
//! ## Write protocol
//!
//! 1. Build the new list from the current one (or the catalog default).
//! 2. Validate it against the catalog.
//! 3. Persist it through the [`PersistenceSink`].
//! 4. Only then replace the in-memory list.
//!
//! If step 2 or 3 fails the previous list stays in place, both in memory
//! and on disk.

use crate::catalog::{OperationFamily, TechnologyCatalog, TechnologyId};
use crate::error::DocOpsError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Ordered, validated technology ids for one family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityList {
    family: OperationFamily,
    ids: Vec<TechnologyId>,
}

impl PriorityList {
    /// Validate `ids` for `family`: non-empty, unique, every id known to
    /// the catalog and capable of the family.
    pub fn new(
        family: OperationFamily,
        ids: Vec<TechnologyId>,
        catalog: &TechnologyCatalog,
    ) -> Result<Self, DocOpsError> {
        let invalid = |reason: String| DocOpsError::InvalidPriorityList {
            family: family.clone(),
            reason,
        };
        if ids.is_empty() {
            return Err(invalid("list is empty".into()));
        }
        let mut seen = HashSet::new();
        for id in &ids {
            if !seen.insert(id) {
                return Err(invalid(format!("'{id}' appears more than once")));
            }
            match catalog.technology(id) {
                None => return Err(invalid(format!("unknown technology '{id}'"))),
                Some(t) if !t.supports(&family) => {
                    return Err(invalid(format!("'{id}' cannot perform '{family}'")))
                }
                Some(_) => {}
            }
        }
        Ok(Self { family, ids })
    }

    /// The catalog's declared default ordering.
    pub fn default_for(
        family: &OperationFamily,
        catalog: &TechnologyCatalog,
    ) -> Result<Self, DocOpsError> {
        Self::new(family.clone(), catalog.default_order(family), catalog)
    }

    /// Repair a stored ordering: drop unknown, incapable and duplicate ids,
    /// append capable ids the stored list does not mention (in default
    /// order). Falls back to the default when nothing usable remains.
    ///
    /// Returns the list and the ids that were dropped.
    pub fn sanitize(
        family: &OperationFamily,
        stored: &[TechnologyId],
        catalog: &TechnologyCatalog,
    ) -> Result<(Self, Vec<TechnologyId>), DocOpsError> {
        let mut kept: Vec<TechnologyId> = Vec::with_capacity(stored.len());
        let mut dropped = Vec::new();
        for id in stored {
            let capable = catalog.technology(id).is_some_and(|t| t.supports(family));
            if capable && !kept.contains(id) {
                kept.push(id.clone());
            } else {
                dropped.push(id.clone());
            }
        }
        if kept.is_empty() {
            return Ok((Self::default_for(family, catalog)?, dropped));
        }
        for id in catalog.default_order(family) {
            if !kept.contains(&id) {
                kept.push(id);
            }
        }
        Ok((Self::new(family.clone(), kept, catalog)?, dropped))
    }

    pub fn family(&self) -> &OperationFamily {
        &self.family
    }

    pub fn ids(&self) -> &[TechnologyId] {
        &self.ids
    }

    /// Exchange entries `index - 1` and `index`.
    ///
    /// `Ok(None)` when `index == 0` (nothing above the first entry).
    fn swapped_up(&self, index: usize) -> Result<Option<Vec<TechnologyId>>, DocOpsError> {
        if index >= self.ids.len() {
            return Err(DocOpsError::IndexOutOfRange {
                index,
                len: self.ids.len(),
            });
        }
        if index == 0 {
            return Ok(None);
        }
        let mut ids = self.ids.clone();
        ids.swap(index - 1, index);
        Ok(Some(ids))
    }
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Key-value persistence for priority lists, keyed by family name.
///
/// Implementations must make `store` atomic per key: either the new value
/// is fully written or the previous value is still readable.
pub trait PersistenceSink: Send + Sync {
    /// All stored lists. Keys that are not valid family names are ignored
    /// by the store.
    fn load_all(&self) -> Result<HashMap<String, Vec<TechnologyId>>, DocOpsError>;

    fn store(&self, family: &OperationFamily, ids: &[TechnologyId]) -> Result<(), DocOpsError>;
}

/// Ephemeral sink; nothing survives the process.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<HashMap<String, Vec<TechnologyId>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated sink, e.g. to simulate lists saved by an older build.
    pub fn with_entries(entries: HashMap<String, Vec<TechnologyId>>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl PersistenceSink for MemorySink {
    fn load_all(&self) -> Result<HashMap<String, Vec<TechnologyId>>, DocOpsError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn store(&self, family: &OperationFamily, ids: &[TechnologyId]) -> Result<(), DocOpsError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(family.to_string(), ids.to_vec());
        Ok(())
    }
}

/// All lists in one JSON object file: `{"compress": ["adobe", "pdf_lib"]}`.
///
/// Writes go to a temp file in the same directory which is then renamed
/// over the target, so a crash mid-write never leaves a truncated file.
pub struct JsonFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, Vec<TechnologyId>>, DocOpsError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(DocOpsError::Persistence {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| DocOpsError::CorruptPriorityStore {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    fn write_map(&self, map: &BTreeMap<String, Vec<TechnologyId>>) -> Result<(), DocOpsError> {
        let io_err = |source: std::io::Error| DocOpsError::Persistence {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| DocOpsError::Internal(format!("serialise priorities: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl PersistenceSink for JsonFileSink {
    fn load_all(&self) -> Result<HashMap<String, Vec<TechnologyId>>, DocOpsError> {
        Ok(self.read_map()?.into_iter().collect())
    }

    fn store(&self, family: &OperationFamily, ids: &[TechnologyId]) -> Result<(), DocOpsError> {
        let _lock = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        map.insert(family.to_string(), ids.to_vec());
        self.write_map(&map)?;
        debug!("Persisted priorities for '{}' to {}", family, self.path.display());
        Ok(())
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// One [`PriorityList`] per family, backed by a [`PersistenceSink`].
pub struct PriorityStore {
    lists: RwLock<HashMap<OperationFamily, PriorityList>>,
    sink: Arc<dyn PersistenceSink>,
}

impl PriorityStore {
    /// Load stored lists and sanitise them against `catalog`. Families
    /// without a stored list start from the catalog default.
    pub fn load(
        catalog: &TechnologyCatalog,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, DocOpsError> {
        let stored = sink.load_all()?;
        let mut lists = HashMap::new();
        for spec in catalog.families() {
            let family = &spec.family;
            let list = match stored.get(family.as_str()) {
                Some(ids) => {
                    let (list, dropped) = PriorityList::sanitize(family, ids, catalog)?;
                    if !dropped.is_empty() {
                        warn!(
                            "Dropped {} stale priority entries for '{}': {:?}",
                            dropped.len(),
                            family,
                            dropped
                        );
                    }
                    list
                }
                None => PriorityList::default_for(family, catalog)?,
            };
            lists.insert(family.clone(), list);
        }
        for key in stored.keys() {
            if OperationFamily::new(key.as_str())
                .map(|f| catalog.family_spec(&f).is_none())
                .unwrap_or(true)
            {
                warn!("Ignoring stored priorities for unknown family '{}'", key);
            }
        }
        Ok(Self {
            lists: RwLock::new(lists),
            sink,
        })
    }

    /// Re-sanitise every list against a refreshed catalog. Families the
    /// catalog introduced start from its default; families it no longer
    /// declares are dropped. Nothing is written to the sink: the stored
    /// lists are repaired again on the next [`PriorityStore::load`].
    pub fn adopt_catalog(&self, catalog: &TechnologyCatalog) {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::with_capacity(catalog.families().len());
        for spec in catalog.families() {
            let family = &spec.family;
            let adopted = match lists.get(family) {
                Some(current) => PriorityList::sanitize(family, current.ids(), catalog).map(
                    |(list, dropped)| {
                        if !dropped.is_empty() {
                            warn!(
                                "Dropped {} stale priority entries for '{}' after catalog refresh: {:?}",
                                dropped.len(),
                                family,
                                dropped
                            );
                        }
                        list
                    },
                ),
                None => {
                    debug!("Adopted default priorities for new family '{}'", family);
                    PriorityList::default_for(family, catalog)
                }
            };
            match adopted {
                Ok(list) => {
                    next.insert(family.clone(), list);
                }
                Err(e) => warn!("Cannot adopt priorities for '{}': {}", family, e),
            }
        }
        for family in lists.keys().filter(|f| !next.contains_key(*f)) {
            debug!("Family '{}' left the catalog; dropping its priorities", family);
        }
        *lists = next;
    }

    /// Current list for `family`.
    pub fn get(&self, family: &OperationFamily) -> Result<PriorityList, DocOpsError> {
        self.lists
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(family)
            .cloned()
            .ok_or_else(|| DocOpsError::UnknownFamily(family.to_string()))
    }

    /// Move the entry at `index` one place up. No-op when `index == 0`.
    pub fn swap_up(
        &self,
        family: &OperationFamily,
        index: usize,
        catalog: &TechnologyCatalog,
    ) -> Result<PriorityList, DocOpsError> {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        let current = lists
            .get(family)
            .ok_or_else(|| DocOpsError::UnknownFamily(family.to_string()))?;
        let Some(ids) = current.swapped_up(index)? else {
            return Ok(current.clone());
        };
        let next = PriorityList::new(family.clone(), ids, catalog)?;
        self.sink.store(family, next.ids())?;
        info!("Priority for '{}' is now {:?}", family, next.ids());
        lists.insert(family.clone(), next.clone());
        Ok(next)
    }

    /// Replace the list with the catalog default.
    pub fn reset(
        &self,
        family: &OperationFamily,
        catalog: &TechnologyCatalog,
    ) -> Result<PriorityList, DocOpsError> {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        if !lists.contains_key(family) && catalog.family_spec(family).is_none() {
            return Err(DocOpsError::UnknownFamily(family.to_string()));
        }
        let next = PriorityList::default_for(family, catalog)?;
        self.sink.store(family, next.ids())?;
        info!("Priority for '{}' reset to {:?}", family, next.ids());
        lists.insert(family.clone(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fam(name: &str) -> OperationFamily {
        OperationFamily::new(name).unwrap()
    }

    fn ids(list: &[&str]) -> Vec<TechnologyId> {
        list.iter().map(|s| TechnologyId::new(*s)).collect()
    }

    struct FailingSink;

    impl PersistenceSink for FailingSink {
        fn load_all(&self) -> Result<HashMap<String, Vec<TechnologyId>>, DocOpsError> {
            Ok(HashMap::new())
        }

        fn store(&self, _: &OperationFamily, _: &[TechnologyId]) -> Result<(), DocOpsError> {
            Err(DocOpsError::Persistence {
                path: PathBuf::from("/dev/full"),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    #[test]
    fn list_rejects_duplicates_and_incapable() {
        let c = TechnologyCatalog::builtin();
        assert!(PriorityList::new(fam("compress"), ids(&["adobe", "adobe"]), &c).is_err());
        assert!(PriorityList::new(fam("compress"), ids(&["tesseract"]), &c).is_err());
        assert!(PriorityList::new(fam("compress"), ids(&["ghost"]), &c).is_err());
        assert!(PriorityList::new(fam("compress"), vec![], &c).is_err());
        assert!(PriorityList::new(fam("compress"), ids(&["pdf_lib", "adobe"]), &c).is_ok());
    }

    #[test]
    fn sanitize_drops_stale_and_appends_missing() {
        let c = TechnologyCatalog::builtin();
        let (list, dropped) =
            PriorityList::sanitize(&fam("ocr"), &ids(&["tesseract", "ghost", "tesseract"]), &c)
                .unwrap();
        assert_eq!(list.ids(), ids(&["tesseract", "adobe", "ai_cloud"]).as_slice());
        assert_eq!(dropped, ids(&["ghost", "tesseract"]));
    }

    #[test]
    fn sanitize_empty_falls_back_to_default() {
        let c = TechnologyCatalog::builtin();
        let (list, _) = PriorityList::sanitize(&fam("compress"), &ids(&["ghost"]), &c).unwrap();
        assert_eq!(list.ids(), c.default_order(&fam("compress")).as_slice());
    }

    #[test]
    fn swap_up_at_zero_is_noop() {
        let c = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&c, Arc::new(MemorySink::new())).unwrap();
        let list = store.swap_up(&fam("compress"), 0, &c).unwrap();
        assert_eq!(list.ids(), ids(&["adobe", "pdf_lib"]).as_slice());
    }

    #[test]
    fn swap_up_exchanges_neighbours_and_persists() {
        let c = TechnologyCatalog::builtin();
        let sink = Arc::new(MemorySink::new());
        let store = PriorityStore::load(&c, sink.clone()).unwrap();
        let list = store.swap_up(&fam("ocr"), 2, &c).unwrap();
        assert_eq!(list.ids(), ids(&["adobe", "tesseract", "ai_cloud"]).as_slice());
        assert_eq!(sink.load_all().unwrap()["ocr"], list.ids().to_vec());
    }

    #[test]
    fn swap_up_out_of_range_errors() {
        let c = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&c, Arc::new(MemorySink::new())).unwrap();
        assert!(matches!(
            store.swap_up(&fam("compress"), 2, &c),
            Err(DocOpsError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn refreshed_catalog_resanitises_existing_lists() {
        let builtin = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&builtin, Arc::new(MemorySink::new())).unwrap();
        let compress = fam("compress");
        assert_eq!(store.get(&compress).unwrap().ids(), ids(&["adobe", "pdf_lib"]).as_slice());

        let mut technologies = builtin.technologies().to_vec();
        for t in technologies.iter_mut().filter(|t| t.id.as_str() == "adobe") {
            t.capabilities.retain(|c| c.family != compress);
        }
        let refreshed = TechnologyCatalog::new(builtin.families().to_vec(), technologies).unwrap();
        store.adopt_catalog(&refreshed);

        let list = store.get(&compress).unwrap();
        assert_eq!(list.ids(), ids(&["pdf_lib"]).as_slice());
        assert_eq!(store.swap_up(&compress, 0, &refreshed).unwrap(), list);
    }

    #[test]
    fn failed_write_keeps_previous_list() {
        let c = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&c, Arc::new(FailingSink)).unwrap();
        let before = store.get(&fam("compress")).unwrap();
        assert!(store.swap_up(&fam("compress"), 1, &c).is_err());
        assert!(store.reset(&fam("compress"), &c).is_err());
        assert_eq!(store.get(&fam("compress")).unwrap(), before);
    }

    #[test]
    fn reset_restores_default() {
        let c = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&c, Arc::new(MemorySink::new())).unwrap();
        store.swap_up(&fam("compress"), 1, &c).unwrap();
        let list = store.reset(&fam("compress"), &c).unwrap();
        assert_eq!(list.ids(), ids(&["adobe", "pdf_lib"]).as_slice());
    }

    #[test]
    fn unknown_family_is_rejected() {
        let c = TechnologyCatalog::builtin();
        let store = PriorityStore::load(&c, Arc::new(MemorySink::new())).unwrap();
        assert!(matches!(
            store.get(&fam("teleport")),
            Err(DocOpsError::UnknownFamily(_))
        ));
        assert!(store.reset(&fam("teleport"), &c).is_err());
    }

    #[test]
    fn json_file_sink_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/priorities.json");
        let c = TechnologyCatalog::builtin();

        let store = PriorityStore::load(&c, Arc::new(JsonFileSink::new(&path))).unwrap();
        store.swap_up(&fam("compress"), 1, &c).unwrap();

        let reloaded = PriorityStore::load(&c, Arc::new(JsonFileSink::new(&path))).unwrap();
        assert_eq!(
            reloaded.get(&fam("compress")).unwrap().ids(),
            ids(&["pdf_lib", "adobe"]).as_slice()
        );
    }

    #[test]
    fn json_file_sink_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priorities.json");
        std::fs::write(&path, "{not json").unwrap();
        let sink = JsonFileSink::new(&path);
        assert!(matches!(
            sink.load_all(),
            Err(DocOpsError::CorruptPriorityStore { .. })
        ));
    }
}
