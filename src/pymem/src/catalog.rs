//! The analysis environment: snapshot plus the persistent type catalog.
//!
//! The catalog maps runtime type names to the addresses of their type
//! objects. It is bootstrapped by the find-base-type / find-all-types scans
//! and saved next to the snapshot so later sessions skip the scans.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::addr::MappedAddr;
use crate::error::{Error, Result};
use crate::objects::{Kind, PyType};
use crate::snapshot::SnapshotStore;

/// Outcome of a collision-aware catalog insertion.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    New,
    AlreadyKnown,
    /// Same name already mapped to a different address; the new entry was
    /// stored under the `{name}+{addr}` alternate key.
    Collision(MappedAddr<PyType>),
}

/// Snapshot store plus the catalog of discovered type objects.
pub struct Environment {
    pub store: SnapshotStore,
    pub base_type: MappedAddr<PyType>,
    pub types_by_name: BTreeMap<String, MappedAddr<PyType>>,
    /// Decoder dispatch index derived from `types_by_name`.
    kinds: HashMap<u64, Kind>,
    data_path: PathBuf,
}

#[derive(Serialize, Deserialize, Default)]
struct AnalysisFile {
    base_type: u64,
    types: BTreeMap<String, u64>,
}

impl Environment {
    /// Open the snapshot at `path` and load saved analysis data if present.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = SnapshotStore::open(&path)?;
        let mut env = Environment {
            store,
            base_type: MappedAddr::NULL,
            types_by_name: BTreeMap::new(),
            kinds: HashMap::new(),
            data_path: path.as_ref().to_path_buf(),
        };
        env.load_analysis()?;
        Ok(env)
    }

    /// Path of the analysis file, derived from the snapshot location.
    pub fn analysis_path(&self) -> PathBuf {
        if self.data_path.is_dir() {
            self.data_path.join("analysis.json")
        } else {
            PathBuf::from(format!("{}.analysis.json", self.data_path.display()))
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn load_analysis(&mut self) -> Result<()> {
        let path = self.analysis_path();
        if !path.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(path)?;
        let file: AnalysisFile = serde_json::from_str(&contents)?;
        self.base_type = MappedAddr::new(file.base_type);
        self.types_by_name = file
            .types
            .into_iter()
            .map(|(name, addr)| (name, MappedAddr::new(addr)))
            .collect();
        self.rebuild_kind_index();
        Ok(())
    }

    /// Persist the catalog atomically (write to a temp file, then rename).
    pub fn save_analysis(&self) -> Result<()> {
        let path = self.analysis_path();
        let file = AnalysisFile {
            base_type: self.base_type.raw(),
            types: self
                .types_by_name
                .iter()
                .map(|(name, addr)| (name.clone(), addr.raw()))
                .collect(),
        };
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Insert a discovered type, disambiguating name collisions.
    pub fn insert_type(&mut self, name: &str, addr: MappedAddr<PyType>) -> InsertOutcome {
        match self.types_by_name.get(name) {
            None => {
                self.types_by_name.insert(name.to_string(), addr);
                self.rebuild_kind_index();
                InsertOutcome::New
            }
            Some(&existing) if existing == addr => InsertOutcome::AlreadyKnown,
            Some(&existing) => {
                self.types_by_name.insert(format!("{name}+{addr}"), addr);
                self.rebuild_kind_index();
                InsertOutcome::Collision(existing)
            }
        }
    }

    pub fn clear_types(&mut self) {
        self.types_by_name.clear();
        self.kinds.clear();
    }

    fn rebuild_kind_index(&mut self) {
        self.kinds = self
            .types_by_name
            .iter()
            .filter_map(|(name, addr)| {
                // Collision entries keep the base name before the '+'.
                let base = name.split('+').next().unwrap_or(name);
                Kind::from_name(base).map(|kind| (addr.raw(), kind))
            })
            .collect();
    }

    /// The decoder kind for a type-object address, if it is one we model.
    pub fn kind_for_type(&self, addr: MappedAddr<PyType>) -> Option<Kind> {
        self.kinds.get(&addr.raw()).copied()
    }

    pub fn get_type(&self, name: &str) -> Result<MappedAddr<PyType>> {
        self.types_by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::MissingType(name.to_string()))
    }

    pub fn get_type_if_exists(&self, name: &str) -> Option<MappedAddr<PyType>> {
        self.types_by_name.get(name).copied()
    }
}
