//! Per-store `child -> parent` sidecar.
//!
//! The virtual disk API does not report a disk's parent, so each store keeps
//! its own edge set in `<store>/parents.bin`. The map is the only source of
//! truth for graph queries; backing-chain pointers inside the disks are used
//! for block operations only. The whole map is rewritten on every save via a
//! temporary file and a rename.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::fabric::Datastore;

pub const PARENT_MAP_FILE: &str = "parents.bin";

/// Id of the root image of every store.
pub const SCRATCH_ID: &str = "scratch";

pub struct ParentMap {
    datastore: Arc<dyn Datastore>,
    /// Datastore path of the sidecar.
    path: String,
    map: BTreeMap<String, String>,
}

impl ParentMap {
    /// Load the sidecar of the store rooted at `store_dir`. A missing sidecar
    /// is an empty map.
    pub async fn restore(datastore: Arc<dyn Datastore>, store_dir: &str) -> Result<Self> {
        let path = format!("{store_dir}/{PARENT_MAP_FILE}");
        let map = match datastore.download(&path).await {
            Ok(raw) => serde_json::from_slice::<BTreeMap<String, String>>(&raw).map_err(|e| {
                Error::InvalidArgument(format!("corrupt parent map {path}: {e}"))
            })?,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        let restored = Self {
            datastore,
            path,
            map,
        };
        for child in restored.map.keys() {
            restored.ancestry(child)?;
        }
        debug!(path = %restored.path, entries = restored.map.len(), "parent map restored");
        Ok(restored)
    }

    /// Record `child -> parent`. Re-adding an identical edge is a no-op; a
    /// conflicting edge is rejected.
    pub fn add(&mut self, child: &str, parent: &str) -> Result<()> {
        if child == SCRATCH_ID {
            return Err(Error::InvalidArgument(format!(
                "{SCRATCH_ID} cannot have a parent"
            )));
        }
        if parent != SCRATCH_ID && !self.map.contains_key(parent) {
            return Err(Error::NotFound(format!("parent image {parent}")));
        }
        match self.map.get(child) {
            Some(existing) if existing == parent => Ok(()),
            Some(existing) => Err(Error::AlreadyExists(format!(
                "image {child} with parent {existing}"
            ))),
            None => {
                self.map.insert(child.to_owned(), parent.to_owned());
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, child: &str) -> Option<String> {
        self.map.remove(child)
    }

    pub fn get(&self, child: &str) -> Option<&str> {
        self.map.get(child).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Parents of `id`, nearest first, ending at scratch. Fails on a dangling
    /// link or a cycle.
    pub fn ancestry(&self, id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = id;

        while cur != SCRATCH_ID {
            if !seen.insert(cur) {
                return Err(Error::InvalidArgument(format!(
                    "parent map has a cycle through {cur}"
                )));
            }
            let parent = self
                .map
                .get(cur)
                .ok_or_else(|| Error::NotFound(format!("parent link for image {cur}")))?;
            chain.push(parent.clone());
            cur = parent.as_str();
        }
        Ok(chain)
    }

    /// Serialize the whole map and replace the sidecar.
    pub async fn save(&self) -> Result<()> {
        let raw = serde_json::to_vec(&self.map)
            .map_err(|e| Error::InvalidArgument(format!("encode parent map: {e}")))?;
        let tmp = format!("{}.tmp", self.path);

        self.datastore.upload(&tmp, &raw).await?;
        self.datastore.rename(&tmp, &self.path).await?;

        debug!(path = %self.path, entries = self.map.len(), "parent map saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
