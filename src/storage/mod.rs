//! Durable mesh identity persistence.
//!
//! The mesh identity (`mesh_id`, `channel`, `max_layer`) survives restarts
//! in an embedded sled store under a fixed tree, serialized with bincode
//! behind a schema-version byte. The store is treated as an opaque durable
//! blob; nothing else inspects its format.

use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MeshError, Result};

const IDENTITY_TREE: &str = "mesh_config";
const IDENTITY_KEY: &[u8] = b"identity";
const SCHEMA_VERSION: u8 = 1;

/// The persisted subset of the mesh configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshIdentity {
    pub mesh_id: [u8; 6],
    pub channel: u8,
    pub max_layer: u8,
}

pub struct ConfigStore {
    tree: sled::Tree,
}

impl ConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(IDENTITY_TREE)?;
        Ok(ConfigStore { tree })
    }

    pub fn save_identity(&self, identity: &MeshIdentity) -> Result<()> {
        let mut record = vec![SCHEMA_VERSION];
        record.extend(bincode::serialize(identity)?);
        self.tree.insert(IDENTITY_KEY, record)?;
        self.tree.flush()?;
        info!("mesh identity saved");
        Ok(())
    }

    pub fn load_identity(&self) -> Result<MeshIdentity> {
        let record = self
            .tree
            .get(IDENTITY_KEY)?
            .ok_or(MeshError::NotFound("no persisted mesh identity"))?;
        match record.first() {
            Some(&SCHEMA_VERSION) => Ok(bincode::deserialize(&record[1..])?),
            _ => Err(MeshError::Corrupted("unknown identity schema version")),
        }
    }
}
