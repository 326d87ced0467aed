//! # Storages
//!
//! A storage is a typed collection of records. The engine distinguishes
//! three kinds; only the array storage has a volatile implementation and a
//! snapshot composer in this crate. The other kinds exist so that storage
//! ids, partitioner dispatch, and snapshot metadata keep their final shape.
//!
//! Storages are registered at runtime through [`StorageManager`]; the schema
//! registry that would persist their definitions is an external collaborator.

pub mod array;
pub mod array_page;
pub mod composer;
pub mod page_id;
pub mod partitioner;

use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::storage::array::ArrayStorage;

pub type StorageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Array,
    Hash,
    Masstree,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Array => "array",
            StorageKind::Hash => "hash",
            StorageKind::Masstree => "masstree",
        }
    }
}

/// Runtime registry of storages. Ids are dense and start at 1; id 0 is
/// reserved so that a zero storage id in a log record always means
/// "engine-wide record".
pub struct StorageManager {
    arrays: RwLock<Vec<Arc<ArrayStorage>>>,
    by_name: RwLock<HashMap<String, StorageId>>,
    group_count: u8,
}

impl StorageManager {
    pub fn new(group_count: u8) -> Self {
        Self {
            arrays: RwLock::new(Vec::new()),
            by_name: RwLock::new(HashMap::new()),
            group_count,
        }
    }

    pub fn create_array(
        &self,
        name: &str,
        payload_size: u16,
        array_size: u64,
    ) -> Result<Arc<ArrayStorage>> {
        let mut by_name = self.by_name.write();
        if by_name.contains_key(name) {
            bail!("storage {:?} already exists", name);
        }
        let mut arrays = self.arrays.write();
        let id = (arrays.len() + 1) as StorageId;
        let storage = Arc::new(ArrayStorage::new(
            id,
            name,
            payload_size,
            array_size,
            self.group_count,
        ));
        arrays.push(Arc::clone(&storage));
        by_name.insert(name.to_owned(), id);
        Ok(storage)
    }

    pub fn array(&self, id: StorageId) -> Result<Arc<ArrayStorage>> {
        let arrays = self.arrays.read();
        match arrays.get(id.wrapping_sub(1) as usize) {
            Some(s) => Ok(Arc::clone(s)),
            None => bail!("no storage with id {}", id),
        }
    }

    pub fn array_by_name(&self, name: &str) -> Result<Arc<ArrayStorage>> {
        let id = match self.by_name.read().get(name) {
            Some(&id) => id,
            None => bail!("no storage named {:?}", name),
        };
        self.array(id)
    }

    pub fn all_arrays(&self) -> Vec<Arc<ArrayStorage>> {
        self.arrays.read().clone()
    }

    pub fn kind_of(&self, id: StorageId) -> Option<StorageKind> {
        let arrays = self.arrays.read();
        arrays
            .get(id.wrapping_sub(1) as usize)
            .map(|_| StorageKind::Array)
    }
}
