//! # Snapshot Page Store
//!
//! Read side of the snapshot files. Every snapshot page pointer names its
//! node, file ordinal, and page offset; this store maps `(node, ordinal)`
//! to the file that holds it, memory-maps files on first touch, and keeps a
//! bounded cache of hot pages per node when `cache.snapshot_cache_enabled`.
//!
//! The cache is a plain map with an insertion cap rather than an eviction
//! policy: snapshot working sets are set up front by `preload`, and a page
//! that misses the cache is still a cheap mmap read.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::RwLock;

use crate::storage::page_id::{self, SnapshotPagePointer, PAGE_SIZE};

pub struct SnapshotPageStore {
    enabled: bool,
    capacity_pages_per_node: usize,
    files: RwLock<HashMap<(u8, u8), PathBuf>>,
    maps: RwLock<HashMap<(u8, u8), Arc<Mmap>>>,
    cache: RwLock<HashMap<SnapshotPagePointer, Arc<[u8; PAGE_SIZE]>>>,
    cached_per_node: RwLock<HashMap<u8, usize>>,
}

impl SnapshotPageStore {
    pub fn new(enabled: bool, capacity_bytes_per_node: usize) -> Self {
        Self {
            enabled,
            capacity_pages_per_node: capacity_bytes_per_node / PAGE_SIZE,
            files: RwLock::new(HashMap::new()),
            maps: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            cached_per_node: RwLock::new(HashMap::new()),
        }
    }

    /// Make `(node, ordinal)` resolvable. Called at snapshot publication
    /// and when reopening snapshots at restart.
    pub fn register_file(&self, node: u8, ordinal: u8, path: PathBuf) {
        self.files.write().insert((node, ordinal), path);
        // A re-registered ordinal (id wrap) invalidates the old mapping.
        self.maps.write().remove(&(node, ordinal));
    }

    fn map_for(&self, node: u8, ordinal: u8) -> Result<Arc<Mmap>> {
        if let Some(map) = self.maps.read().get(&(node, ordinal)) {
            return Ok(Arc::clone(map));
        }
        let path = match self.files.read().get(&(node, ordinal)) {
            Some(path) => path.clone(),
            None => bail!(
                "no snapshot file registered for node {} ordinal {}",
                node,
                ordinal
            ),
        };
        let file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed to open snapshot file {:?}", path))?;
        // SAFETY: snapshot files are immutable once published; nothing
        // truncates or rewrites them while the engine is alive.
        let map = unsafe {
            Mmap::map(&file).wrap_err_with(|| format!("failed to mmap snapshot file {:?}", path))?
        };
        let map = Arc::new(map);
        self.maps.write().insert((node, ordinal), Arc::clone(&map));
        Ok(map)
    }

    /// Read one page into `out`. Serves from the cache when resident.
    pub fn read_page(&self, pointer: SnapshotPagePointer, out: &mut [u8; PAGE_SIZE]) -> Result<()> {
        debug_assert!(pointer != 0);
        if let Some(page) = self.cache.read().get(&pointer) {
            out.copy_from_slice(&page[..]);
            return Ok(());
        }
        let node = page_id::numa_node(pointer);
        let map = self.map_for(node, page_id::file_ordinal(pointer))?;
        let byte_offset = page_id::page_offset(pointer) as usize * PAGE_SIZE;
        if byte_offset + PAGE_SIZE > map.len() {
            bail!(
                "snapshot page {:#018x} lies beyond its file ({} bytes)",
                pointer,
                map.len()
            );
        }
        out.copy_from_slice(&map[byte_offset..byte_offset + PAGE_SIZE]);
        if self.enabled {
            self.insert_cached(node, pointer, out);
        }
        Ok(())
    }

    fn insert_cached(&self, node: u8, pointer: SnapshotPagePointer, bytes: &[u8; PAGE_SIZE]) {
        let mut counts = self.cached_per_node.write();
        let count = counts.entry(node).or_insert(0);
        if *count >= self.capacity_pages_per_node {
            return;
        }
        let mut cache = self.cache.write();
        if cache.insert(pointer, Arc::new(*bytes)).is_none() {
            *count += 1;
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop every cached page and mapping (tests and id-wrap hygiene).
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.cached_per_node.write().clear();
    }
}
