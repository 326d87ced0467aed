//! # Snapshot Writer
//!
//! Per-node sink for freshly composed pages. Allocation is contiguous: a
//! page's final [`SnapshotPagePointer`] is handed out the moment the page
//! is allocated, which lets the composer embed child pointers in parents
//! before either page is finalized. `finish` writes every allocated page in
//! order, after a reserved all-zero header page at offset 0 (so offset 0
//! never addresses real data and the null pointer stays unambiguous).
//!
//! Frames come from the node's [`PagePool`] and return to it when the
//! writer is dropped.

use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::memory::{PageFrame, PagePool};
use crate::snapshot::snapshot::{Snapshot, SnapshotId};
use crate::storage::page_id::{self, SnapshotPagePointer, PAGE_SIZE};

pub struct SnapshotWriter {
    node: u8,
    file_ordinal: u8,
    path: PathBuf,
    pool: PagePool,
    pages: Vec<PageFrame>,
}

impl SnapshotWriter {
    pub fn file_name(snapshot_id: SnapshotId) -> String {
        format!("snapshot_{:05}.pages", snapshot_id)
    }

    pub fn new(node: u8, snapshot_id: SnapshotId, dir: &Path, pool: PagePool) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create snapshot directory {:?}", dir))?;
        Ok(Self {
            node,
            file_ordinal: Snapshot::file_ordinal(snapshot_id),
            path: dir.join(Self::file_name(snapshot_id)),
            pool,
            pages: Vec::new(),
        })
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the next page. The returned slot indexes [`page_mut`]; the
    /// pointer is final.
    pub fn allocate(&mut self) -> (usize, SnapshotPagePointer) {
        let slot = self.pages.len();
        self.pages.push(self.pool.acquire());
        let pointer = page_id::combine(self.node, self.file_ordinal, slot as u64 + 1);
        (slot, pointer)
    }

    pub fn page_mut(&mut self, slot: usize) -> &mut [u8; PAGE_SIZE] {
        &mut self.pages[slot]
    }

    pub fn page(&self, slot: usize) -> &[u8; PAGE_SIZE] {
        &self.pages[slot]
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Write the reserved header page plus every allocated page, fsync, and
    /// return the file path for registration. A writer that allocated
    /// nothing writes nothing and returns `None`.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        if self.pages.is_empty() {
            return Ok(None);
        }
        let mut file = std::fs::File::create(&self.path)
            .wrap_err_with(|| format!("failed to create snapshot file {:?}", self.path))?;
        let header = [0u8; PAGE_SIZE];
        file.write_all(&header)
            .wrap_err("failed to write snapshot header page")?;
        for page in &self.pages {
            file.write_all(&page[..])
                .wrap_err("failed to write snapshot page")?;
        }
        file.sync_all().wrap_err("failed to fsync snapshot file")?;
        Ok(Some(self.path))
    }
}
