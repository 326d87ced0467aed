//! # Array Composer
//!
//! Turns one partition's sorted log runs into a new snapshot sub-tree for
//! an array storage, and splices all partitions' results into the final
//! root page.
//!
//! ## Compose
//!
//! A "strawman tournament" scans the merged input: each run exposes its
//! next `(key, xct_id)` and the minimum is consumed. The composer walks a
//! `cur_path` of open pages from the sub-root level down to the leaf:
//!
//! ```text
//!            next key
//!               v
//!   [ inner (open) ]--- finalized pages already hold their pointers
//!     [ leaf (open) ] <- overwrite applied in place in the write buffer
//! ```
//!
//! A page finalizes when the next key lies past its range; its pointer was
//! already known at allocation (the snapshot writer allocates contiguously)
//! and was stored into the parent when the page opened. Pages initialize
//! from their previous-snapshot counterpart when one exists, so records
//! untouched by this window carry forward; whole subtrees with no input at
//! all keep their old pointers via `construct_root`.
//!
//! Equal keys arrive in `(epoch, ordinal)` order, so applying every record
//! as it comes implements newest-wins for overlapping overwrites.
//!
//! ## Root construction
//!
//! `construct_root` consumes every partition's [`RootInfo`], takes the
//! previous root's children as the base image, overlays the freshly
//! composed sub-roots, and writes the single new root page.

use eyre::{bail, Result};

use crate::snapshot::cache::SnapshotPageStore;
use crate::snapshot::reducer::RunCursor;
use crate::snapshot::writer::SnapshotWriter;
use crate::storage::array::ArrayStorage;
use crate::storage::array_page::{
    self, interior_child, set_interior_child, DualPagePointer, PageHeader,
};
use crate::storage::page_id::{SnapshotPagePointer, PAGE_SIZE};
use crate::storage::StorageId;

/// What one partition's compose pass produced: pointers to the sub-trees it
/// wrote, keyed by the root's direct-child index.
#[derive(Debug, Clone, Default)]
pub struct RootInfo {
    pub storage_id: StorageId,
    pub children: Vec<(usize, SnapshotPagePointer)>,
}

#[derive(Debug, Clone, Copy)]
struct OpenPage {
    slot: usize,
    pointer: SnapshotPagePointer,
    begin: u64,
    end: u64,
}

pub struct ArrayComposer<'a> {
    storage: &'a ArrayStorage,
    writer: &'a mut SnapshotWriter,
    prev_root: Option<SnapshotPagePointer>,
    store: &'a SnapshotPageStore,
}

impl<'a> ArrayComposer<'a> {
    pub fn new(
        storage: &'a ArrayStorage,
        writer: &'a mut SnapshotWriter,
        prev_root: Option<SnapshotPagePointer>,
        store: &'a SnapshotPageStore,
    ) -> Self {
        Self {
            storage,
            writer,
            prev_root,
            store,
        }
    }

    /// Compose this partition's streams into new pages. Streams must be
    /// individually sorted by `(key, epoch, ordinal)`.
    pub fn compose(mut self, mut streams: Vec<RunCursor>) -> Result<RootInfo> {
        let mut root_info = RootInfo {
            storage_id: self.storage.id(),
            children: Vec::new(),
        };
        let route = self.storage.route().clone();
        let top_level = route.levels.saturating_sub(2) as usize;
        let mut cur_path: Vec<Option<OpenPage>> = vec![None; top_level + 1];

        loop {
            let Some(stream_idx) = pick_min_stream(&streams) else {
                break;
            };
            let entry = streams[stream_idx]
                .current()
                .expect("picked stream has a record")
                .clone();
            streams[stream_idx].advance()?;
            if entry.key >= self.storage.array_size() {
                bail!(
                    "overwrite record for offset {} outside array of {}",
                    entry.key,
                    self.storage.array_size()
                );
            }

            self.ensure_path(&route, &mut cur_path, &mut root_info, entry.key)?;
            let leaf = cur_path[0].expect("leaf open after ensure_path");
            array_page::leaf_apply(
                self.writer.page_mut(leaf.slot),
                route.leaf_slot(entry.key),
                route.payload_size,
                entry.payload_offset,
                &entry.data,
                entry.xct_id,
            );
        }

        for level in 0..cur_path.len() {
            self.close_page(&route, &mut cur_path, &mut root_info, level);
        }
        Ok(root_info)
    }

    /// Close every open page whose range ended before `key`, then open the
    /// missing path down to `key`'s leaf.
    fn ensure_path(
        &mut self,
        route: &array_page::ArrayRoute,
        cur_path: &mut [Option<OpenPage>],
        root_info: &mut RootInfo,
        key: u64,
    ) -> Result<()> {
        for level in 0..cur_path.len() {
            match cur_path[level] {
                Some(page) if key >= page.end => {
                    self.close_page(route, cur_path, root_info, level)
                }
                _ => {}
            }
        }
        for level in (0..cur_path.len()).rev() {
            if cur_path[level].is_none() {
                self.open_page(route, cur_path, key, level as u8)?;
            }
        }
        Ok(())
    }

    fn open_page(
        &mut self,
        route: &array_page::ArrayRoute,
        cur_path: &mut [Option<OpenPage>],
        key: u64,
        level: u8,
    ) -> Result<()> {
        let (begin, end) = route.page_range(level, key);
        let (slot, pointer) = self.writer.allocate();
        if let Some(prev) = self.prev_page_for(route, level, begin)? {
            self.writer.page_mut(slot).copy_from_slice(&prev);
        }
        let header = if level == 0 {
            PageHeader::new_leaf(self.storage.id(), pointer, begin, end, route.payload_size)
        } else {
            PageHeader::new_interior(
                self.storage.id(),
                pointer,
                level,
                begin,
                end,
                route.payload_size,
            )
        };
        array_page::write_header(self.writer.page_mut(slot), &header);

        // Publish into the parent right away; the pointer never changes.
        // Sub-root pages have no parent here; construct_root picks them up
        // from the RootInfo instead.
        if let Some(parent) = cur_path.get(level as usize + 1).and_then(|p| *p) {
            set_interior_child(
                self.writer.page_mut(parent.slot),
                route.child_index(level + 1, begin),
                DualPagePointer {
                    snapshot: pointer,
                    volatile: 0,
                },
            );
        }
        cur_path[level as usize] = Some(OpenPage {
            slot,
            pointer,
            begin,
            end,
        });
        Ok(())
    }

    fn close_page(
        &mut self,
        route: &array_page::ArrayRoute,
        cur_path: &mut [Option<OpenPage>],
        root_info: &mut RootInfo,
        level: usize,
    ) {
        let Some(page) = cur_path[level].take() else {
            return;
        };
        if level == cur_path.len() - 1 {
            let child_index = (page.begin / route.interval[level]) as usize;
            root_info.children.push((child_index, page.pointer));
        }
        // Child pointers were published at open time; nothing else to do —
        // the page bytes stay in the writer until the file is finished.
    }

    /// Fetch the previous snapshot's page covering `begin` at `level`, if
    /// the previous snapshot has one.
    fn prev_page_for(
        &self,
        route: &array_page::ArrayRoute,
        level: u8,
        begin: u64,
    ) -> Result<Option<[u8; PAGE_SIZE]>> {
        let Some(root) = self.prev_root else {
            return Ok(None);
        };
        let mut page = [0u8; PAGE_SIZE];
        let mut pointer = root;
        for walk_level in (level + 1..route.levels).rev() {
            self.store.read_page(pointer, &mut page)?;
            let child = route.child_index(walk_level, begin);
            let next = interior_child(&page, child).snapshot;
            if next == 0 {
                return Ok(None);
            }
            pointer = next;
        }
        self.store.read_page(pointer, &mut page)?;
        Ok(Some(page))
    }
}

fn pick_min_stream(streams: &[RunCursor]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, stream) in streams.iter().enumerate() {
        let Some(entry) = stream.current() else {
            continue;
        };
        match best {
            None => best = Some(i),
            Some(b) => {
                let best_entry = streams[b].current().expect("best stream has a record");
                if entry.key < best_entry.key
                    || (entry.key == best_entry.key && entry.xct_id.is_before(best_entry.xct_id))
                {
                    best = Some(i);
                }
            }
        }
    }
    best
}

/// Splice every partition's sub-roots into the storage's final root page.
///
/// For a single-level array the composed leaf *is* the root. Otherwise the
/// previous root's children are the base image and composed children
/// overlay them, so untouched subtrees keep their old (still valid)
/// pointers.
pub fn construct_root(
    storage: &ArrayStorage,
    root_infos: &[RootInfo],
    prev_root: Option<SnapshotPagePointer>,
    writer: &mut SnapshotWriter,
    store: &SnapshotPageStore,
) -> Result<SnapshotPagePointer> {
    let route = storage.route();
    if route.levels == 1 {
        for info in root_infos {
            if let Some(&(_, pointer)) = info.children.first() {
                return Ok(pointer);
            }
        }
        return Ok(prev_root.unwrap_or(0));
    }

    let (slot, pointer) = writer.allocate();
    if let Some(prev) = prev_root {
        let mut prev_page = [0u8; PAGE_SIZE];
        store.read_page(prev, &mut prev_page)?;
        writer.page_mut(slot).copy_from_slice(&prev_page);
    }
    let header = PageHeader::new_interior(
        storage.id(),
        pointer,
        route.levels - 1,
        0,
        storage.array_size(),
        route.payload_size,
    );
    array_page::write_header(writer.page_mut(slot), &header);
    for info in root_infos {
        debug_assert_eq!(info.storage_id, storage.id());
        for &(child, child_pointer) in &info.children {
            set_interior_child(
                writer.page_mut(slot),
                child,
                DualPagePointer {
                    snapshot: child_pointer,
                    volatile: 0,
                },
            );
        }
    }
    Ok(pointer)
}
