//! # Snapshot Metadata
//!
//! A snapshot is an immutable on-disk image reflecting every transaction
//! committed up to `valid_until_epoch`. The metadata is tiny: identity, the
//! epoch window it folded, and one root page pointer per storage. Pages are
//! never rewritten, so holding an `Arc<Snapshot>` pins a consistent view
//! forever regardless of later snapshots.

use hashbrown::HashMap;

use crate::epoch::Epoch;
use crate::storage::page_id::SnapshotPagePointer;
use crate::storage::StorageId;

pub type SnapshotId = u16;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Epoch window folded into this image: `(base_epoch, valid_until]`.
    /// `base_epoch` is invalid for the first snapshot.
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub root_pointers: HashMap<StorageId, SnapshotPagePointer>,
}

impl Snapshot {
    pub fn root_of(&self, storage_id: StorageId) -> Option<SnapshotPagePointer> {
        self.root_pointers.get(&storage_id).copied().filter(|&p| p != 0)
    }

    /// File ordinal all pages of this snapshot carry in their pointers.
    pub fn file_ordinal(id: SnapshotId) -> u8 {
        (id & 0xFF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_lookup_filters_null_pointers() {
        let mut roots = HashMap::new();
        roots.insert(1u32, 0x0100_0000_0000_0001u64);
        roots.insert(2u32, 0u64);
        let snapshot = Snapshot {
            id: 1,
            base_epoch: Epoch::INVALID,
            valid_until_epoch: Epoch::from_raw(10),
            root_pointers: roots,
        };
        assert!(snapshot.root_of(1).is_some());
        assert!(snapshot.root_of(2).is_none());
        assert!(snapshot.root_of(3).is_none());
    }

    #[test]
    fn file_ordinal_wraps_at_256() {
        assert_eq!(Snapshot::file_ordinal(1), 1);
        assert_eq!(Snapshot::file_ordinal(257), 1);
    }
}
