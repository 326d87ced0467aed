//! # Log Record Wire Format
//!
//! A log file is a plain concatenation of variable-length records, always a
//! multiple of the 4 KiB write unit. Every record starts with the same
//! 8-byte header:
//!
//! ```text
//! +-------------+-------------+----------------+
//! | storage_id  | log_length  | log_type_code  |
//! | (4 bytes)   | (2 bytes)   | (2 bytes)      |
//! +-------------+-------------+----------------+
//! ```
//!
//! `log_length` covers the header and everything after it, so a reader can
//! walk a file with nothing but this struct. All record lengths are multiples
//! of 8 so that any padding gap can hold at least a bare filler header.
//!
//! ## Record kinds
//!
//! - **Filler** (`code 1`): skipped everywhere; pads flush boundaries so
//!   files stay aligned to the 4 KiB write unit, and pads the circular
//!   buffer seam so no record ever straddles it.
//! - **Epoch marker** (`code 2`): `{old_epoch, new_epoch, logger_id}`.
//!   Loggers emit one at every epoch boundary that carried log bytes; the
//!   snapshot mapper and restart replay use them to know which epoch the
//!   following bytes belong to.
//! - **Array overwrite** (`code 3`): redo for a partial payload overwrite of
//!   one array record. Carries the committing XctId (filled in during the
//!   commit apply phase, after the record was serialized) so the snapshot
//!   pipeline can order competing overwrites without extra context.
//!
//! Integrity is structural: a length of zero, a length not divisible by 8,
//! an unknown type code, or a record running past its block mark the file
//! corrupt at that point.

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::epoch::Epoch;
use crate::storage::StorageId;
use crate::xct::XctId;

/// Files are written in multiples of this many bytes.
pub const LOG_WRITE_UNIT: usize = 4096;

/// Alignment of every log record.
pub const LOG_RECORD_ALIGN: usize = 8;

pub mod codes {
    pub const FILLER: u16 = 1;
    pub const EPOCH_MARKER: u16 = 2;
    pub const ARRAY_OVERWRITE: u16 = 3;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct LogHeader {
    pub storage_id: u32,
    pub log_length: u16,
    pub log_type_code: u16,
}

impl LogHeader {
    pub const SIZE: usize = 8;

    pub fn new(storage_id: StorageId, log_length: u16, log_type_code: u16) -> Self {
        debug_assert!(log_length as usize % LOG_RECORD_ALIGN == 0);
        Self {
            storage_id,
            log_length,
            log_type_code,
        }
    }
}

/// Write a filler record covering exactly `gap` bytes into `buf`.
///
/// `gap` must be a multiple of 8 and at least the header size; the body
/// bytes are zeroed so files stay deterministic.
pub fn write_filler(buf: &mut [u8], gap: usize) {
    debug_assert!(gap >= LogHeader::SIZE && gap % LOG_RECORD_ALIGN == 0);
    debug_assert!(gap <= u16::MAX as usize);
    let header = LogHeader::new(0, gap as u16, codes::FILLER);
    buf[..LogHeader::SIZE].copy_from_slice(header.as_bytes());
    buf[LogHeader::SIZE..gap].fill(0);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EpochMarkerLog {
    pub header: LogHeader,
    pub old_epoch: u32,
    pub new_epoch: u32,
    pub logger_id: u16,
    _pad: [u8; 6],
}

impl EpochMarkerLog {
    pub const SIZE: usize = 24;

    pub fn new(old_epoch: Epoch, new_epoch: Epoch, logger_id: u16) -> Self {
        Self {
            header: LogHeader::new(0, Self::SIZE as u16, codes::EPOCH_MARKER),
            old_epoch: old_epoch.raw(),
            new_epoch: new_epoch.raw(),
            logger_id,
            _pad: [0; 6],
        }
    }

    pub fn new_epoch(&self) -> Epoch {
        Epoch::from_raw(self.new_epoch)
    }

    pub fn old_epoch(&self) -> Epoch {
        Epoch::from_raw(self.old_epoch)
    }
}

/// Fixed prefix of an array overwrite record; `payload_count` payload bytes
/// follow, then zero padding up to the 8-byte record alignment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ArrayOverwriteLog {
    pub header: LogHeader,
    pub xct_id: u64,
    /// Index of the record within the array storage.
    pub offset: u64,
    /// First byte within the record payload this overwrite touches.
    pub payload_offset: u16,
    pub payload_count: u16,
    _pad: [u8; 4],
}

impl ArrayOverwriteLog {
    pub const PREFIX_SIZE: usize = 32;

    /// Total serialized length for a given payload size.
    pub fn record_length(payload_count: usize) -> usize {
        let raw = Self::PREFIX_SIZE + payload_count;
        (raw + LOG_RECORD_ALIGN - 1) & !(LOG_RECORD_ALIGN - 1)
    }

    /// Serialize a record into `buf` (which must be `record_length` bytes).
    /// The XctId field is left invalid; commit fills it in before the bytes
    /// become visible to the logger.
    pub fn serialize_into(
        buf: &mut [u8],
        storage_id: StorageId,
        offset: u64,
        payload_offset: u16,
        payload: &[u8],
    ) {
        let total = Self::record_length(payload.len());
        debug_assert_eq!(buf.len(), total);
        let prefix = Self {
            header: LogHeader::new(storage_id, total as u16, codes::ARRAY_OVERWRITE),
            xct_id: 0,
            offset,
            payload_offset,
            payload_count: payload.len() as u16,
            _pad: [0; 4],
        };
        buf[..Self::PREFIX_SIZE].copy_from_slice(prefix.as_bytes());
        buf[Self::PREFIX_SIZE..Self::PREFIX_SIZE + payload.len()].copy_from_slice(payload);
        buf[Self::PREFIX_SIZE + payload.len()..total].fill(0);
    }

    /// Patch the committing XctId into an already-serialized record.
    pub fn fill_xct_id(buf: &mut [u8], id: XctId) {
        debug_assert!(buf.len() >= Self::PREFIX_SIZE);
        buf[8..16].copy_from_slice(&id.raw().to_le_bytes());
    }

    /// Parse the fixed prefix out of a full record. The caller must have
    /// length-checked the record (the block walker does).
    pub fn parse_prefix(record: &[u8]) -> ArrayOverwriteLog {
        Self::read_from_bytes(&record[..Self::PREFIX_SIZE]).expect("prefix length checked")
    }

    pub fn xct_id(&self) -> XctId {
        XctId::from_raw(self.xct_id)
    }

    pub fn payload<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[Self::PREFIX_SIZE..Self::PREFIX_SIZE + self.payload_count as usize]
    }
}

/// One parsed record inside a log block.
#[derive(Debug, Clone, Copy)]
pub struct ParsedRecord<'a> {
    pub header: LogHeader,
    /// The full record bytes, header included.
    pub bytes: &'a [u8],
}

impl<'a> ParsedRecord<'a> {
    pub fn as_epoch_marker(&self) -> Option<EpochMarkerLog> {
        if self.header.log_type_code != codes::EPOCH_MARKER {
            return None;
        }
        EpochMarkerLog::read_from_bytes(&self.bytes[..EpochMarkerLog::SIZE]).ok()
    }

    pub fn as_array_overwrite(&self) -> Option<ArrayOverwriteLog> {
        if self.header.log_type_code != codes::ARRAY_OVERWRITE {
            return None;
        }
        ArrayOverwriteLog::read_from_bytes(&self.bytes[..ArrayOverwriteLog::PREFIX_SIZE]).ok()
    }
}

/// Walk a byte block record by record. Yields an error (not `None`) on
/// structural corruption so recovery can distinguish a clean end from a
/// damaged file.
pub struct LogRecordIter<'a> {
    block: &'a [u8],
    pos: usize,
}

impl<'a> LogRecordIter<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for LogRecordIter<'a> {
    type Item = Result<ParsedRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.block.len() {
            return None;
        }
        let remaining = &self.block[self.pos..];
        if remaining.len() < LogHeader::SIZE {
            return Some(Err(eyre::eyre!(
                "truncated log header at offset {}",
                self.pos
            )));
        }
        let header = match LogHeader::read_from_bytes(&remaining[..LogHeader::SIZE]) {
            Ok(h) => h,
            Err(_) => return Some(Err(eyre::eyre!("unreadable log header"))),
        };
        let len = header.log_length as usize;
        if len < LogHeader::SIZE || len % LOG_RECORD_ALIGN != 0 {
            return Some(Err(eyre::eyre!(
                "corrupt log record length {} at offset {}",
                len,
                self.pos
            )));
        }
        if len > remaining.len() {
            return Some(Err(eyre::eyre!(
                "log record of {} bytes runs past block end at offset {}",
                len,
                self.pos
            )));
        }
        match header.log_type_code {
            codes::FILLER | codes::EPOCH_MARKER | codes::ARRAY_OVERWRITE => {}
            other => {
                return Some(Err(eyre::eyre!(
                    "unknown log type code {} at offset {}",
                    other,
                    self.pos
                )))
            }
        }
        let bytes = &remaining[..len];
        self.pos += len;
        Some(Ok(ParsedRecord { header, bytes }))
    }
}

/// Validate a whole block, returning an error naming the first damage.
pub fn validate_block(block: &[u8]) -> Result<()> {
    for record in LogRecordIter::new(block) {
        record?;
    }
    Ok(())
}

/// Round `len` up to the next multiple of the write unit.
pub fn align_to_write_unit(len: usize) -> usize {
    (len + LOG_WRITE_UNIT - 1) & !(LOG_WRITE_UNIT - 1)
}
