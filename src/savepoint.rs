//! # Savepoint
//!
//! The tiny XML-shaped key/value file that makes restart possible: which
//! log file each logger was on, how far into it the bytes are known
//! durable, the engine-wide durable epoch, and the latest snapshot's
//! identity and per-storage roots.
//!
//! ```text
//! <savepoint>
//!   <durable_global_epoch>5</durable_global_epoch>
//!   <latest_snapshot_id>1</latest_snapshot_id>
//!   <latest_snapshot_epoch>4</latest_snapshot_epoch>
//!   <current_log_files logger="0">0</current_log_files>
//!   <current_log_files_offset_durable logger="0">8192</current_log_files_offset_durable>
//!   <logger_durable_epoch logger="0">5</logger_durable_epoch>
//!   <storage_root storage="1">72057594037927937</storage_root>
//! </savepoint>
//! ```
//!
//! Writes are atomic: temp file, fsync, rename over the old savepoint,
//! fsync the directory. A malformed savepoint aborts engine initialization
//! rather than guessing — recovery must never run against fabricated
//! offsets.

use std::path::Path;

use eyre::{bail, Result, WrapErr};

use crate::epoch::Epoch;
use crate::log::logger::LoggerSavepoint;
use crate::storage::page_id::SnapshotPagePointer;
use crate::storage::StorageId;

#[derive(Debug, Clone, Default)]
pub struct Savepoint {
    pub durable_global_epoch: Epoch,
    pub latest_snapshot_id: u16,
    pub latest_snapshot_epoch: Epoch,
    pub loggers: Vec<LoggerSavepoint>,
    pub storage_roots: Vec<(StorageId, SnapshotPagePointer)>,
}

impl Savepoint {
    pub fn has_snapshot(&self) -> bool {
        self.latest_snapshot_id != 0 && self.latest_snapshot_epoch.is_valid()
    }

    /// Load from `path`. `Ok(None)` when no savepoint exists (fresh
    /// engine); a present but malformed file is an initialization error.
    pub fn load(path: &Path) -> Result<Option<Savepoint>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to read savepoint {:?}", path))
            }
        };
        let mut savepoint = Savepoint::default();
        let mut seen_open = false;
        let mut seen_close = false;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "<savepoint>" {
                seen_open = true;
                continue;
            }
            if line == "</savepoint>" {
                seen_close = true;
                continue;
            }
            let (tag, index, value) = parse_line(line)
                .ok_or_else(|| eyre::eyre!("savepoint {:?} has a malformed line: {}", path, line))?;
            match tag {
                "durable_global_epoch" => {
                    savepoint.durable_global_epoch = Epoch::from_raw(parse_number(value, line)?)
                }
                "latest_snapshot_id" => {
                    savepoint.latest_snapshot_id = parse_number::<u16>(value, line)?
                }
                "latest_snapshot_epoch" => {
                    savepoint.latest_snapshot_epoch = Epoch::from_raw(parse_number(value, line)?)
                }
                "current_log_files" => {
                    let slot = logger_slot(&mut savepoint.loggers, index, line)?;
                    slot.current_ordinal = parse_number(value, line)?;
                }
                "current_log_files_offset_durable" => {
                    let slot = logger_slot(&mut savepoint.loggers, index, line)?;
                    slot.durable_offset = parse_number(value, line)?;
                }
                "logger_durable_epoch" => {
                    let slot = logger_slot(&mut savepoint.loggers, index, line)?;
                    slot.durable_epoch = Epoch::from_raw(parse_number(value, line)?);
                }
                "storage_root" => {
                    let storage = index
                        .ok_or_else(|| eyre::eyre!("storage_root without storage id: {}", line))?;
                    savepoint
                        .storage_roots
                        .push((storage as StorageId, parse_number(value, line)?));
                }
                other => bail!("savepoint {:?} has an unknown field {:?}", path, other),
            }
        }
        if !seen_open || !seen_close {
            bail!("savepoint {:?} is not a complete document", path);
        }
        Ok(Some(savepoint))
    }

    /// Atomically replace the savepoint at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::fmt::Write as _;
        let mut text = String::from("<savepoint>\n");
        let _ = writeln!(
            text,
            "  <durable_global_epoch>{}</durable_global_epoch>",
            self.durable_global_epoch.raw()
        );
        let _ = writeln!(
            text,
            "  <latest_snapshot_id>{}</latest_snapshot_id>",
            self.latest_snapshot_id
        );
        let _ = writeln!(
            text,
            "  <latest_snapshot_epoch>{}</latest_snapshot_epoch>",
            self.latest_snapshot_epoch.raw()
        );
        for (id, logger) in self.loggers.iter().enumerate() {
            let _ = writeln!(
                text,
                "  <current_log_files logger=\"{}\">{}</current_log_files>",
                id, logger.current_ordinal
            );
            let _ = writeln!(
                text,
                "  <current_log_files_offset_durable logger=\"{}\">{}</current_log_files_offset_durable>",
                id, logger.durable_offset
            );
            let _ = writeln!(
                text,
                "  <logger_durable_epoch logger=\"{}\">{}</logger_durable_epoch>",
                id,
                logger.durable_epoch.raw()
            );
        }
        for (storage, root) in &self.storage_roots {
            let _ = writeln!(
                text,
                "  <storage_root storage=\"{}\">{}</storage_root>",
                storage, root
            );
        }
        text.push_str("</savepoint>\n");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("failed to create directory {:?}", parent))?;
            }
        }
        let tmp = path.with_extension("xml.tmp");
        {
            use std::io::Write as _;
            let mut file = std::fs::File::create(&tmp)
                .wrap_err_with(|| format!("failed to create {:?}", tmp))?;
            file.write_all(text.as_bytes())
                .wrap_err("failed to write savepoint")?;
            file.sync_all().wrap_err("failed to sync savepoint")?;
        }
        std::fs::rename(&tmp, path)
            .wrap_err_with(|| format!("failed to move savepoint into place at {:?}", path))?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// Parse `<tag attr="N">value</tag>` into `(tag, attr index, value)`.
fn parse_line(line: &str) -> Option<(&str, Option<u64>, &str)> {
    let rest = line.strip_prefix('<')?;
    let close_angle = rest.find('>')?;
    let head = &rest[..close_angle];
    let after = &rest[close_angle + 1..];
    let (name, index) = match head.split_once(' ') {
        Some((name, attr)) => {
            let (_, raw) = attr.split_once("=\"")?;
            let raw = raw.strip_suffix('"')?;
            (name, Some(raw.parse::<u64>().ok()?))
        }
        None => (head, None),
    };
    let value = after.strip_suffix('>')?.strip_suffix(name)?.strip_suffix("</")?;
    Some((name, index, value))
}

fn parse_number<T: std::str::FromStr>(value: &str, line: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| eyre::eyre!("savepoint has a non-numeric value in line: {}", line))
}

fn logger_slot<'a>(
    loggers: &'a mut Vec<LoggerSavepoint>,
    index: Option<u64>,
    line: &str,
) -> Result<&'a mut LoggerSavepoint> {
    let index =
        index.ok_or_else(|| eyre::eyre!("logger field without logger id: {}", line))? as usize;
    if index >= loggers.len() {
        loggers.resize_with(index + 1, LoggerSavepoint::default);
    }
    Ok(&mut loggers[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Savepoint {
        Savepoint {
            durable_global_epoch: Epoch::from_raw(7),
            latest_snapshot_id: 2,
            latest_snapshot_epoch: Epoch::from_raw(6),
            loggers: vec![
                LoggerSavepoint {
                    current_ordinal: 1,
                    durable_offset: 8192,
                    durable_epoch: Epoch::from_raw(7),
                },
                LoggerSavepoint {
                    current_ordinal: 0,
                    durable_offset: 4096,
                    durable_epoch: Epoch::from_raw(7),
                },
            ],
            storage_roots: vec![(1, 0x0100_0000_0000_0003), (2, 0x0100_0000_0000_0009)],
        }
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("savepoint.xml");
        sample().save(&path).unwrap();

        let loaded = Savepoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded.durable_global_epoch, Epoch::from_raw(7));
        assert_eq!(loaded.latest_snapshot_id, 2);
        assert_eq!(loaded.loggers.len(), 2);
        assert_eq!(loaded.loggers[0].current_ordinal, 1);
        assert_eq!(loaded.loggers[0].durable_offset, 8192);
        assert_eq!(loaded.loggers[1].durable_offset, 4096);
        assert_eq!(loaded.storage_roots, sample().storage_roots);
        assert!(loaded.has_snapshot());
    }

    #[test]
    fn missing_file_is_a_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Savepoint::load(&dir.path().join("nope.xml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn malformed_content_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("savepoint.xml");
        std::fs::write(&path, "<savepoint>\n<garbage\n</savepoint>\n").unwrap();
        assert!(Savepoint::load(&path).is_err());

        std::fs::write(&path, "<savepoint>\n  <durable_global_epoch>x</durable_global_epoch>\n</savepoint>\n").unwrap();
        assert!(Savepoint::load(&path).is_err());

        // A truncated document (no closing tag) must not pass.
        std::fs::write(&path, "<savepoint>\n").unwrap();
        assert!(Savepoint::load(&path).is_err());
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("savepoint.xml");
        sample().save(&path).unwrap();
        let mut second = sample();
        second.durable_global_epoch = Epoch::from_raw(9);
        second.save(&path).unwrap();
        let loaded = Savepoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded.durable_global_epoch, Epoch::from_raw(9));
    }
}
