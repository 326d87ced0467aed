//! # Engine Options
//!
//! One plain struct per subsystem, all carried by [`EngineOptions`]. Every
//! option has a workable default; embedders either fill the structs directly
//! or drive the string interface (`set("log.log_buffer_kb", "512")`), which
//! recognizes the dotted key names below.
//!
//! | Key | Effect |
//! |-----|--------|
//! | `thread.group_count` | NUMA nodes to use |
//! | `thread.thread_count_per_group` | workers per node |
//! | `log.loggers_per_node` | logger threads per node |
//! | `log.log_buffer_kb` | per-worker log buffer size |
//! | `log.log_file_size_mb` | log file rotation threshold |
//! | `log.folder_path_pattern` | log file path, `$NODE$`/`$LOGGER$` tokens |
//! | `log.emulation.null_device` | discard log writes |
//! | `memory.page_pool_size_mb_per_node` | volatile page pool |
//! | `cache.snapshot_cache_size_mb_per_node` | snapshot cache budget |
//! | `cache.snapshot_cache_enabled` | snapshot cache on/off |
//! | `snapshot.folder_path_pattern` | snapshot dir, `$NODE$` token |
//! | `snapshot.reducer_buffer_records` | reducer spill threshold |
//! | `storage.hot_threshold` | 0..=256, pessimistic-read cutoff |
//! | `xct.max_read_set_size` | read set bound |
//! | `xct.max_write_set_size` | write set bound |
//! | `xct.large_read_set_threshold` | commit-time validation bound |
//! | `xct.epoch_advance_interval_ms` | global epoch tick |
//! | `soc.soc_type` | `threads` or `child_processes` |
//! | `savepoint.path` | savepoint file |

use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Result, WrapErr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocType {
    /// Workers are threads of this process.
    Threads,
    /// Workers are forked child processes sharing only the channel region.
    /// Recognized but not implemented by this crate.
    ChildProcesses,
}

#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub group_count: u8,
    pub thread_count_per_group: u8,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub loggers_per_node: u8,
    pub log_buffer_kb: u32,
    pub log_file_size_mb: u32,
    pub folder_path_pattern: String,
    pub emulation_null_device: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub page_pool_size_mb_per_node: u32,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub snapshot_cache_size_mb_per_node: u32,
    pub snapshot_cache_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub folder_path_pattern: String,
    pub reducer_buffer_records: usize,
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// 0..=256. Records at or above this temperature read pessimistically;
    /// 256 means no record ever does.
    pub hot_threshold: u16,
}

#[derive(Debug, Clone)]
pub struct XctOptions {
    pub max_read_set_size: usize,
    pub max_write_set_size: usize,
    pub large_read_set_threshold: usize,
    pub epoch_advance_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SocOptions {
    pub soc_type: SocType,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// All relative paths below resolve against this directory.
    pub root_path: PathBuf,
    pub thread: ThreadOptions,
    pub log: LogOptions,
    pub memory: MemoryOptions,
    pub cache: CacheOptions,
    pub snapshot: SnapshotOptions,
    pub storage: StorageOptions,
    pub xct: XctOptions,
    pub soc: SocOptions,
    pub savepoint_path: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            thread: ThreadOptions {
                group_count: 1,
                thread_count_per_group: 2,
            },
            log: LogOptions {
                loggers_per_node: 1,
                log_buffer_kb: 1024,
                log_file_size_mb: 64,
                folder_path_pattern: "log/node_$NODE$_logger_$LOGGER$".to_owned(),
                emulation_null_device: false,
            },
            memory: MemoryOptions {
                page_pool_size_mb_per_node: 4,
            },
            cache: CacheOptions {
                snapshot_cache_size_mb_per_node: 4,
                snapshot_cache_enabled: true,
            },
            snapshot: SnapshotOptions {
                folder_path_pattern: "snapshots/node_$NODE$".to_owned(),
                reducer_buffer_records: 1 << 16,
            },
            storage: StorageOptions { hot_threshold: 256 },
            xct: XctOptions {
                max_read_set_size: 4096,
                max_write_set_size: 1024,
                large_read_set_threshold: 8192,
                epoch_advance_interval_ms: 20,
            },
            soc: SocOptions {
                soc_type: SocType::Threads,
            },
            savepoint_path: PathBuf::from("savepoint.xml"),
        }
    }
}

fn expand_tokens(pattern: &str, node: u8, logger: Option<u16>) -> String {
    let mut out = pattern.replace("$NODE$", &node.to_string());
    if let Some(logger) = logger {
        out = out.replace("$LOGGER$", &logger.to_string());
    }
    out
}

impl EngineOptions {
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root_path: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn total_workers(&self) -> usize {
        self.thread.group_count as usize * self.thread.thread_count_per_group as usize
    }

    pub fn total_loggers(&self) -> usize {
        self.thread.group_count as usize * self.log.loggers_per_node as usize
    }

    /// Base path (no ordinal suffix) for one logger's files.
    pub fn log_path(&self, node: u8, logger_in_node: u16) -> PathBuf {
        self.root_path.join(expand_tokens(
            &self.log.folder_path_pattern,
            node,
            Some(logger_in_node),
        ))
    }

    /// `<base>.<ordinal>`, the actual file the logger writes.
    pub fn log_file_path(&self, node: u8, logger_in_node: u16, ordinal: u32) -> PathBuf {
        let mut path = self.log_path(node, logger_in_node).into_os_string();
        path.push(format!(".{}", ordinal));
        PathBuf::from(path)
    }

    pub fn snapshot_dir(&self, node: u8) -> PathBuf {
        self.root_path
            .join(expand_tokens(&self.snapshot.folder_path_pattern, node, None))
    }

    pub fn savepoint_file(&self) -> PathBuf {
        self.root_path.join(&self.savepoint_path)
    }

    pub fn log_buffer_bytes(&self) -> usize {
        self.log.log_buffer_kb as usize * 1024
    }

    pub fn log_file_rotate_bytes(&self) -> u64 {
        u64::from(self.log.log_file_size_mb) << 20
    }

    /// String interface over the recognized dotted keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .parse::<T>()
                .wrap_err_with(|| format!("invalid value {:?} for {:?}", value, key))
        }
        fn parse_bool(key: &str, value: &str) -> Result<bool> {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(true),
                "0" | "false" | "off" | "no" => Ok(false),
                _ => Err(eyre!("invalid boolean {:?} for {:?}", value, key)),
            }
        }

        match key {
            "thread.group_count" => self.thread.group_count = parse(key, value)?,
            "thread.thread_count_per_group" => {
                self.thread.thread_count_per_group = parse(key, value)?
            }
            "log.loggers_per_node" => self.log.loggers_per_node = parse(key, value)?,
            "log.log_buffer_kb" => self.log.log_buffer_kb = parse(key, value)?,
            "log.log_file_size_mb" => self.log.log_file_size_mb = parse(key, value)?,
            "log.folder_path_pattern" => self.log.folder_path_pattern = value.to_owned(),
            "log.emulation.null_device" => {
                self.log.emulation_null_device = parse_bool(key, value)?
            }
            "memory.page_pool_size_mb_per_node" => {
                self.memory.page_pool_size_mb_per_node = parse(key, value)?
            }
            "cache.snapshot_cache_size_mb_per_node" => {
                self.cache.snapshot_cache_size_mb_per_node = parse(key, value)?
            }
            "cache.snapshot_cache_enabled" => {
                self.cache.snapshot_cache_enabled = parse_bool(key, value)?
            }
            "snapshot.folder_path_pattern" => {
                self.snapshot.folder_path_pattern = value.to_owned()
            }
            "snapshot.reducer_buffer_records" => {
                self.snapshot.reducer_buffer_records = parse(key, value)?
            }
            "storage.hot_threshold" => {
                let threshold: u16 = parse(key, value)?;
                if threshold > 256 {
                    bail!("storage.hot_threshold must be 0..=256, got {}", threshold);
                }
                self.storage.hot_threshold = threshold;
            }
            "xct.max_read_set_size" => self.xct.max_read_set_size = parse(key, value)?,
            "xct.max_write_set_size" => self.xct.max_write_set_size = parse(key, value)?,
            "xct.large_read_set_threshold" => {
                self.xct.large_read_set_threshold = parse(key, value)?
            }
            "xct.epoch_advance_interval_ms" => {
                self.xct.epoch_advance_interval_ms = parse(key, value)?
            }
            "soc.soc_type" => {
                self.soc.soc_type = match value {
                    "threads" => SocType::Threads,
                    "child_processes" => SocType::ChildProcesses,
                    other => bail!("unknown soc.soc_type {:?}", other),
                }
            }
            "savepoint.path" => self.savepoint_path = PathBuf::from(value),
            other => bail!("unknown engine option {:?}", other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = EngineOptions::default();
        assert_eq!(opts.total_workers(), 2);
        assert_eq!(opts.total_loggers(), 1);
        assert_eq!(opts.storage.hot_threshold, 256);
        assert_eq!(opts.soc.soc_type, SocType::Threads);
    }

    #[test]
    fn set_updates_typed_fields() {
        let mut opts = EngineOptions::default();
        opts.set("thread.group_count", "4").unwrap();
        opts.set("thread.thread_count_per_group", "8").unwrap();
        opts.set("log.emulation.null_device", "true").unwrap();
        opts.set("storage.hot_threshold", "10").unwrap();
        assert_eq!(opts.total_workers(), 32);
        assert!(opts.log.emulation_null_device);
        assert_eq!(opts.storage.hot_threshold, 10);
    }

    #[test]
    fn set_rejects_bad_values() {
        let mut opts = EngineOptions::default();
        assert!(opts.set("thread.group_count", "lots").is_err());
        assert!(opts.set("storage.hot_threshold", "257").is_err());
        assert!(opts.set("soc.soc_type", "fibers").is_err());
        assert!(opts.set("no.such.key", "1").is_err());
    }

    #[test]
    fn path_tokens_expand() {
        let mut opts = EngineOptions::with_root("/data");
        opts.set("log.folder_path_pattern", "wal/n$NODE$_l$LOGGER$")
            .unwrap();
        assert_eq!(
            opts.log_file_path(2, 1, 7),
            PathBuf::from("/data/wal/n2_l1.7")
        );
        assert_eq!(opts.snapshot_dir(3), PathBuf::from("/data/snapshots/node_3"));
    }
}
