use std::{collections::HashMap, path::PathBuf};

use crate::{
    error::DbError,
    types::{Completion, DbResult},
};

/// Smallest journal file block we accept.
pub const MIN_JOURNAL_SIZE: u64 = 128 * 1024;

/// Largest journal file block we accept.
pub const MAX_JOURNAL_SIZE: u64 = 64 * 1024 * 1024 * 1024;

pub const DEFAULT_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

pub const DEFAULT_BUFFER_COUNT: usize = 512;

/// The page sizes a volume may be created with.
pub const VALID_PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

/// Specification of one volume, parsed from a `volume.N` option:
///
/// `path,pageSize:8192,initialPages:4,extensionPages:4,maximumPages:100000,create`
///
/// The flags `create` (create if absent), `createOnly` (fail if
/// present) and `readOnly` may appear in any order after the path.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub path: PathBuf,
    pub page_size: usize,
    pub initial_pages: u64,
    pub extension_pages: u64,
    pub maximum_pages: u64,
    pub create: bool,
    pub create_only: bool,
    pub read_only: bool,
}

impl VolumeSpec {
    pub fn parse(spec: &str) -> DbResult<VolumeSpec> {
        let mut parts = spec.split(',');
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| DbError::validation("volume specification has no path"))?;

        let mut v = VolumeSpec {
            path: PathBuf::from(path),
            page_size: 16384,
            initial_pages: 4,
            extension_pages: 4,
            maximum_pages: u64::MAX / 16384,
            create: false,
            create_only: false,
            read_only: false,
        };

        for part in parts {
            let part = part.trim();
            match part {
                "create" => v.create = true,
                "createOnly" => v.create_only = true,
                "readOnly" => v.read_only = true,
                _ => {
                    let mut kv = part.splitn(2, ':');
                    let key = kv.next().unwrap_or("");
                    let value = kv
                        .next()
                        .ok_or_else(|| {
                            DbError::validation(&format!("bad volume attribute: {}", part))
                        })?
                        .trim();
                    let number: u64 = value.parse().map_err(|_| {
                        DbError::validation(&format!("bad volume attribute value: {}", part))
                    })?;
                    match key {
                        "pageSize" => v.page_size = number as usize,
                        "initialPages" => v.initial_pages = number,
                        "extensionPages" => v.extension_pages = number,
                        "maximumPages" => v.maximum_pages = number,
                        _ => {
                            return Err(DbError::validation(&format!(
                                "unrecognized volume attribute: {}",
                                key
                            )))
                        }
                    }
                }
            }
        }

        if !VALID_PAGE_SIZES.contains(&v.page_size) {
            return Err(DbError::validation(&format!(
                "invalid page size: {}",
                v.page_size
            )));
        }
        if v.initial_pages < 1 {
            v.initial_pages = 1;
        }

        Ok(v)
    }

    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }
}

/// Engine configuration. Recognized option keys:
///
/// - `buffer.count.<pagesize>`: number of buffer frames of that page size
/// - `volume.N`: one volume specification per index
/// - `journalpath`: directory/prefix of journal files
/// - `journalsize`: block size per journal file
/// - `appendOnly`: freeze volume writes (used during backup)
/// - `readOnly`: disallow all mutations
#[derive(Debug, Clone)]
pub struct Config {
    pub volumes: Vec<VolumeSpec>,
    pub buffer_counts: HashMap<usize, usize>,
    pub journal_path: PathBuf,
    pub journal_size: u64,
    pub append_only: bool,
    pub read_only: bool,
}

impl Config {
    pub fn new() -> Config {
        Config {
            volumes: Vec::new(),
            buffer_counts: HashMap::new(),
            journal_path: PathBuf::from("vellum_journal"),
            journal_size: DEFAULT_JOURNAL_SIZE,
            append_only: false,
            read_only: false,
        }
    }

    /// Parse `key = value` lines. `#` starts a comment.
    pub fn parse(text: &str) -> DbResult<Config> {
        let mut config = Config::new();
        // volume.N options are ordered by N, not by appearance
        let mut volumes: Vec<(u64, VolumeSpec)> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut kv = line.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim();
            let value = kv
                .next()
                .ok_or_else(|| DbError::validation(&format!("bad option line: {}", line)))?
                .trim();

            config.set(key, value, &mut volumes)?;
        }

        volumes.sort_by_key(|(n, _)| *n);
        config.volumes = volumes.into_iter().map(|(_, v)| v).collect();
        Ok(config)
    }

    fn set(
        &mut self,
        key: &str,
        value: &str,
        volumes: &mut Vec<(u64, VolumeSpec)>,
    ) -> Completion {
        if let Some(rest) = key.strip_prefix("buffer.count.") {
            let page_size: usize = rest
                .parse()
                .map_err(|_| DbError::validation(&format!("bad buffer option: {}", key)))?;
            if !VALID_PAGE_SIZES.contains(&page_size) {
                return Err(DbError::validation(&format!(
                    "invalid page size in buffer option: {}",
                    key
                )));
            }
            let count: usize = value
                .parse()
                .map_err(|_| DbError::validation(&format!("bad buffer count: {}", value)))?;
            self.buffer_counts.insert(page_size, count);
            return Ok(());
        }

        if let Some(rest) = key.strip_prefix("volume.") {
            let index: u64 = rest
                .parse()
                .map_err(|_| DbError::validation(&format!("bad volume option: {}", key)))?;
            volumes.push((index, VolumeSpec::parse(value)?));
            return Ok(());
        }

        match key {
            "journalpath" => self.journal_path = PathBuf::from(value),
            "journalsize" => {
                let size: u64 = value
                    .parse()
                    .map_err(|_| DbError::validation(&format!("bad journal size: {}", value)))?;
                if size < MIN_JOURNAL_SIZE || size > MAX_JOURNAL_SIZE {
                    return Err(DbError::validation(&format!(
                        "journal size out of range: {}",
                        size
                    )));
                }
                self.journal_size = size;
            }
            "appendOnly" => self.append_only = parse_bool(value)?,
            "readOnly" => self.read_only = parse_bool(value)?,
            _ => {
                return Err(DbError::validation(&format!(
                    "unrecognized option: {}",
                    key
                )))
            }
        }
        Ok(())
    }

    /// Number of frames to allocate for the given page size.
    pub fn buffer_count(&self, page_size: usize) -> usize {
        self.buffer_counts
            .get(&page_size)
            .copied()
            .unwrap_or(DEFAULT_BUFFER_COUNT)
    }
}

fn parse_bool(value: &str) -> DbResult<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(DbError::validation(&format!("bad boolean: {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_volume_spec() {
        let v = VolumeSpec::parse(
            "/tmp/data/main.v01,pageSize:8192,initialPages:8,extensionPages:16,maximumPages:1000,create",
        )
        .unwrap();
        assert_eq!(v.page_size, 8192);
        assert_eq!(v.initial_pages, 8);
        assert_eq!(v.extension_pages, 16);
        assert_eq!(v.maximum_pages, 1000);
        assert!(v.create);
        assert!(!v.read_only);
        assert_eq!(v.name(), "main");
    }

    #[test]
    fn reject_bad_page_size() {
        assert!(VolumeSpec::parse("/tmp/x,pageSize:3000").is_err());
    }

    #[test]
    fn parse_full_config() {
        let text = "\
# engine options
journalpath = /tmp/journal/vellum
journalsize = 16777216
buffer.count.8192 = 64
volume.2 = /tmp/b.v01,pageSize:8192,create
volume.1 = /tmp/a.v01,pageSize:8192,create
readOnly = false
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.journal_size, 16777216);
        assert_eq!(config.buffer_count(8192), 64);
        assert_eq!(config.buffer_count(16384), DEFAULT_BUFFER_COUNT);
        assert_eq!(config.volumes.len(), 2);
        // ordered by index, not appearance
        assert_eq!(config.volumes[0].name(), "a");
        assert!(!config.read_only);
    }

    #[test]
    fn reject_unknown_option() {
        assert!(Config::parse("bogus = 1").is_err());
    }

    #[test]
    fn reject_tiny_journal() {
        assert!(Config::parse("journalsize = 1024").is_err());
    }
}
