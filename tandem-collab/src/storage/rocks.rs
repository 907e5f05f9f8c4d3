//! RocksDB-backed local store.
//!
//! Column families:
//! - `session`: room id and peer id (small, point lookups)
//! - `content`: editor text and CRDT state (LZ4 compressed, rewritten on
//!   every autosave)
//!
//! Session values are UTF-8 strings; content values are stored with
//! `lz4_flex::compress_prepend_size` so large documents stay cheap to rewrite.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{LocalStore, StoreError, CONTENT_KEY, SNAPSHOT_KEY};

const CF_SESSION: &str = "session";
const CF_CONTENT: &str = "content";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSION, CF_CONTENT];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, owned by one session task)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened local store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SESSION => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONTENT => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// All keys currently stored, across column families.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                keys.push(String::from_utf8(key.to_vec()).map_err(|_| StoreError::Encoding)?);
            }
        }
        Ok(keys)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    /// Read a value, undoing the LZ4 framing of the content family.
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf_name = Self::cf_for(key);
        let cf = self.cf(cf_name)?;
        let Some(raw) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };

        if cf_name == CF_CONTENT {
            lz4_flex::decompress_size_prepended(&raw)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string()))
        } else {
            Ok(Some(raw))
        }
    }

    fn put_raw(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf_name = Self::cf_for(key);
        let cf = self.cf(cf_name)?;
        let bytes = if cf_name == CF_CONTENT {
            lz4_flex::compress_prepend_size(value)
        } else {
            value.to_vec()
        };

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key.as_bytes(), &bytes, &write_opts)?;
        Ok(())
    }

    fn cf_for(key: &str) -> &'static str {
        if key == CONTENT_KEY || key == SNAPSHOT_KEY {
            CF_CONTENT
        } else {
            CF_SESSION
        }
    }
}

impl LocalStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get_raw(key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Encoding),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_raw(key, value.as_bytes())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf(Self::cf_for(key))?;
        self.db.delete_cf(cf, key.as_bytes())?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_raw(SNAPSHOT_KEY)
    }

    fn save_snapshot(&mut self, state: &[u8]) -> Result<(), StoreError> {
        self.put_raw(SNAPSHOT_KEY, state)
    }
}
