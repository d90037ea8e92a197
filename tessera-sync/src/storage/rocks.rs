//! RocksDB-backed key-value store.
//!
//! Column families:
//! - `documents`: Document blobs keyed by document id (LZ4 compressed)
//! - `metadata`: Lock records keyed by document id (bincode)
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::kv::{KeyValueStore, LockMeta};
use super::StorageError;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Durable [`KeyValueStore`] on RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                // Lock records churn on every locked write
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// All keys holding a document blob.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Deserialization(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl KeyValueStore for RocksStore {
    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_item(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = lz4_flex::compress_prepend_size(value);
        log::trace!("Storing {key}: {} -> {} bytes", value.len(), compressed.len());
        self.db.put_cf_opt(&cf, key.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, key.as_bytes());
        batch.delete_cf(&cf_meta, key.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<LockMeta>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => LockMeta::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set_meta(&self, key: &str, meta: LockMeta) -> Result<(), StorageError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf_opt(&cf, key.as_bytes(), meta.encode()?, &self.write_options())?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_item_roundtrip() {
        let (_dir, store) = open_temp();
        let data = b"Hello, tessera! A document blob with enough data to compress.".to_vec();

        store.set_item("doc-1", &data).await.unwrap();
        assert_eq!(store.get_item("doc-1").await.unwrap(), Some(data));
        assert_eq!(store.get_item("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get_meta("doc").await.unwrap(), None);

        store.set_meta("doc", LockMeta::expiring_at(1234)).await.unwrap();
        assert_eq!(store.get_meta("doc").await.unwrap(), Some(LockMeta { ttl: 1234 }));
    }

    #[tokio::test]
    async fn test_remove_item_clears_meta() {
        let (_dir, store) = open_temp();
        store.set_item("doc", b"data").await.unwrap();
        store.set_meta("doc", LockMeta::expiring_at(5)).await.unwrap();

        store.remove_item("doc").await.unwrap();
        assert_eq!(store.get_item("doc").await.unwrap(), None);
        assert_eq!(store.get_meta("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_listed() {
        let (_dir, store) = open_temp();
        for name in ["a", "b/c", "d:e"] {
            store.set_item(name, b"x").await.unwrap();
        }
        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b/c", "d:e"]);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.set_item("doc", &[1, 2, 3]).await.unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.get_item("doc").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_large_item() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        store.set_item("big", &data).await.unwrap();
        let loaded = store.get_item("big").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1_000_000);
        assert_eq!(loaded[999_999], 42);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
