//! LMDB-backed store, shared by processes on one host.
//!
//! Uses the heed crate (Rust bindings for LMDB). The environment is opened
//! in `initialize`, so an unreachable directory surfaces as a
//! [`ConnectionError`] rather than at construction.
//!
//! # Layout
//!
//! Three named databases. Every key starts with the key prefix as a
//! length-prefixed segment (`[u32 BE len][bytes]`), so no prefix is ever a
//! byte prefix of another cache's namespace:
//!
//! ```text
//! items     <prefix>{key}          -> [i64 last access millis][entry codec bytes]
//! forward   <prefix>{key}          -> JSON list of dependency keys
//! reverse   <prefix><dep>{key}     -> (empty)
//! ```
//!
//! The reverse table turns dependency invalidation into a prefix walk.
//! Dependencies are not part of the entry bytes; reads rebuild them from
//! the forward table.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Reads use a read transaction; every
//! mutation of the three tables happens inside one write transaction, so a
//! concurrent reader sees an entry either fully indexed or absent.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cairn_core::{
    CacheEntry, CacheError, CacheKey, CacheResult, ConnectionError, DependencyKey, EntryCodec,
    InvalidEntryError, StorageError, Timestamp,
};
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use tokio_util::sync::CancellationToken;

use super::lifecycle::{check_cancelled, BackendStatus, Lifecycle};
use super::traits::{
    BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend, StatCounters,
};

/// Default LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

#[derive(Debug, Clone)]
pub struct LmdbOptions {
    /// Directory holding the LMDB files. Created if missing.
    pub path: PathBuf,
    pub map_size_mb: usize,
    pub key_prefix: String,
    pub codec: EntryCodec,
}

impl LmdbOptions {
    pub fn new(path: impl Into<PathBuf>, codec: EntryCodec) -> Self {
        Self {
            path: path.into(),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
            key_prefix: "cairn".to_string(),
            codec,
        }
    }

    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }
}

fn txn_err(e: heed::Error) -> CacheError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
    .into()
}

struct LmdbStore {
    env: Env,
    items: Database<Bytes, Bytes>,
    forward: Database<Bytes, Bytes>,
    reverse: Database<Bytes, Bytes>,
}

impl fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbStore").finish_non_exhaustive()
    }
}

impl LmdbStore {
    fn open(options: &LmdbOptions) -> CacheResult<Self> {
        let unreachable = |reason: String| -> CacheError {
            ConnectionError::Unreachable {
                endpoint: options.path.display().to_string(),
                reason,
            }
            .into()
        };

        std::fs::create_dir_all(&options.path).map_err(|e| unreachable(e.to_string()))?;

        // SAFETY: the environment is opened once per backend and never
        // mapped with conflicting flags inside this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size_mb.max(1) * 1024 * 1024)
                .max_dbs(3)
                .open(options.path.as_path())
        }
        .map_err(|e| unreachable(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let items = env
            .create_database(&mut wtxn, Some("items"))
            .map_err(txn_err)?;
        let forward = env
            .create_database(&mut wtxn, Some("forward"))
            .map_err(txn_err)?;
        let reverse = env
            .create_database(&mut wtxn, Some("reverse"))
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            items,
            forward,
            reverse,
        })
    }

    fn dependencies(&self, txn: &RoTxn, item_key: &[u8]) -> CacheResult<Vec<DependencyKey>> {
        match self.forward.get(txn, item_key).map_err(txn_err)? {
            Some(raw) => serde_json::from_slice(raw).map_err(|e| {
                InvalidEntryError::Malformed {
                    reason: format!("dependency list: {e}"),
                }
                .into()
            }),
            None => Ok(Vec::new()),
        }
    }

    fn keys_with_prefix(
        &self,
        txn: &RoTxn,
        db: Database<Bytes, Bytes>,
        prefix: &[u8],
    ) -> CacheResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for result in db.prefix_iter(txn, prefix).map_err(txn_err)? {
            let (key, _) = result.map_err(txn_err)?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

/// Item record: `[i64 last access millis][entry bytes]`.
fn encode_record(last_access: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(8 + payload.len());
    record.extend_from_slice(&last_access.timestamp_millis().to_le_bytes());
    record.extend_from_slice(payload);
    record
}

fn decode_record(raw: &[u8]) -> CacheResult<(Timestamp, &[u8])> {
    if raw.len() < 8 {
        return Err(InvalidEntryError::Truncated {
            context: "last access timestamp".to_string(),
        }
        .into());
    }
    let (head, payload) = raw.split_at(8);
    let mut millis = [0u8; 8];
    millis.copy_from_slice(head);
    let last_access = DateTime::from_timestamp_millis(i64::from_le_bytes(millis)).ok_or(
        InvalidEntryError::Malformed {
            reason: "last access timestamp out of range".to_string(),
        },
    )?;
    Ok((last_access, payload))
}

/// Durable far-tier store on LMDB.
///
/// # Example
///
/// ```ignore
/// let codec = EntryCodec::new(Arc::new(JsonValueSerializer::new(registry)));
/// let backend = LmdbBackend::new(LmdbOptions::new("/var/cache/app", codec));
/// backend.initialize(&CancellationToken::new()).await?;
/// backend.set_entry(&"product:7".into(), CacheEntry::new(42i64)).await?;
/// ```
#[derive(Debug)]
pub struct LmdbBackend {
    options: LmdbOptions,
    store: RwLock<Option<Arc<LmdbStore>>>,
    counters: StatCounters,
    lifecycle: Lifecycle,
    layer: u32,
}

impl LmdbBackend {
    pub fn new(options: LmdbOptions) -> Self {
        Self {
            options,
            store: RwLock::new(None),
            counters: StatCounters::default(),
            lifecycle: Lifecycle::new("lmdb"),
            layer: 0,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn options(&self) -> &LmdbOptions {
        &self.options
    }

    fn store(&self) -> CacheResult<Arc<LmdbStore>> {
        self.lifecycle.ensure_ready()?;
        self.store.read()?.clone().ok_or_else(closed_env)
    }

    fn item_key(&self, key: &CacheKey) -> Vec<u8> {
        let mut item_key = self.namespace();
        item_key.extend_from_slice(key.as_str().as_bytes());
        item_key
    }

    fn namespace(&self) -> Vec<u8> {
        let mut namespace = Vec::with_capacity(4 + self.options.key_prefix.len());
        push_segment(&mut namespace, &self.options.key_prefix);
        namespace
    }

    fn dependency_prefix(&self, dependency: &DependencyKey) -> Vec<u8> {
        let mut prefix = self.namespace();
        push_segment(&mut prefix, dependency.as_str());
        prefix
    }

    fn reverse_key(&self, dependency: &DependencyKey, key: &CacheKey) -> Vec<u8> {
        let mut reverse = self.dependency_prefix(dependency);
        reverse.extend_from_slice(key.as_str().as_bytes());
        reverse
    }

    /// Drop an item and its dependency links inside `wtxn`.
    fn remove_in(&self, store: &LmdbStore, wtxn: &mut RwTxn, key: &CacheKey) -> CacheResult<bool> {
        let item_key = self.item_key(key);
        for dependency in store.dependencies(wtxn, &item_key)? {
            store
                .reverse
                .delete(wtxn, &self.reverse_key(&dependency, key))
                .map_err(txn_err)?;
        }
        store.forward.delete(wtxn, &item_key).map_err(txn_err)?;
        store.items.delete(wtxn, &item_key).map_err(txn_err)
    }

    /// Read and decode an item without touching statistics.
    fn load(
        &self,
        store: &LmdbStore,
        key: &CacheKey,
    ) -> CacheResult<Option<(Timestamp, Vec<u8>, CacheEntry)>> {
        let item_key = self.item_key(key);
        let rtxn = store.env.read_txn().map_err(txn_err)?;
        let Some(raw) = store.items.get(&rtxn, &item_key).map_err(txn_err)? else {
            return Ok(None);
        };
        let (last_access, payload) = decode_record(raw)?;
        let dependencies = store.dependencies(&rtxn, &item_key)?;
        let entry = self.options.codec.from_bytes(payload, dependencies)?;
        Ok(Some((last_access, raw.to_vec(), entry)))
    }

    /// Apply `update` to the item if its record still equals `seen`.
    fn if_unchanged<F>(&self, store: &LmdbStore, key: &CacheKey, seen: &[u8], update: F) -> CacheResult<()>
    where
        F: FnOnce(&mut RwTxn) -> CacheResult<()>,
    {
        let mut wtxn = store.env.write_txn().map_err(txn_err)?;
        let current = store
            .items
            .get(&wtxn, &self.item_key(key))
            .map_err(txn_err)?
            .map(|raw| raw == seen)
            .unwrap_or(false);
        if current {
            update(&mut wtxn)?;
            wtxn.commit().map_err(txn_err)?;
        }
        Ok(())
    }

    fn is_live(&self, store: &LmdbStore, key: &CacheKey, now: Timestamp) -> CacheResult<bool> {
        Ok(self
            .load(store, key)?
            .is_some_and(|(last_access, _, entry)| !entry.is_expired_at(now, last_access)))
    }
}

/// Append `segment` as `[u32 BE len][bytes]`.
fn push_segment(out: &mut Vec<u8>, segment: &str) {
    out.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    out.extend_from_slice(segment.as_bytes());
}

fn closed_env() -> CacheError {
    StorageError::Transaction {
        reason: "LMDB environment is closed".to_string(),
    }
    .into()
}

#[async_trait]
impl CachingBackend for LmdbBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("lmdb", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::local()
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle
            .run_initialize(|| async {
                check_cancelled(cancellation, "lmdb initialize")?;
                let store = LmdbStore::open(&self.options)?;
                *self.store.write()? = Some(Arc::new(store));
                tracing::info!(
                    path = %self.options.path.display(),
                    prefix = %self.options.key_prefix,
                    "LMDB store opened"
                );
                Ok(())
            })
            .await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let store = self.store()?;
        let now = Utc::now();

        let Some((last_access, seen, entry)) = self.load(&store, key)? else {
            self.counters.record_miss();
            return Ok(None);
        };

        if entry.is_expired_at(now, last_access) {
            self.if_unchanged(&store, key, &seen, |wtxn| {
                self.remove_in(&store, wtxn, key).map(|_| ())
            })?;
            self.counters.record_expirations(1);
            self.counters.record_miss();
            return Ok(None);
        }

        if entry.sliding_expiration.is_some() {
            let touched = encode_record(now, &seen[8..]);
            self.if_unchanged(&store, key, &seen, |wtxn| {
                store
                    .items
                    .put(wtxn, &self.item_key(key), &touched)
                    .map_err(txn_err)
            })?;
        }

        self.counters.record_hit();
        Ok(Some(entry))
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        let store = self.store()?;
        let payload = self.options.codec.to_bytes(&entry)?;
        let record = encode_record(Utc::now(), &payload);
        let item_key = self.item_key(key);

        let mut wtxn = store.env.write_txn().map_err(txn_err)?;
        self.remove_in(&store, &mut wtxn, key)?;
        store
            .items
            .put(&mut wtxn, &item_key, &record)
            .map_err(txn_err)?;
        if entry.has_dependencies() {
            let dependencies =
                serde_json::to_vec(&entry.dependencies).map_err(|e| StorageError::Serialization {
                    reason: e.to_string(),
                })?;
            store
                .forward
                .put(&mut wtxn, &item_key, &dependencies)
                .map_err(txn_err)?;
            for dependency in &entry.dependencies {
                store
                    .reverse
                    .put(&mut wtxn, &self.reverse_key(dependency, key), &[])
                    .map_err(txn_err)?;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.counters.record_write();
        Ok(())
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        let store = self.store()?;
        self.is_live(&store, key, Utc::now())
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        let store = self.store()?;
        let mut wtxn = store.env.write_txn().map_err(txn_err)?;
        let removed = self.remove_in(&store, &mut wtxn, key)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        let store = self.store()?;
        let rtxn = store.env.read_txn().map_err(txn_err)?;
        let mut links = store
            .reverse
            .prefix_iter(&rtxn, &self.dependency_prefix(dependency))
            .map_err(txn_err)?;
        let found = links.next().transpose().map_err(txn_err)?.is_some();
        Ok(found)
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        let store = self.store()?;
        let prefix = self.dependency_prefix(dependency);

        let mut wtxn = store.env.write_txn().map_err(txn_err)?;
        let links = store.keys_with_prefix(&wtxn, store.reverse, &prefix)?;
        let mut removed = 0u64;
        for link in links {
            let key = String::from_utf8(link[prefix.len()..].to_vec()).map_err(|e| {
                InvalidEntryError::Malformed {
                    reason: format!("dependency link key: {e}"),
                }
            })?;
            if self.remove_in(&store, &mut wtxn, &CacheKey::from(key))? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.counters.record_invalidations(removed);
        tracing::debug!(dependency = %dependency, removed, "Dependency invalidated");
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let store = self.store()?;
        let namespace = self.namespace();

        let mut wtxn = store.env.write_txn().map_err(txn_err)?;
        for db in [store.items, store.forward, store.reverse] {
            for key in store.keys_with_prefix(&wtxn, db, &namespace)? {
                db.delete(&mut wtxn, &key).map_err(txn_err)?;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.lifecycle.begin_dispose() {
            return Ok(());
        }
        // The environment closes once the last in-flight operation drops
        // its handle.
        let closed: CacheResult<()> = self
            .store
            .write()
            .map(|mut store| {
                store.take();
            })
            .map_err(CacheError::from);
        self.lifecycle.complete_dispose();
        closed
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let store = self.store.read()?.clone();
        let entry_count = match store {
            Some(store) => {
                let rtxn = store.env.read_txn().map_err(txn_err)?;
                let mut count = 0u64;
                for result in store
                    .items
                    .prefix_iter(&rtxn, &self.namespace())
                    .map_err(txn_err)?
                {
                    result.map_err(txn_err)?;
                    count += 1;
                }
                count
            }
            None => 0,
        };
        Ok(self.counters.snapshot(entry_count))
    }
}
