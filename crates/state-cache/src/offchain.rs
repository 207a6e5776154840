//! Expiring key value cache for data that is not indexed by block, like
//! quotes of off-chain market makers.

use {
    anyhow::Result,
    moka::{Expiry, sync::Cache},
    std::{
        collections::HashMap,
        fmt::{self, Display, Formatter},
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    pub namespace: String,
    pub network: u64,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, network: u64, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            network,
            key: key.into(),
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}_{}_{}", self.namespace, self.network, self.key)
    }
}

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait OffchainCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>>;

    /// Stores a value that expires after `ttl`.
    async fn setex(&self, key: &CacheKey, ttl: Duration, value: String) -> Result<()>;

    /// Reads one field of a hash.
    async fn hget(&self, key: &CacheKey, field: &str) -> Result<Option<String>>;

    /// Sets one field of a hash. The whole hash expires `ttl` after its last
    /// write.
    async fn hset(
        &self,
        key: &CacheKey,
        ttl: Duration,
        field: &str,
        value: String,
    ) -> Result<()>;
}

type Fields = Arc<Mutex<HashMap<String, String>>>;

#[derive(Clone)]
enum Entry {
    Value { value: String, ttl: Duration },
    Hash { fields: Fields, ttl: Duration },
}

struct EntryTtl;

impl EntryTtl {
    fn ttl(entry: &Entry) -> Option<Duration> {
        match entry {
            Entry::Value { ttl, .. } | Entry::Hash { ttl, .. } => Some(*ttl),
        }
    }
}

impl Expiry<CacheKey, Entry> for EntryTtl {
    fn expire_after_create(&self, _: &CacheKey, entry: &Entry, _: Instant) -> Option<Duration> {
        Self::ttl(entry)
    }

    fn expire_after_update(
        &self,
        _: &CacheKey,
        entry: &Entry,
        _: Instant,
        _: Option<Duration>,
    ) -> Option<Duration> {
        Self::ttl(entry)
    }
}

/// [`OffchainCache`] living in process memory.
pub struct InMemoryOffchainCache {
    cache: Cache<CacheKey, Entry>,
}

impl InMemoryOffchainCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
        }
    }
}

#[async_trait::async_trait]
impl OffchainCache for InMemoryOffchainCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        match self.cache.get(key) {
            None => Ok(None),
            Some(Entry::Value { value, .. }) => Ok(Some(value)),
            Some(Entry::Hash { .. }) => anyhow::bail!("{key} holds a hash"),
        }
    }

    async fn setex(&self, key: &CacheKey, ttl: Duration, value: String) -> Result<()> {
        self.cache.insert(key.clone(), Entry::Value { value, ttl });
        Ok(())
    }

    async fn hget(&self, key: &CacheKey, field: &str) -> Result<Option<String>> {
        match self.cache.get(key) {
            None => Ok(None),
            Some(Entry::Hash { fields, .. }) => Ok(fields.lock().unwrap().get(field).cloned()),
            Some(Entry::Value { .. }) => anyhow::bail!("{key} does not hold a hash"),
        }
    }

    async fn hset(
        &self,
        key: &CacheKey,
        ttl: Duration,
        field: &str,
        value: String,
    ) -> Result<()> {
        let fields: Fields = match self.cache.get(key) {
            None => Default::default(),
            Some(Entry::Hash { fields, .. }) => fields,
            Some(Entry::Value { .. }) => anyhow::bail!("{key} does not hold a hash"),
        };
        fields.lock().unwrap().insert(field.to_string(), value);
        // Reinserting restarts the expiry of the hash.
        self.cache.insert(key.clone(), Entry::Hash { fields, ttl });
        Ok(())
    }
}
