//! Read-through cache with staged staleness tolerance.
//!
//! A value younger than `fresh_until` is served as is. Once stale, the three
//! [`StaleTolerance`] windows apply in order: serve without revalidating, serve while
//! revalidating in the background, and serve only if revalidation fails.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleTolerance {
    pub without_revalidation: Duration,
    pub while_revalidating: Duration,
    pub if_unreachable: Duration,
}

impl StaleTolerance {
    /// Each window is clamped to be at least as wide as the one before it.
    pub fn from_secs(windows: [u64; 3]) -> Self {
        let first = windows[0];
        let second = windows[1].max(first);
        let third = windows[2].max(second);
        Self {
            without_revalidation: Duration::from_secs(first),
            while_revalidating: Duration::from_secs(second),
            if_unreachable: Duration::from_secs(third),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheDirectives {
    pub fresh_until: Duration,
    pub max_stale: StaleTolerance,
}

/// Per-call constraints supplied by a reader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerDirectives {
    pub max_age: Option<Duration>,
}

#[async_trait]
pub trait Producer<K, V>: Send + Sync {
    async fn produce(&self, key: &K) -> Result<V, StoreError>;
}

struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

pub struct Cached<K, V> {
    producer: Arc<dyn Producer<K, V>>,
    directives: CacheDirectives,
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    revalidating: Arc<Mutex<HashSet<K>>>,
}

impl<K, V> Clone for Cached<K, V> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            directives: self.directives,
            entries: Arc::clone(&self.entries),
            revalidating: Arc::clone(&self.revalidating),
        }
    }
}

impl<K, V> Cached<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(producer: Arc<dyn Producer<K, V>>, directives: CacheDirectives) -> Self {
        Self {
            producer,
            directives,
            entries: Arc::new(RwLock::new(HashMap::new())),
            revalidating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn get(&self, key: &K, consumer: ConsumerDirectives) -> Result<V, StoreError> {
        let stored = {
            let entries = self.entries.read().await;
            entries.get(key).map(|entry| (entry.value.clone(), entry.fetched_at.elapsed()))
        };

        let Some((value, age)) = stored else {
            return self.refresh(key).await;
        };

        if consumer.max_age.is_some_and(|max_age| age > max_age) {
            return self.refresh(key).await;
        }
        if age <= self.directives.fresh_until {
            return Ok(value);
        }

        let stale_for = age - self.directives.fresh_until;
        let tolerance = self.directives.max_stale;
        if stale_for <= tolerance.without_revalidation {
            return Ok(value);
        }
        if stale_for <= tolerance.while_revalidating {
            self.revalidate_in_background(key.clone());
            return Ok(value);
        }

        match self.refresh(key).await {
            Ok(fresh) => Ok(fresh),
            Err(error) if stale_for <= tolerance.if_unreachable => {
                warn!(
                    event_name = "cache.revalidation.failed",
                    key = ?key,
                    stale_ms = stale_for.as_millis() as u64,
                    error = %error,
                    "serving stale cache entry after failed revalidation"
                );
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    async fn refresh(&self, key: &K) -> Result<V, StoreError> {
        let value = self.producer.produce(key).await?;
        self.entries
            .write()
            .await
            .insert(key.clone(), Entry { value: value.clone(), fetched_at: Instant::now() });
        Ok(value)
    }

    fn revalidate_in_background(&self, key: K) {
        let claimed = match self.revalidating.lock() {
            Ok(mut inflight) => inflight.insert(key.clone()),
            Err(poisoned) => poisoned.into_inner().insert(key.clone()),
        };
        if !claimed {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(error) = cache.refresh(&key).await {
                debug!(
                    event_name = "cache.revalidation.failed",
                    key = ?key,
                    error = %error,
                    "background revalidation failed"
                );
            }
            match cache.revalidating.lock() {
                Ok(mut inflight) => inflight.remove(&key),
                Err(poisoned) => poisoned.into_inner().remove(&key),
            };
        });
    }
}
