//! Content-addressed HTTP response cache with per-key single-flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use trendscout_core::{CacheEntry, Clock};

use crate::db::Database;
use crate::http::{FetchError, FetchedResponse, RequestDescriptor};

#[derive(Debug, Error)]
pub enum CacheError {
    /// Upstream failed; nothing was cached.
    #[error("upstream fetch failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("cache ttl {0:?} is out of range")]
    InvalidTtl(Duration),
    #[error("cache store unavailable: {0:#}")]
    Store(anyhow::Error),
}

impl CacheError {
    /// Store failures are infrastructure-level; fetch failures only affect one query.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::InvalidTtl(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub entry: CacheEntry,
    pub from_cache: bool,
}

type CacheKey = (String, String);
type InflightMap = StdMutex<HashMap<CacheKey, Arc<Mutex<()>>>>;

/// A caller's claim on one key's lock. Dropping the last claim removes the key,
/// including when the owning future is cancelled mid-fetch.
struct KeyLease<'a> {
    inflight: &'a InflightMap,
    key: CacheKey,
    lock: Arc<Mutex<()>>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and this lease are the only holders: nobody is queued on this key
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

#[derive(Debug)]
pub struct CacheStore {
    db: Database,
    clock: Arc<dyn Clock>,
    inflight: InflightMap,
}

impl CacheStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Return the fresh cached response for `request`, or run `fetch` and cache its result.
    ///
    /// Callers racing on the same `(url, fingerprint)` queue behind one key lock, so
    /// only the first performs the fetch and the rest read the row it wrote.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        request: &RequestDescriptor,
        ttl: Duration,
        fetch: F,
    ) -> Result<CachedResponse, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedResponse, FetchError>>,
    {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
        let key: CacheKey = (request.url.clone(), request.fingerprint());

        let lease = self.lease(key);
        let _guard = lease.lock.lock().await;
        let result = self.lookup_or_fetch(&lease.key, ttl, fetch).await;
        result
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.db.purge_expired_cache(self.clock.now()).await
    }

    async fn lookup_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: chrono::Duration,
        fetch: F,
    ) -> Result<CachedResponse, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedResponse, FetchError>>,
    {
        let (url, request_hash) = key;
        let now = self.clock.now();

        if let Some(entry) = self
            .db
            .get_cache_entry(url, request_hash)
            .await
            .map_err(CacheError::Store)?
        {
            if entry.is_fresh_at(now) {
                debug!(%url, %request_hash, "cache hit");
                return Ok(CachedResponse {
                    entry,
                    from_cache: true,
                });
            }
            debug!(%url, %request_hash, expired_at = %entry.expires_at, "cache entry expired");
        }

        let response = fetch().await.map_err(CacheError::Fetch)?;
        if !response.is_success() {
            return Err(CacheError::Fetch(FetchError::HttpStatus {
                status: response.status,
                url: response.final_url,
            }));
        }

        let fetched_at = self.clock.now();
        let expires_at = fetched_at
            .checked_add_signed(ttl)
            .ok_or(CacheError::InvalidTtl(ttl.to_std().unwrap_or(Duration::MAX)))?;
        let entry = CacheEntry {
            url: url.clone(),
            request_hash: request_hash.clone(),
            status_code: response.status,
            headers: response.headers,
            content_type: response.content_type,
            body: response.body,
            fetched_at,
            expires_at,
        };
        self.db
            .upsert_cache_entry(&entry)
            .await
            .map_err(CacheError::Store)?;
        debug!(%url, %request_hash, %expires_at, "cache stored");

        Ok(CachedResponse {
            entry,
            from_cache: false,
        })
    }

    fn lease(&self, key: CacheKey) -> KeyLease<'_> {
        let lock = {
            let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        KeyLease {
            inflight: &self.inflight,
            key,
            lock,
        }
    }

    #[cfg(test)]
    fn inflight_keys(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trendscout_core::FixedClock;

    const TTL: Duration = Duration::from_secs(600);

    fn request(keyword: &str) -> RequestDescriptor {
        RequestDescriptor::get("https://makerworld.com/api/search/models")
            .query("keyword", keyword)
            .query("page", 1)
    }

    fn ok_body(body: &str) -> FetchedResponse {
        FetchedResponse {
            status: 200,
            final_url: "https://makerworld.com/api/search/models".into(),
            headers: BTreeMap::new(),
            content_type: "application/json".into(),
            body: body.as_bytes().to_vec(),
        }
    }

    async fn store() -> (Arc<CacheStore>, Arc<FixedClock>) {
        let db = Database::connect_in_memory().await.expect("db");
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 12, 6, 0, 0).single().unwrap(),
        ));
        (Arc::new(CacheStore::new(db, clock.clone())), clock)
    }

    async fn counted_fetch(
        cache: &CacheStore,
        req: &RequestDescriptor,
        calls: &AtomicUsize,
        body: &str,
    ) -> Result<CachedResponse, CacheError> {
        cache
            .get_or_fetch(req, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ok_body(body))
            })
            .await
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_skips_the_network() {
        let (cache, _clock) = store().await;
        let calls = AtomicUsize::new(0);
        let req = request("fidget toy");

        let first = counted_fetch(&cache, &req, &calls, "v1").await.unwrap();
        let second = counted_fetch(&cache, &req, &calls, "v2").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.entry.body, b"v1".to_vec());
    }

    #[tokio::test]
    async fn expiry_triggers_exactly_one_refetch_and_overwrites() {
        let (cache, clock) = store().await;
        let calls = AtomicUsize::new(0);
        let req = request("fidget toy");

        let first = counted_fetch(&cache, &req, &calls, "v1").await.unwrap();
        clock.advance(chrono::Duration::seconds(600));
        let refreshed = counted_fetch(&cache, &req, &calls, "v2").await.unwrap();
        let again = counted_fetch(&cache, &req, &calls, "v3").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!refreshed.from_cache);
        assert!(again.from_cache);
        assert_eq!(again.entry.body, b"v2".to_vec());
        assert!(again.entry.fetched_at > first.entry.fetched_at);
        assert_eq!(
            again.entry.expires_at,
            again.entry.fetched_at + chrono::Duration::seconds(600)
        );
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let (cache, _clock) = store().await;
        let calls = AtomicUsize::new(0);
        let req = request("fidget toy");

        let err = cache
            .get_or_fetch(&req, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Unavailable("timeout".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));
        assert!(!err.is_fatal());

        let non_success = cache
            .get_or_fetch(&req, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(FetchedResponse {
                    status: 503,
                    ..ok_body("busy")
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            non_success,
            CacheError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));

        let recovered = counted_fetch(&cache, &req, &calls, "v1").await.unwrap();
        assert!(!recovered.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fingerprints_separate_entries() {
        let (cache, _clock) = store().await;
        let calls = AtomicUsize::new(0);

        counted_fetch(&cache, &request("fidget toy"), &calls, "a").await.unwrap();
        counted_fetch(&cache, &request("desk toy"), &calls, "b").await.unwrap();
        let reordered = RequestDescriptor::get("https://makerworld.com/api/search/models")
            .query("page", 1)
            .query("keyword", "desk toy");
        let hit = counted_fetch(&cache, &reordered, &calls, "c").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(hit.entry.body, b"b".to_vec());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let (cache, _clock) = store().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&request("fidget toy"), TTL, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(ok_body("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.entry.body, b"shared".to_vec());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_callers_release_their_key() {
        let (cache, _clock) = store().await;
        for keyword in ["fidget toy", "desk toy", "keychain", "planter", "mini animal"] {
            let req = request(keyword);
            let stalled = cache.get_or_fetch(&req, TTL, || async {
                std::future::pending::<Result<FetchedResponse, FetchError>>().await
            });
            assert!(tokio::time::timeout(Duration::from_millis(10), stalled)
                .await
                .is_err());
        }
        assert_eq!(cache.inflight_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_owner_key_in_place() {
        let (cache, _clock) = store().await;
        let owner = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&request("fidget toy"), TTL, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(ok_body("owner"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let req = request("fidget toy");
        let waiter = cache.get_or_fetch(&req, TTL, || async {
            Ok(ok_body("waiter"))
        });
        assert!(tokio::time::timeout(Duration::from_millis(5), waiter)
            .await
            .is_err());
        assert_eq!(cache.inflight_keys(), 1);

        let response = owner.await.unwrap().unwrap();
        assert_eq!(response.entry.body, b"owner".to_vec());
        assert_eq!(cache.inflight_keys(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_fetch_in_parallel() {
        let (cache, _clock) = store().await;
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |keyword: &'static str| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&request(keyword), TTL, || async move {
                        // both fetches must be in flight at once to pass the barrier
                        barrier.wait().await;
                        Ok(ok_body(keyword))
                    })
                    .await
            })
        };

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            let a = run("fidget toy");
            let b = run("desk toy");
            (a.await, b.await)
        })
        .await
        .expect("distinct keys must not serialize");

        assert!(joined.0.unwrap().is_ok());
        assert!(joined.1.unwrap().is_ok());
    }

    #[tokio::test]
    async fn purge_removes_expired_entries() {
        let (cache, clock) = store().await;
        let calls = AtomicUsize::new(0);
        counted_fetch(&cache, &request("fidget toy"), &calls, "a").await.unwrap();

        assert_eq!(cache.purge_expired().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(601));
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
    }
}
