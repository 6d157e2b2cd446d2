use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use wily_core::{
    BoxService, ClientConnection, Error, Service, SharedFactory,
    DEFAULT_CLOSE_DEADLINE,
};
#[cfg(test)]
use wily_core::ServiceFactory;

use crate::metrics::CacheMetrics;

/// Builds the factory for a key on first use.
pub type Maker<K, Req, Rsp> = Box<dyn Fn(&K) -> SharedFactory<Req, Rsp> + Send + Sync>;

/// A bounded cache from keys to reference-counted service factories.
///
/// Entries are kept in recency order; an insertion past capacity evicts the
/// least recently used entry with no outstanding services. When every entry
/// is pinned the cache overshoots and evicts as entries quiesce. Evicted
/// factories are closed in the background.
///
/// The builder for a missing key runs outside the cache lock and at most
/// once per key: concurrent lookups of the same key wait for the first
/// builder to publish.
pub struct ServiceFactoryCache<K, Req, Rsp> {
    inner: Arc<Inner<K, Req, Rsp>>,
}

impl<K, Req, Rsp> Clone for ServiceFactoryCache<K, Req, Rsp> {
    fn clone(&self) -> Self {
        ServiceFactoryCache {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K, Req, Rsp> {
    slots: Mutex<Slots<K, Req, Rsp>>,
    make: Maker<K, Req, Rsp>,
    capacity: usize,
    metrics: CacheMetrics,
}

struct Slots<K, Req, Rsp> {
    map: IndexMap<K, Slot<Req, Rsp>>,
    closed: bool,
}

enum Slot<Req, Rsp> {
    /// The builder is running; waiters subscribe for the published factory.
    Making(watch::Receiver<Option<SharedFactory<Req, Rsp>>>),
    Ready(ReadySlot<Req, Rsp>),
}

struct ReadySlot<Req, Rsp> {
    factory: SharedFactory<Req, Rsp>,
    outstanding: usize,
}

enum Lookup<K, Req, Rsp> {
    Ready(SharedFactory<Req, Rsp>),
    Build(watch::Sender<Option<SharedFactory<Req, Rsp>>>, K),
    Wait(watch::Receiver<Option<SharedFactory<Req, Rsp>>>),
}

// === impl ServiceFactoryCache ===

impl<K, Req, Rsp> ServiceFactoryCache<K, Req, Rsp>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    pub fn new<F>(capacity: usize, make: F) -> Self
    where
        F: Fn(&K) -> SharedFactory<Req, Rsp> + Send + Sync + 'static,
    {
        Self::with_metrics(capacity, make, CacheMetrics::default())
    }

    pub fn with_metrics<F>(capacity: usize, make: F, metrics: CacheMetrics) -> Self
    where
        F: Fn(&K) -> SharedFactory<Req, Rsp> + Send + Sync + 'static,
    {
        ServiceFactoryCache {
            inner: Arc::new(Inner {
                slots: Mutex::new(Slots {
                    map: IndexMap::new(),
                    closed: false,
                }),
                make: Box::new(make),
                capacity,
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Produces a service for `key`, building and caching its factory on a
    /// miss. The returned service pins the entry until it is closed or
    /// dropped.
    pub async fn new_service(
        &self,
        key: &K,
        conn: ClientConnection,
    ) -> Result<BoxService<Req, Rsp>, Error> {
        let factory = self.acquire_factory(key).await?;
        match factory.new_service(conn).await {
            Ok(inner) => Ok(Box::new(TrackedService {
                inner,
                cache: self.clone(),
                key: key.clone(),
                released: AtomicBool::new(false),
            })),
            Err(e) => {
                self.release(key);
                Err(e)
            }
        }
    }

    /// Closes every cached factory and refuses further lookups.
    pub async fn close(&self, deadline: Duration) -> Result<(), Error> {
        let factories: Vec<SharedFactory<Req, Rsp>> = {
            let mut slots = self.inner.slots.lock();
            slots.closed = true;
            let drained: Vec<(K, Slot<Req, Rsp>)> = slots.map.drain(..).collect();
            self.sync_gauges(&slots);
            drained
                .into_iter()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(ready) => Some(ready.factory),
                    Slot::Making(_) => None,
                })
                .collect()
        };

        let closes = factories
            .into_iter()
            .map(|factory| async move { factory.close(deadline).await });
        if tokio::time::timeout(deadline, futures::future::join_all(closes))
            .await
            .is_err()
        {
            tracing::debug!("factory cache close deadline elapsed");
        }
        Ok(())
    }

    /// The cache can serve a request if it is empty (a lookup may still
    /// succeed), has a factory under construction, or holds an available
    /// factory.
    pub fn is_available(&self) -> bool {
        let slots = self.inner.slots.lock();
        if slots.closed {
            return false;
        }
        slots.map.is_empty()
            || slots.map.values().any(|slot| match slot {
                Slot::Making(_) => true,
                Slot::Ready(ready) => ready.factory.is_available(),
            })
    }

    async fn acquire_factory(&self, key: &K) -> Result<SharedFactory<Req, Rsp>, Error> {
        loop {
            let lookup = {
                let mut slots = self.inner.slots.lock();
                if slots.closed {
                    return Err(Error::ServiceClosed);
                }
                match slots.map.get_index_of(key) {
                    Some(index) => match &mut slots.map[index] {
                        Slot::Ready(ready) => {
                            ready.outstanding += 1;
                            let factory = ready.factory.clone();
                            let back = slots.map.len() - 1;
                            slots.map.move_index(index, back);
                            self.sync_gauges(&slots);
                            Lookup::Ready(factory)
                        }
                        Slot::Making(rx) => Lookup::Wait(rx.clone()),
                    },
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.map.insert(key.clone(), Slot::Making(rx));
                        self.inner.metrics.incr_miss();
                        self.sync_gauges(&slots);
                        Lookup::Build(tx, key.clone())
                    }
                }
            };

            match lookup {
                Lookup::Ready(factory) => return Ok(factory),
                Lookup::Wait(mut rx) => {
                    if rx.wait_for(Option::is_some).await.is_err() {
                        // The builder disappeared without publishing; clear
                        // the stale slot so the next pass can rebuild.
                        let mut slots = self.inner.slots.lock();
                        if let Some(Slot::Making(_)) = slots.map.get(key) {
                            slots.map.shift_remove(key);
                            self.sync_gauges(&slots);
                        }
                    }
                }
                Lookup::Build(tx, key) => {
                    let factory = (self.inner.make)(&key);
                    let published = {
                        let mut slots = self.inner.slots.lock();
                        if slots.closed {
                            false
                        } else {
                            slots.map.insert(
                                key.clone(),
                                Slot::Ready(ReadySlot {
                                    factory: factory.clone(),
                                    outstanding: 1,
                                }),
                            );
                            self.evict_over_capacity(&mut slots);
                            self.sync_gauges(&slots);
                            true
                        }
                    };
                    // Waiters re-enter the lock and observe the published
                    // slot, or the closed cache.
                    let _ = tx.send(Some(factory.clone()));
                    if published {
                        tracing::debug!("cached a new service factory");
                        return Ok(factory);
                    }
                    let discarded = factory;
                    tokio::spawn(async move {
                        let _ = discarded.close(DEFAULT_CLOSE_DEADLINE).await;
                    });
                    return Err(Error::ServiceClosed);
                }
            }
        }
    }

    fn release(&self, key: &K) {
        let mut slots = self.inner.slots.lock();
        if let Some(Slot::Ready(ready)) = slots.map.get_mut(key) {
            ready.outstanding = ready.outstanding.saturating_sub(1);
        }
        if !slots.closed {
            self.evict_over_capacity(&mut slots);
        }
        self.sync_gauges(&slots);
    }

    fn evict_over_capacity(&self, slots: &mut Slots<K, Req, Rsp>) {
        while slots.map.len() > self.inner.capacity {
            let victim = slots.map.values().position(|slot| {
                matches!(slot, Slot::Ready(ready) if ready.outstanding == 0)
            });
            let Some(index) = victim else {
                // Every entry is pinned or still building; overshoot until
                // one quiesces.
                return;
            };
            if let Some((_, Slot::Ready(ready))) = slots.map.shift_remove_index(index) {
                self.inner.metrics.incr_eviction();
                tracing::debug!("evicting an idle service factory");
                let factory = ready.factory;
                tokio::spawn(async move {
                    let _ = factory.close(DEFAULT_CLOSE_DEADLINE).await;
                });
            }
        }
    }

    fn sync_gauges(&self, slots: &Slots<K, Req, Rsp>) {
        self.inner.metrics.set_size(slots.map.len());
        let idle = slots
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(ready) if ready.outstanding == 0))
            .count();
        self.inner.metrics.set_idle(idle);
    }
}

// === impl TrackedService ===

/// Pins a cache entry for as long as the produced service is live.
struct TrackedService<K, Req, Rsp>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    inner: BoxService<Req, Rsp>,
    cache: ServiceFactoryCache<K, Req, Rsp>,
    key: K,
    released: AtomicBool,
}

impl<K, Req, Rsp> TrackedService<K, Req, Rsp>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cache.release(&self.key);
        }
    }
}

#[async_trait]
impl<K, Req, Rsp> Service<Req, Rsp> for TrackedService<K, Req, Rsp>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn call(&self, req: Req) -> Result<Rsp, Error> {
        self.inner.call(req).await
    }

    async fn close(&self) -> Result<(), Error> {
        let res = self.inner.close().await;
        self.release_once();
        res
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

impl<K, Req, Rsp> Drop for TrackedService<K, Req, Rsp>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::time::timeout;

    struct StubService {
        available: bool,
    }

    #[async_trait]
    impl Service<String, String> for StubService {
        async fn call(&self, req: String) -> Result<String, Error> {
            Ok(req)
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }

    struct StubFactory {
        available: bool,
        closed: Arc<AtomicBool>,
    }

    impl StubFactory {
        fn shared(closed: Arc<AtomicBool>) -> SharedFactory<String, String> {
            Arc::new(StubFactory {
                available: true,
                closed,
            })
        }
    }

    #[async_trait]
    impl ServiceFactory<String, String> for StubFactory {
        async fn new_service(
            &self,
            _conn: ClientConnection,
        ) -> Result<BoxService<String, String>, Error> {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ServiceClosed);
            }
            Ok(Box::new(StubService {
                available: self.available,
            }))
        }

        async fn close(&self, _deadline: Duration) -> Result<(), Error> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }

        fn is_available(&self) -> bool {
            self.available && !self.closed.load(Ordering::Acquire)
        }
    }

    fn counting_cache(
        capacity: usize,
    ) -> (ServiceFactoryCache<u32, String, String>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = {
            let builds = builds.clone();
            ServiceFactoryCache::new(capacity, move |_key: &u32| {
                builds.fetch_add(1, Ordering::AcqRel);
                StubFactory::shared(Arc::new(AtomicBool::new(false)))
            })
        };
        (cache, builds)
    }

    #[tokio::test]
    async fn builds_once_per_key() {
        let (cache, builds) = counting_cache(8);

        let svc1 = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        let svc2 = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        assert_eq!(builds.load(Ordering::Acquire), 1);
        assert_eq!(cache.metrics().misses(), 1);

        let _svc3 = cache.new_service(&2, ClientConnection::new()).await.unwrap();
        assert_eq!(builds.load(Ordering::Acquire), 2);

        svc1.close().await.unwrap();
        svc2.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_first_miss_builds_once() {
        let (cache, builds) = counting_cache(8);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.new_service(&7, ClientConnection::new()).await
            }));
        }
        for task in tasks {
            let svc = task.await.unwrap().unwrap();
            svc.close().await.unwrap();
        }
        assert_eq!(builds.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_idle_entry() {
        let (cache, builds) = counting_cache(2);

        for key in [1u32, 2, 3] {
            let svc = cache
                .new_service(&key, ClientConnection::new())
                .await
                .unwrap();
            svc.close().await.unwrap();
        }
        assert_eq!(cache.metrics().size(), 2);
        assert_eq!(cache.metrics().evictions(), 1);

        // Key 1 was evicted, so using it again rebuilds its factory.
        let svc = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        svc.close().await.unwrap();
        assert_eq!(builds.load(Ordering::Acquire), 4);
    }

    #[tokio::test]
    async fn recent_access_is_protected_from_eviction() {
        let (cache, builds) = counting_cache(2);

        let svc1 = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        svc1.close().await.unwrap();
        let svc2 = cache.new_service(&2, ClientConnection::new()).await.unwrap();
        svc2.close().await.unwrap();

        // Touch key 1 so key 2 becomes the least recently used.
        let svc1 = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        svc1.close().await.unwrap();
        assert_eq!(builds.load(Ordering::Acquire), 2);

        let svc3 = cache.new_service(&3, ClientConnection::new()).await.unwrap();
        svc3.close().await.unwrap();

        let svc1 = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        svc1.close().await.unwrap();
        assert_eq!(builds.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn pinned_entries_overshoot_and_evict_on_quiesce() {
        let (cache, _builds) = counting_cache(1);

        let pinned = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        let other = cache.new_service(&2, ClientConnection::new()).await.unwrap();
        // Both entries are pinned by live services, so neither is evicted.
        assert_eq!(cache.metrics().size(), 2);
        assert_eq!(cache.metrics().evictions(), 0);

        other.close().await.unwrap();
        assert_eq!(cache.metrics().size(), 1);
        assert_eq!(cache.metrics().evictions(), 1);

        pinned.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let closed = Arc::new(AtomicBool::new(false));
        let cache: ServiceFactoryCache<u32, String, String> = {
            let closed = closed.clone();
            ServiceFactoryCache::new(8, move |_key: &u32| StubFactory::shared(closed.clone()))
        };

        let svc = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        svc.close().await.unwrap();

        timeout(Duration::from_secs(5), cache.close(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.load(Ordering::Acquire));
        assert!(!cache.is_available());

        let err = cache.new_service(&1, ClientConnection::new()).await;
        assert!(matches!(err, Err(Error::ServiceClosed)));
    }

    #[tokio::test]
    async fn availability_follows_entries() {
        let (cache, _builds) = counting_cache(8);
        assert!(cache.is_available());

        let svc = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        assert!(cache.is_available());
        svc.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_service_releases_its_pin() {
        let (cache, _builds) = counting_cache(8);

        let svc = cache.new_service(&1, ClientConnection::new()).await.unwrap();
        assert_eq!(cache.metrics().idle(), 0);
        drop(svc);
        assert_eq!(cache.metrics().idle(), 1);
    }
}
