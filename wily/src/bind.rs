use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use prometheus_client::registry::Registry;

use wily_core::{
    Activity, BoxService, ClientConnection, Dtab, DtabNamer, Error, NameBound, NameTree, Namer,
    Path, Service, ServiceFactory, SharedFactory,
};

use crate::cache::ServiceFactoryCache;
use crate::dyn_name::{DynNameFactory, NewBoundService};
use crate::metrics::CacheMetrics;
use crate::trace::{NameTracer, TraceSink};

/// Endpoint factories are shared across delegation tables, so the name
/// cache is the larger of the two.
pub const NAME_CACHE_CAPACITY: usize = 8;
pub const DTAB_CACHE_CAPACITY: usize = 4;

/// Constructs the endpoint factory for a resolved name.
pub type NewEndpointFactory<Req, Rsp> =
    Arc<dyn Fn(&NameBound) -> SharedFactory<Req, Rsp> + Send + Sync>;

/// Binds a logical path through the ambient delegation tables and caches
/// the results at two levels.
///
/// Each distinct `(base, local)` table pair gets one binder that tracks the
/// path's resolution; each distinct bound name gets one endpoint factory.
/// Keying endpoints by name identity lets every table pair that resolves to
/// the same name share one downstream factory.
pub struct BindingFactory<Req, Rsp> {
    base: Dtab,
    dtab_cache: ServiceFactoryCache<DtabPair, Req, Rsp>,
    name_cache: ServiceFactoryCache<NameBound, Req, Rsp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DtabPair {
    base: Dtab,
    local: Dtab,
}

// === impl BindingFactory ===

impl<Req, Rsp> BindingFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Builds a binding factory for `path`.
    ///
    /// `global` supplies terminal bindings for paths the delegation tables
    /// do not rewrite; `new_factory` constructs the endpoint factory for a
    /// resolved name; `sink` receives trace annotations. Cache metrics are
    /// registered under `name_cache` and `dtab_cache` prefixes.
    pub fn new(
        path: Path,
        base: Dtab,
        global: Arc<dyn Namer>,
        new_factory: NewEndpointFactory<Req, Rsp>,
        sink: TraceSink,
        registry: &mut Registry,
    ) -> Self {
        let name_metrics = CacheMetrics::register(registry.sub_registry_with_prefix("name_cache"));
        let dtab_metrics = CacheMetrics::register(registry.sub_registry_with_prefix("dtab_cache"));

        let name_cache = ServiceFactoryCache::with_metrics(
            NAME_CACHE_CAPACITY,
            move |name: &NameBound| new_factory(name),
            name_metrics,
        );

        let dtab_cache = {
            let name_cache = name_cache.clone();
            let path = path.clone();
            ServiceFactoryCache::with_metrics(
                DTAB_CACHE_CAPACITY,
                move |pair: &DtabPair| new_binder(pair, &path, &global, &name_cache, &sink),
                dtab_metrics,
            )
        };

        BindingFactory {
            base,
            dtab_cache,
            name_cache,
        }
    }

    pub fn name_cache_metrics(&self) -> &CacheMetrics {
        self.name_cache.metrics()
    }

    pub fn dtab_cache_metrics(&self) -> &CacheMetrics {
        self.dtab_cache.metrics()
    }
}

/// One binder per delegation-table pair: composes the tables over the
/// global namer, evaluates the path's tree to a single bound name, and
/// tracks it through a `DynNameFactory` backed by the name cache.
fn new_binder<Req, Rsp>(
    pair: &DtabPair,
    path: &Path,
    global: &Arc<dyn Namer>,
    name_cache: &ServiceFactoryCache<NameBound, Req, Rsp>,
    sink: &TraceSink,
) -> SharedFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    let namer = DtabNamer::new(pair.base.concat(&pair.local), global.clone());
    let shown = path.to_string();
    let binding: Activity<NameBound> =
        namer
            .bind(&NameTree::Leaf(path.clone()))
            .and_then(move |tree| match tree.eval() {
                None => Err(Error::no_brokers(shown.clone())),
                Some(set) if set.is_empty() => Err(Error::no_brokers(shown.clone())),
                Some(set) => Ok(NameBound::all(set)),
            });

    let tracer = NameTracer::new(
        path.clone(),
        pair.base.clone(),
        pair.local.clone(),
        sink.clone(),
    );

    let downstream: NewBoundService<Req, Rsp> = {
        let name_cache = name_cache.clone();
        Arc::new(move |name, conn| {
            let name_cache = name_cache.clone();
            async move { name_cache.new_service(&name, conn).await }.boxed()
        })
    };

    Arc::new(DynNameFactory::new(binding, downstream, tracer))
}

#[async_trait]
impl<Req, Rsp> ServiceFactory<Req, Rsp> for BindingFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn new_service(&self, conn: ClientConnection) -> Result<BoxService<Req, Rsp>, Error> {
        let local = Dtab::local();
        let pair = DtabPair {
            base: self.base.clone(),
            local: local.clone(),
        };
        let res = self.dtab_cache.new_service(&pair, conn).await;
        if local.is_empty() {
            return res;
        }
        // With a request-scoped table in play, name failures are annotated
        // with it so the rewrite that caused them is visible.
        match res {
            Ok(service) => Ok(Box::new(DtabContextService {
                inner: service,
                local,
            })),
            Err(err) => Err(annotate_local_dtab(err, &local)),
        }
    }

    /// The binder cache holds references into the name cache, so it closes
    /// first.
    async fn close(&self, deadline: Duration) -> Result<(), Error> {
        self.dtab_cache.close(deadline).await?;
        self.name_cache.close(deadline).await
    }

    fn is_available(&self) -> bool {
        self.dtab_cache.is_available()
    }
}

fn annotate_local_dtab(err: Error, local: &Dtab) -> Error {
    match err {
        Error::NoBrokersAvailable {
            name,
            local_dtab: None,
        } => Error::NoBrokersAvailable {
            name,
            local_dtab: Some(local.clone()),
        },
        other => other,
    }
}

/// Re-raises downstream name failures with the request-scoped table
/// attached; transparent otherwise.
struct DtabContextService<Req, Rsp> {
    inner: BoxService<Req, Rsp>,
    local: Dtab,
}

#[async_trait]
impl<Req, Rsp> Service<Req, Rsp> for DtabContextService<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn call(&self, req: Req) -> Result<Rsp, Error> {
        self.inner
            .call(req)
            .await
            .map_err(|err| annotate_local_dtab(err, &self.local))
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_dtab_annotation_fills_only_missing_context() {
        let local = Dtab::new(vec![wily_core::Dentry::new(
            "/s".parse().unwrap(),
            NameTree::Leaf("/alt".parse().unwrap()),
        )]);

        let err = annotate_local_dtab(Error::no_brokers("/s/foo"), &local);
        match err {
            Error::NoBrokersAvailable { name, local_dtab } => {
                assert_eq!(name, "/s/foo");
                assert_eq!(local_dtab, Some(local.clone()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // An already-annotated failure keeps its context.
        let prior = Dtab::empty();
        let err = annotate_local_dtab(
            Error::NoBrokersAvailable {
                name: "/s/foo".to_string(),
                local_dtab: Some(prior.clone()),
            },
            &local,
        );
        match err {
            Error::NoBrokersAvailable { local_dtab, .. } => {
                assert_eq!(local_dtab, Some(prior));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Unrelated errors pass through unchanged.
        let err = annotate_local_dtab(Error::ServiceClosed, &local);
        assert!(matches!(err, Error::ServiceClosed));
    }
}
