#![allow(unused)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use wily::core::{
    Activity, Addr, BoundId, BoxService, ClientConnection, Error, NameBound, NameTree, Namer,
    Path, Service, ServiceFactory, SharedFactory, Var,
};
use wily::{NewEndpointFactory, TraceSink};

pub type Req = String;
pub type Rsp = String;

pub fn path(s: &str) -> Path {
    s.parse().expect("test path")
}

pub fn sock(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("test addr")
}

pub fn bound(path_str: &str, port: u16) -> NameBound {
    NameBound::fixed(path(path_str), [sock(port)])
}

/// A namer with programmable per-path bindings; unknown paths neg.
#[derive(Default)]
pub struct TestNamer {
    bindings: Mutex<HashMap<Path, Activity<NameTree<NameBound>>>>,
}

impl TestNamer {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, path: Path, binding: Activity<NameTree<NameBound>>) {
        self.bindings.lock().insert(path, binding);
    }

    pub fn set_bound(&self, path: Path, name: NameBound) {
        self.set(path, Activity::value(NameTree::Leaf(name)));
    }
}

impl Namer for TestNamer {
    fn bind(&self, tree: &NameTree<Path>) -> Activity<NameTree<NameBound>> {
        match tree {
            NameTree::Leaf(path) => match self.bindings.lock().get(path) {
                Some(binding) => binding.clone(),
                None => Activity::value(NameTree::Neg),
            },
            _ => Activity::value(NameTree::Neg),
        }
    }
}

/// Counts endpoint factory constructions and serves echo responses tagged
/// with the bound name.
pub fn endpoint_factory(built: Arc<AtomicUsize>) -> NewEndpointFactory<Req, Rsp> {
    Arc::new(move |name: &NameBound| {
        built.fetch_add(1, Ordering::AcqRel);
        Arc::new(EchoFactory {
            id: name.id().clone(),
            addr: name.addr(),
        }) as SharedFactory<Req, Rsp>
    })
}

pub struct EchoFactory {
    id: BoundId,
    addr: Var<Addr>,
}

#[async_trait]
impl ServiceFactory<Req, Rsp> for EchoFactory {
    async fn new_service(&self, _conn: ClientConnection) -> Result<BoxService<Req, Rsp>, Error> {
        Ok(Box::new(EchoService {
            id: self.id.clone(),
            addr: self.addr.clone(),
        }))
    }

    async fn close(&self, _deadline: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        matches!(&*self.addr.borrow(), Addr::Bound(_))
    }
}

pub struct EchoService {
    id: BoundId,
    addr: Var<Addr>,
}

#[async_trait]
impl Service<Req, Rsp> for EchoService {
    async fn call(&self, req: Req) -> Result<Rsp, Error> {
        Ok(format!("{req}:{}", self.id))
    }

    fn is_available(&self) -> bool {
        matches!(&*self.addr.borrow(), Addr::Bound(_))
    }
}

/// Captures trace annotations for assertion.
#[derive(Clone, Default)]
pub struct Annotations {
    records: Arc<Mutex<Vec<(String, String)>>>,
}

impl Annotations {
    pub fn sink(&self) -> TraceSink {
        let records = self.records.clone();
        Arc::new(move |key, value| records.lock().push((key.to_string(), value)))
    }

    pub fn values_for(&self, key: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn count(&self, key: &str) -> usize {
        self.values_for(key).len()
    }
}
