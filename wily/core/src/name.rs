use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use ahash::AHashSet;
use tokio::sync::watch;

use crate::activity::join_watches;
use crate::error::SharedError;
use crate::path::Path;

/// A reactive cell holding the current value of a changing quantity.
///
/// The current value is observed immediately on subscription.
pub type Var<T> = watch::Receiver<T>;

/// The resolution state of a bound name's endpoint set.
#[derive(Clone, Debug)]
pub enum Addr {
    Pending,
    Bound(AHashSet<SocketAddr>),
    Neg,
    Failed(SharedError),
}

impl Addr {
    pub fn bound<I: IntoIterator<Item = SocketAddr>>(addrs: I) -> Self {
        Addr::Bound(addrs.into_iter().collect())
    }
}

/// The identity token of a bound name.
///
/// Identity determines cache keying: two names with equal ids share one
/// endpoint factory. A union id is kept sorted so aggregation over the same
/// members is order-independent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoundId {
    Path(Path),
    Union(Vec<BoundId>),
}

impl From<Path> for BoundId {
    fn from(path: Path) -> Self {
        BoundId::Path(path)
    }
}

impl fmt::Display for BoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundId::Path(path) => fmt::Display::fmt(path, f),
            BoundId::Union(ids) => {
                f.write_str("union(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    fmt::Display::fmt(id, f)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// The terminal form of a name: an identity token plus a reactive address.
///
/// Equality and hashing consider the id only.
#[derive(Clone, Debug)]
pub struct NameBound {
    id: BoundId,
    addr: Var<Addr>,
}

impl NameBound {
    pub fn new(id: impl Into<BoundId>, addr: Var<Addr>) -> Self {
        NameBound {
            id: id.into(),
            addr,
        }
    }

    /// A name bound to a fixed endpoint set.
    pub fn fixed<I: IntoIterator<Item = SocketAddr>>(id: impl Into<BoundId>, addrs: I) -> Self {
        let (_, rx) = watch::channel(Addr::bound(addrs));
        NameBound::new(id, rx)
    }

    pub fn id(&self) -> &BoundId {
        &self.id
    }

    pub fn addr(&self) -> Var<Addr> {
        self.addr.clone()
    }

    /// Combines member names into one union name whose address aggregates
    /// the members' addresses as they change.
    pub fn all<I: IntoIterator<Item = NameBound>>(members: I) -> NameBound {
        let mut members: Vec<NameBound> = members.into_iter().collect();
        if members.len() == 1 {
            return members.remove(0);
        }

        let mut ids: Vec<BoundId> = members.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids.dedup();

        let addrs: Vec<Var<Addr>> = members.iter().map(|m| m.addr.clone()).collect();
        let addr = join_watches(addrs, |latest: &[Addr]| aggregate(latest));
        NameBound {
            id: BoundId::Union(ids),
            addr,
        }
    }
}

impl PartialEq for NameBound {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NameBound {}

impl Hash for NameBound {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Merges member addresses: any failure poisons the aggregate, any pending
/// member holds it pending, otherwise bound endpoint sets are unioned and a
/// fully negative membership stays negative.
fn aggregate(addrs: &[Addr]) -> Addr {
    let mut endpoints = AHashSet::new();
    let mut bound = false;
    let mut pending = false;
    for addr in addrs {
        match addr {
            Addr::Failed(e) => return Addr::Failed(e.clone()),
            Addr::Pending => pending = true,
            Addr::Neg => {}
            Addr::Bound(set) => {
                bound = true;
                endpoints.extend(set.iter().copied());
            }
        }
    }
    if pending {
        Addr::Pending
    } else if bound {
        Addr::Bound(endpoints)
    } else {
        Addr::Neg
    }
}
