use std::fmt;
use std::future::Future;

use crate::path::Path;
use crate::tree::NameTree;

/// A single delegation rule: paths under `prefix` are rewritten to `dst`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dentry {
    pub prefix: Path,
    pub dst: NameTree<Path>,
}

impl Dentry {
    pub fn new(prefix: Path, dst: NameTree<Path>) -> Self {
        Dentry { prefix, dst }
    }
}

/// A delegation table: an ordered list of rewrite rules.
///
/// Tables compose by concatenation and composition is order-significant;
/// entries appended later take precedence at lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Dtab(Vec<Dentry>);

tokio::task_local! {
    static LOCAL_DTAB: Dtab;
}

impl Dtab {
    pub fn new(entries: Vec<Dentry>) -> Self {
        Dtab(entries)
    }

    pub fn empty() -> Self {
        Dtab::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Dentry> {
        self.0.iter()
    }

    pub fn concat(&self, other: &Dtab) -> Dtab {
        Dtab(self.0.iter().chain(other.0.iter()).cloned().collect())
    }

    /// Snapshots the request-scoped delegation table, empty when unset.
    ///
    /// The value is task-scoped rather than thread-scoped so it survives
    /// executor thread hops across await points.
    pub fn local() -> Dtab {
        LOCAL_DTAB.try_with(Dtab::clone).unwrap_or_default()
    }

    /// Runs `fut` with `dtab` as the request-scoped delegation table.
    ///
    /// Nested scopes replace the value rather than merging with it.
    pub async fn with_local<F: Future>(dtab: Dtab, fut: F) -> F::Output {
        LOCAL_DTAB.scope(dtab, fut).await
    }
}

impl FromIterator<Dentry> for Dtab {
    fn from_iter<I: IntoIterator<Item = Dentry>>(iter: I) -> Self {
        Dtab(iter.into_iter().collect())
    }
}

impl fmt::Display for Dtab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dentry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}=>{}", dentry.prefix, dentry.dst)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dentry(prefix: &str, dst: &str) -> Dentry {
        Dentry::new(
            prefix.parse().unwrap(),
            NameTree::Leaf(dst.parse().unwrap()),
        )
    }

    #[test]
    fn concat_preserves_order() {
        let base = Dtab::new(vec![dentry("/s", "/a")]);
        let local = Dtab::new(vec![dentry("/s", "/b")]);
        let both = base.concat(&local);
        assert_eq!(both.len(), 2);
        let entries: Vec<_> = both.iter().collect();
        assert_eq!(entries[0].dst, NameTree::Leaf("/a".parse().unwrap()));
        assert_eq!(entries[1].dst, NameTree::Leaf("/b".parse().unwrap()));
    }

    #[test]
    fn show() {
        let dtab = Dtab::new(vec![dentry("/s", "/a"), dentry("/t", "/b")]);
        assert_eq!(dtab.to_string(), "/s=>/a;/t=>/b");
        assert_eq!(Dtab::empty().to_string(), "");
    }

    #[tokio::test]
    async fn local_is_task_scoped() {
        assert!(Dtab::local().is_empty());

        let dtab = Dtab::new(vec![dentry("/s", "/a")]);
        let observed = Dtab::with_local(dtab.clone(), async {
            let outer = Dtab::local();
            let inner = Dtab::with_local(Dtab::new(vec![dentry("/t", "/b")]), async {
                Dtab::local()
            })
            .await;
            (outer, inner)
        })
        .await;

        assert_eq!(observed.0, dtab);
        assert_eq!(observed.1.len(), 1);
        assert!(Dtab::local().is_empty());

        // A sibling task does not observe the scope.
        let handle = tokio::spawn(async { Dtab::local().is_empty() });
        assert!(handle.await.unwrap());
    }
}
