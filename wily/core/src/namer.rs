use std::sync::Arc;

use crate::activity::Activity;
use crate::dtab::Dtab;
use crate::error::Error;
use crate::name::NameBound;
use crate::path::Path;
use crate::tree::NameTree;

/// Resolves logical name trees into trees of bound names.
///
/// Binding is reactive: the returned activity re-evaluates as the
/// resolver's view of the world changes.
pub trait Namer: Send + Sync {
    fn bind(&self, tree: &NameTree<Path>) -> Activity<NameTree<NameBound>>;
}

/// Tries `first`; when its tree evaluates negative, falls back to `second`.
pub struct OrElse {
    first: Arc<dyn Namer>,
    second: Arc<dyn Namer>,
}

impl OrElse {
    pub fn new(first: Arc<dyn Namer>, second: Arc<dyn Namer>) -> Self {
        OrElse { first, second }
    }
}

impl Namer for OrElse {
    fn bind(&self, tree: &NameTree<Path>) -> Activity<NameTree<NameBound>> {
        let second = self.second.clone();
        let tree = tree.clone();
        self.first.bind(&tree).flat_map(move |bound| {
            if bound.eval().is_none() {
                second.bind(&tree)
            } else {
                Activity::value(bound)
            }
        })
    }
}

/// A namer that never binds anything.
pub struct NegNamer;

impl Namer for NegNamer {
    fn bind(&self, _tree: &NameTree<Path>) -> Activity<NameTree<NameBound>> {
        Activity::value(NameTree::Neg)
    }
}

/// Interprets a delegation table over a fallback namer.
///
/// A leaf path is rewritten through every matching dentry, later entries
/// taking precedence, and the rewrites are re-bound recursively within a
/// fixed delegation budget. Paths no dentry matches are handed to the
/// fallback, which supplies the terminal bindings.
#[derive(Clone)]
pub struct DtabNamer {
    dtab: Dtab,
    fallback: Arc<dyn Namer>,
}

/// Bounds rewrite recursion so rule cycles fail instead of spinning.
pub const MAX_DELEGATIONS: usize = 8;

impl DtabNamer {
    pub fn new(dtab: Dtab, fallback: Arc<dyn Namer>) -> Self {
        DtabNamer { dtab, fallback }
    }

    fn bind_tree(&self, tree: &NameTree<Path>, depth: usize) -> Activity<NameTree<NameBound>> {
        match tree {
            NameTree::Neg => Activity::value(NameTree::Neg),
            NameTree::Empty => Activity::value(NameTree::Empty),
            NameTree::Leaf(path) => self.bind_path(path, depth),
            NameTree::Alt(children) => {
                let bound = children.iter().map(|c| self.bind_tree(c, depth)).collect();
                Activity::collect(bound).map(NameTree::Alt)
            }
            NameTree::Union(children) => {
                let weights: Vec<f64> = children.iter().map(|w| w.weight).collect();
                let bound = children
                    .iter()
                    .map(|w| self.bind_tree(&w.tree, depth))
                    .collect();
                Activity::collect(bound).map(move |trees: Vec<NameTree<NameBound>>| {
                    NameTree::Union(
                        weights
                            .iter()
                            .zip(trees)
                            .map(|(w, t)| crate::tree::Weighted::new(*w, t))
                            .collect(),
                    )
                })
            }
        }
    }

    fn bind_path(&self, path: &Path, depth: usize) -> Activity<NameTree<NameBound>> {
        if depth == 0 {
            return Activity::failed(Error::DelegationLimit { path: path.clone() });
        }

        let mut rewrites = Vec::new();
        for dentry in self.dtab.iter() {
            if let Some(suffix) = path.strip_prefix(&dentry.prefix) {
                rewrites.push(dentry.dst.map(&|dst: &Path| dst.concat(&suffix)));
            }
        }
        if rewrites.is_empty() {
            return self.fallback.bind(&NameTree::Leaf(path.clone()));
        }
        rewrites.reverse();
        self.bind_tree(&NameTree::Alt(rewrites), depth - 1)
    }
}

impl Namer for DtabNamer {
    fn bind(&self, tree: &NameTree<Path>) -> Activity<NameTree<NameBound>> {
        self.bind_tree(tree, MAX_DELEGATIONS)
    }
}
