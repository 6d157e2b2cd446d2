use std::fmt;
use std::hash::{Hash, Hasher};

use ahash::AHashSet;

/// An algebraic tree of name alternatives and unions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NameTree<T> {
    Leaf(T),
    /// The first child that evaluates to a binding wins.
    Alt(Vec<NameTree<T>>),
    /// All children that evaluate to a binding are combined.
    Union(Vec<Weighted<T>>),
    /// No binding.
    Neg,
    /// Bound to the empty set.
    Empty,
}

/// A union member with its relative weight.
///
/// Weights inform load distribution downstream; they do not affect
/// evaluation.
#[derive(Clone, Debug)]
pub struct Weighted<T> {
    pub weight: f64,
    pub tree: NameTree<T>,
}

impl<T> Weighted<T> {
    pub const DEFAULT_WEIGHT: f64 = 1.0;

    pub fn new(weight: f64, tree: NameTree<T>) -> Self {
        Weighted { weight, tree }
    }

    pub fn default_weight(tree: NameTree<T>) -> Self {
        Weighted {
            weight: Self::DEFAULT_WEIGHT,
            tree,
        }
    }
}

impl<T: PartialEq> PartialEq for Weighted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.weight.to_bits() == other.weight.to_bits() && self.tree == other.tree
    }
}

impl<T: Eq> Eq for Weighted<T> {}

impl<T: Hash> Hash for Weighted<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.weight.to_bits().hash(state);
        self.tree.hash(state);
    }
}

impl<T> NameTree<T> {
    /// Rebuilds the tree with every leaf mapped through `f`.
    pub fn map<U>(&self, f: &impl Fn(&T) -> U) -> NameTree<U> {
        match self {
            NameTree::Leaf(t) => NameTree::Leaf(f(t)),
            NameTree::Alt(children) => {
                NameTree::Alt(children.iter().map(|c| c.map(f)).collect())
            }
            NameTree::Union(children) => NameTree::Union(
                children
                    .iter()
                    .map(|w| Weighted::new(w.weight, w.tree.map(f)))
                    .collect(),
            ),
            NameTree::Neg => NameTree::Neg,
            NameTree::Empty => NameTree::Empty,
        }
    }
}

impl<T: Clone + Eq + Hash> NameTree<T> {
    /// Reduces the tree to a terminal set.
    ///
    /// `None` is a negative binding; `Some(empty)` is a binding to the empty
    /// set. `Alt` takes the first child that produces a binding, skipping
    /// negative children. `Union` combines every child binding.
    pub fn eval(&self) -> Option<AHashSet<T>> {
        match self {
            NameTree::Leaf(t) => {
                let mut set = AHashSet::with_capacity(1);
                set.insert(t.clone());
                Some(set)
            }
            NameTree::Alt(children) => children.iter().find_map(|c| c.eval()),
            NameTree::Union(children) => {
                let mut out: Option<AHashSet<T>> = None;
                for w in children {
                    if let Some(set) = w.tree.eval() {
                        out.get_or_insert_with(AHashSet::new).extend(set);
                    }
                }
                out
            }
            NameTree::Neg => None,
            NameTree::Empty => Some(AHashSet::new()),
        }
    }
}

impl<T: fmt::Display> fmt::Display for NameTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameTree::Leaf(t) => fmt::Display::fmt(t, f),
            NameTree::Alt(children) => {
                f.write_str("(")?;
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    fmt::Display::fmt(c, f)?;
                }
                f.write_str(")")
            }
            NameTree::Union(children) => {
                f.write_str("(")?;
                for (i, w) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" & ")?;
                    }
                    if w.weight != Weighted::<T>::DEFAULT_WEIGHT {
                        write!(f, "{}*", w.weight)?;
                    }
                    fmt::Display::fmt(&w.tree, f)?;
                }
                f.write_str(")")
            }
            NameTree::Neg => f.write_str("~"),
            NameTree::Empty => f.write_str("$"),
        }
    }
}
