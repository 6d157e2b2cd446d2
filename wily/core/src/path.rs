use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Error;

/// A hierarchical identifier for a logical service, e.g. `/s/svc/foo`.
///
/// Paths are immutable and cheap to clone; the segment storage is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Arc<[Box<str>]>);

impl Path {
    pub fn empty() -> Self {
        Path(Arc::from(Vec::new()))
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        Path(segments.into_iter().map(Into::into).collect())
    }

    /// Parses a slash-separated path. The empty path is written `/`.
    pub fn read(s: &str) -> Result<Self, Error> {
        s.parse()
    }

    pub fn segments(&self) -> &[Box<str>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The remainder of this path after `prefix`, if `prefix` matches.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if self.starts_with(prefix) {
            Some(Path(self.0[prefix.0.len()..].iter().cloned().collect()))
        } else {
            None
        }
    }

    pub fn concat(&self, suffix: &Path) -> Path {
        if suffix.is_empty() {
            return self.clone();
        }
        Path(self.0.iter().chain(suffix.0.iter()).cloned().collect())
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "/" {
            return Ok(Path::empty());
        }
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| Error::other(format!("path must begin with '/': {s:?}")))?;
        let mut segments = Vec::new();
        for seg in rest.split('/') {
            if seg.is_empty() {
                return Err(Error::other(format!("path has an empty segment: {s:?}")));
            }
            segments.push(Box::from(seg));
        }
        Ok(Path(segments.into()))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in self.0.iter() {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}
