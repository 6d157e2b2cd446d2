use std::fmt;
use std::sync::Arc;

use crate::dtab::Dtab;
use crate::path::Path;

/// A clonable handle to an arbitrary error.
///
/// Failure states are fanned out to every queued and future caller, so the
/// underlying error must be shareable.
#[derive(Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        SharedError(Arc::from(err.into()))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Errors surfaced by name binding and service acquisition.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The name evaluated to a negative or empty binding.
    #[error("no brokers available for {name}{}", fmt_dtab(.local_dtab))]
    NoBrokersAvailable {
        name: String,
        local_dtab: Option<Dtab>,
    },

    /// The factory or cache was closed before the request could be served.
    #[error("service is closed")]
    ServiceClosed,

    /// A queued acquisition was interrupted by the caller.
    #[error("connection was cancelled: {cause}")]
    CancelledConnection {
        #[source]
        cause: Box<Error>,
    },

    /// Delegation recursed past the rewrite budget, usually a rule cycle.
    #[error("delegation limit exceeded while binding {path}")]
    DelegationLimit { path: Path },

    #[error(transparent)]
    Other(#[from] SharedError),
}

impl Error {
    pub fn no_brokers(name: impl Into<String>) -> Self {
        Error::NoBrokersAvailable {
            name: name.into(),
            local_dtab: None,
        }
    }

    pub fn cancelled(cause: Error) -> Self {
        Error::CancelledConnection {
            cause: Box::new(cause),
        }
    }

    /// Wraps a foreign error so it can be cloned and re-surfaced.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::Other(SharedError::new(err))
    }

    /// The failure-kind string recorded in trace annotations.
    pub fn label(&self) -> String {
        match self {
            Error::NoBrokersAvailable { .. } => "NoBrokersAvailable".to_string(),
            Error::ServiceClosed => "ServiceClosed".to_string(),
            Error::CancelledConnection { .. } => "CancelledConnection".to_string(),
            Error::DelegationLimit { .. } => "DelegationLimit".to_string(),
            Error::Other(err) => err.to_string(),
        }
    }
}

fn fmt_dtab(dtab: &Option<Dtab>) -> String {
    match dtab {
        Some(dtab) => format!(", local dtab {dtab}"),
        None => String::new(),
    }
}
