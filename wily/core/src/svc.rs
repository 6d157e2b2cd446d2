use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Error;

/// How long an evicted or discarded factory is given to wind down.
pub const DEFAULT_CLOSE_DEADLINE: Duration = Duration::from_secs(10);

/// A request-processing handle produced by a `ServiceFactory`.
#[async_trait]
pub trait Service<Req, Rsp>: Send + Sync {
    async fn call(&self, req: Req) -> Result<Rsp, Error>;

    /// Releases the service. Idempotent.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

pub type BoxService<Req, Rsp> = Box<dyn Service<Req, Rsp>>;

/// Produces services on demand; may itself come and go.
#[async_trait]
pub trait ServiceFactory<Req, Rsp>: Send + Sync {
    async fn new_service(&self, conn: ClientConnection) -> Result<BoxService<Req, Rsp>, Error>;

    /// Winds the factory down, allowing `deadline` for draining.
    async fn close(&self, deadline: Duration) -> Result<(), Error>;

    fn is_available(&self) -> bool;
}

pub type SharedFactory<Req, Rsp> = Arc<dyn ServiceFactory<Req, Rsp>>;

/// Per-acquisition context: peer addresses and an interruption handle.
#[derive(Clone, Debug, Default)]
pub struct ClientConnection {
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    interrupt: Interrupt,
}

impl ClientConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr);
        self
    }

    pub fn with_local(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Resolves with the interruption cause, or never.
    pub async fn interrupted(&self) -> Error {
        self.interrupt.raised().await
    }
}

/// Signals that the caller has abandoned an in-flight acquisition.
///
/// The first raised cause wins; later raises are ignored. Handles cloned
/// from one connection share the signal.
#[derive(Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<Option<Error>>>,
}

impl Default for Interrupt {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Interrupt { tx: Arc::new(tx) }
    }
}

impl Interrupt {
    pub fn raise(&self, cause: Error) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        });
    }

    pub fn cause(&self) -> Option<Error> {
        self.tx.borrow().clone()
    }

    pub async fn raised(&self) -> Error {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(cause) => Some(cause.clone().expect("interrupt cause present")),
            // The sender is owned by every clone of this handle, so it
            // cannot go away while we hold one.
            Err(_) => None,
        };
        match result {
            Some(cause) => cause,
            None => std::future::pending().await,
        }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("cause", &self.cause())
            .finish()
    }
}
