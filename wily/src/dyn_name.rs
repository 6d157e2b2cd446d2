use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use wily_core::{
    activity, Activity, BoxService, ClientConnection, Error, NameBound, Service, ServiceFactory,
    Subscription,
};

use crate::trace::NameTracer;

/// The downstream constructor a resolved name is dispatched to, normally a
/// name cache lookup.
pub type NewBoundService<Req, Rsp> = Arc<
    dyn Fn(NameBound, ClientConnection) -> BoxFuture<'static, Result<BoxService<Req, Rsp>, Error>>
        + Send
        + Sync,
>;

/// Tracks one name's binding as it resolves, fails, and re-resolves.
///
/// While the binding is pending, acquisitions queue; when it resolves they
/// are drained in arrival order. A failed binding fails acquisitions until
/// the underlying activity recovers. Every produced service annotates the
/// trace context on each request with the name it was dispatched to.
pub struct DynNameFactory<Req, Rsp> {
    shared: Arc<Shared<Req, Rsp>>,
    subscription: Mutex<Option<Subscription>>,
}

struct Shared<Req, Rsp> {
    state: Mutex<State<Req, Rsp>>,
    new_service: NewBoundService<Req, Rsp>,
    tracer: NameTracer,
    waiter_ids: AtomicU64,
}

enum State<Req, Rsp> {
    Pending(VecDeque<Waiter<Req, Rsp>>),
    Named(NameBound),
    Failed(Error),
    Closed,
}

struct Waiter<Req, Rsp> {
    id: u64,
    conn: ClientConnection,
    tx: oneshot::Sender<Result<BoxService<Req, Rsp>, Error>>,
}

enum Step<Req, Rsp> {
    Named(NameBound),
    Failed(Error),
    Closed,
    Wait(u64, oneshot::Receiver<Result<BoxService<Req, Rsp>, Error>>),
}

// === impl DynNameFactory ===

impl<Req, Rsp> DynNameFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Subscribes to `binding` and dispatches acquisitions through
    /// `new_service` once a name is resolved. Must be called within an
    /// async runtime.
    pub fn new(
        binding: Activity<NameBound>,
        new_service: NewBoundService<Req, Rsp>,
        tracer: NameTracer,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(VecDeque::new())),
            new_service,
            tracer,
            waiter_ids: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let subscription = binding.observe(move |state| {
            if let Some(shared) = weak.upgrade() {
                Shared::transition(&shared, state);
            }
        });
        DynNameFactory {
            shared,
            subscription: Mutex::new(Some(subscription)),
        }
    }
}

#[async_trait]
impl<Req, Rsp> ServiceFactory<Req, Rsp> for DynNameFactory<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn new_service(&self, conn: ClientConnection) -> Result<BoxService<Req, Rsp>, Error> {
        Shared::acquire(self.shared.clone(), conn).await
    }

    async fn close(&self, _deadline: Duration) -> Result<(), Error> {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.dispose();
        }
        let waiters = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, State::Closed) {
                State::Pending(waiters) => waiters,
                _ => VecDeque::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::ServiceClosed));
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        !matches!(&*self.shared.state.lock(), State::Closed)
    }
}

// === impl Shared ===

impl<Req, Rsp> Shared<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    /// Applies a binding transition and dispatches any queued waiters.
    ///
    /// Dispatch happens after the state lock is released: each drained
    /// waiter re-enters `acquire` so it takes the same path, and records
    /// the same annotations, as a fresh acquisition against the new state.
    fn transition(self: &Arc<Self>, update: activity::State<NameBound>) {
        let drained = {
            let mut state = self.state.lock();
            match update {
                // A resolved binding never regresses to pending.
                activity::State::Pending => None,
                activity::State::Ok(name) => match &mut *state {
                    State::Closed => None,
                    State::Pending(waiters) => {
                        let waiters = std::mem::take(waiters);
                        tracing::debug!(waiters = waiters.len(), "name resolved");
                        *state = State::Named(name);
                        Some(waiters)
                    }
                    _ => {
                        *state = State::Named(name);
                        None
                    }
                },
                activity::State::Failed(err) => match &mut *state {
                    State::Closed => None,
                    State::Pending(waiters) => {
                        let waiters = std::mem::take(waiters);
                        tracing::debug!(waiters = waiters.len(), "name binding failed");
                        *state = State::Failed(err);
                        Some(waiters)
                    }
                    _ => {
                        *state = State::Failed(err);
                        None
                    }
                },
            }
        };

        if let Some(waiters) = drained {
            for waiter in waiters {
                let shared = self.clone();
                tokio::spawn(async move {
                    let res = Self::acquire(shared, waiter.conn).await;
                    if let Err(Ok(service)) = waiter.tx.send(res) {
                        // The waiter went away; don't leak the service.
                        tokio::spawn(async move {
                            let _ = service.close().await;
                        });
                    }
                });
            }
        }
    }

    async fn acquire(
        self: Arc<Self>,
        conn: ClientConnection,
    ) -> Result<BoxService<Req, Rsp>, Error> {
        let step = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Named(name) => Step::Named(name.clone()),
                State::Failed(err) => Step::Failed(err.clone()),
                State::Closed => Step::Closed,
                State::Pending(waiters) => {
                    let id = self.waiter_ids.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(Waiter {
                        id,
                        conn: conn.clone(),
                        tx,
                    });
                    Step::Wait(id, rx)
                }
            }
        };

        match step {
            Step::Named(name) => {
                let service = (self.new_service)(name.clone(), conn).await?;
                Ok(Box::new(TracedService {
                    inner: service,
                    tracer: self.tracer.clone(),
                    name,
                }))
            }
            Step::Failed(err) => {
                self.tracer.record_failure(&err);
                Err(err)
            }
            Step::Closed => Err(Error::ServiceClosed),
            Step::Wait(id, mut rx) => {
                let res = tokio::select! {
                    biased;
                    cause = conn.interrupted() => Err(Error::cancelled(cause)),
                    res = &mut rx => match res {
                        Ok(res) => res,
                        Err(_) => Err(Error::ServiceClosed),
                    },
                };
                if matches!(res, Err(Error::CancelledConnection { .. })) {
                    self.unlink(id);
                    // A racing drain may still fulfill the waiter; close
                    // whatever arrives so nothing leaks.
                    tokio::spawn(async move {
                        if let Ok(Ok(service)) = rx.await {
                            let _ = service.close().await;
                        }
                    });
                }
                res
            }
        }
    }

    fn unlink(&self, id: u64) {
        let mut state = self.state.lock();
        if let State::Pending(waiters) = &mut *state {
            waiters.retain(|waiter| waiter.id != id);
        }
    }
}

// === impl TracedService ===

/// Annotates every request with the name it was dispatched to. Transparent
/// to closing and availability.
struct TracedService<Req, Rsp> {
    inner: BoxService<Req, Rsp>,
    tracer: NameTracer,
    name: NameBound,
}

#[async_trait]
impl<Req, Rsp> Service<Req, Rsp> for TracedService<Req, Rsp>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
{
    async fn call(&self, req: Req) -> Result<Rsp, Error> {
        self.tracer.record_bound(self.name.id());
        self.inner.call(req).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}
