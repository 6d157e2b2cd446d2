//! A lazy, observable value in one of three states: pending, ok, or failed.
//!
//! Built on `tokio::sync::watch`: a subscriber always observes the current
//! state immediately and every later transition, and per-subscription
//! delivery is serialized. Combinators are spawned forwarding tasks that
//! exit when their output loses all subscribers or their input is
//! exhausted, so derived activities clean up after themselves.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;

#[derive(Clone, Debug, Default)]
pub enum State<T> {
    #[default]
    Pending,
    Ok(T),
    Failed(Error),
}

#[derive(Clone, Debug)]
pub struct Activity<T> {
    rx: watch::Receiver<State<T>>,
}

/// Detaches its observer when disposed or dropped.
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

impl<T: Clone + Send + Sync + 'static> Activity<T> {
    /// An activity driven by the returned sender.
    ///
    /// The activity holds the current state after the sender is dropped.
    pub fn channel(initial: State<T>) -> (watch::Sender<State<T>>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Activity { rx })
    }

    pub fn value(value: T) -> Self {
        Self::channel(State::Ok(value)).1
    }

    pub fn failed(err: Error) -> Self {
        Self::channel(State::Failed(err)).1
    }

    pub fn pending() -> Self {
        Self::channel(State::Pending).1
    }

    pub fn current(&self) -> State<T> {
        self.rx.borrow().clone()
    }

    /// A raw subscription to state transitions.
    pub fn states(&self) -> watch::Receiver<State<T>> {
        self.rx.clone()
    }

    /// Invokes `handler` with the current state and every transition.
    ///
    /// The handler runs on a dedicated task, never under caller locks.
    pub fn observe<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(State<T>) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                handler(state);
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }

    pub fn map<U, F>(&self, f: F) -> Activity<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + 'static,
    {
        self.and_then(move |t| Ok(f(t)))
    }

    /// Maps ok states through `f`; an `Err` becomes a failed state.
    pub fn and_then<U, F>(&self, f: F) -> Activity<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Result<U, Error> + Send + 'static,
    {
        fn step<T: Clone, U, F: Fn(T) -> Result<U, Error>>(f: &F, state: State<T>) -> State<U> {
            match state {
                State::Pending => State::Pending,
                State::Failed(e) => State::Failed(e),
                State::Ok(t) => match f(t) {
                    Ok(u) => State::Ok(u),
                    Err(e) => State::Failed(e),
                },
            }
        }

        let mut src = self.rx.clone();
        let initial = step(&f, src.borrow_and_update().clone());
        let (tx, rx) = watch::channel(initial);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    changed = src.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let state = src.borrow_and_update().clone();
                        if tx.send(step(&f, state)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Activity { rx }
    }

    /// Switches to the activity produced from each ok state.
    ///
    /// Pending and failed states of the outer activity pass through; an ok
    /// state selects an inner activity whose states are mirrored until the
    /// outer activity transitions again.
    pub fn flat_map<U, F>(&self, f: F) -> Activity<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Activity<U> + Send + 'static,
    {
        let mut outer = self.rx.clone();
        let mut inner: Option<watch::Receiver<State<U>>> = None;

        let initial = switch_inner(&f, &mut inner, outer.borrow_and_update().clone());
        let (tx, rx) = watch::channel(initial);
        tokio::spawn(async move {
            enum Event<U> {
                Closed,
                Outer(bool),
                Inner(Option<State<U>>),
            }

            let mut outer_live = true;
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => Event::Closed,
                    changed = outer.changed(), if outer_live => Event::Outer(changed.is_ok()),
                    state = next_inner(&mut inner), if inner.is_some() => Event::Inner(state),
                };
                match event {
                    Event::Closed => return,
                    // The outer activity is frozen; its last inner activity
                    // remains selected.
                    Event::Outer(false) => {
                        outer_live = false;
                        if inner.is_none() {
                            return;
                        }
                    }
                    Event::Outer(true) => {
                        let state = outer.borrow_and_update().clone();
                        if tx.send(switch_inner(&f, &mut inner, state)).is_err() {
                            return;
                        }
                    }
                    Event::Inner(Some(state)) => {
                        if tx.send(state).is_err() {
                            return;
                        }
                    }
                    Event::Inner(None) => {
                        inner = None;
                        if !outer_live {
                            return;
                        }
                    }
                }
            }
        });
        Activity { rx }
    }

    /// Combines activities pointwise: any failure wins, otherwise any
    /// pending member holds the result pending.
    pub fn collect(activities: Vec<Activity<T>>) -> Activity<Vec<T>> {
        if activities.is_empty() {
            return Activity::value(Vec::new());
        }
        let rxs: Vec<_> = activities.into_iter().map(|a| a.rx).collect();
        let rx = join_watches(rxs, |states: &[State<T>]| {
            let mut vals = Vec::with_capacity(states.len());
            let mut pending = false;
            for state in states {
                match state {
                    State::Failed(e) => return State::Failed(e.clone()),
                    State::Pending => pending = true,
                    State::Ok(t) => vals.push(t.clone()),
                }
            }
            if pending {
                State::Pending
            } else {
                State::Ok(vals)
            }
        });
        Activity { rx }
    }
}

/// Derives one watch from many: `combine` is applied to the latest values
/// whenever any input changes. Inputs whose senders have gone away keep
/// contributing their final value.
pub(crate) fn join_watches<T, O, F>(
    mut rxs: Vec<watch::Receiver<T>>,
    combine: F,
) -> watch::Receiver<O>
where
    T: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(&[T]) -> O + Send + 'static,
{
    fn snapshot<T: Clone>(rxs: &mut [watch::Receiver<T>]) -> Vec<T> {
        rxs.iter_mut()
            .map(|rx| rx.borrow_and_update().clone())
            .collect()
    }

    let initial = combine(&snapshot(&mut rxs));
    let (tx, rx) = watch::channel(initial);
    tokio::spawn(async move {
        let mut live: Vec<bool> = vec![true; rxs.len()];
        loop {
            let changed = {
                let waiters: Vec<_> = rxs
                    .iter_mut()
                    .enumerate()
                    .filter(|(i, _)| live[*i])
                    .map(|(i, rx)| Box::pin(async move { (i, rx.changed().await) }))
                    .collect();
                if waiters.is_empty() {
                    return;
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    (changed, _, _) = futures::future::select_all(waiters) => changed,
                }
            };
            match changed {
                (i, Err(_)) => live[i] = false,
                (_, Ok(())) => {
                    if tx.send(combine(&snapshot(&mut rxs))).is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

fn switch_inner<T, U, F>(
    f: &F,
    inner: &mut Option<watch::Receiver<State<U>>>,
    state: State<T>,
) -> State<U>
where
    U: Clone,
    F: Fn(T) -> Activity<U>,
{
    match state {
        State::Pending => {
            *inner = None;
            State::Pending
        }
        State::Failed(e) => {
            *inner = None;
            State::Failed(e)
        }
        State::Ok(t) => {
            let mut rx = f(t).rx;
            let state = rx.borrow_and_update().clone();
            *inner = Some(rx);
            state
        }
    }
}

async fn next_inner<U: Clone>(inner: &mut Option<watch::Receiver<State<U>>>) -> Option<State<U>> {
    match inner {
        None => std::future::pending().await,
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
    }
}
