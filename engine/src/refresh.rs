//! Refresh controller for server-computed read views.
//!
//! Aggregates such as a leaderboard are not rows, so the live feed does not
//! cover them. A [`RefreshController`] re-fetches one of them when its
//! screen gains focus and then on a fixed interval until it loses focus.
//! Overlapping triggers share one request. Data already shown stays
//! visible while a refresh is in flight; only the very first fetch shows
//! a loading state.

use crate::backend::{BackendError, BackendResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What a screen renders.
#[derive(Debug)]
pub enum RefreshState<T> {
    /// Nothing fetched yet and nothing in flight
    Idle,
    /// First fetch in flight
    Loading,
    Ready {
        data: Arc<T>,
        /// A newer fetch is in flight; `data` is still shown
        refreshing: bool,
        /// The last refresh failed; `data` is from an earlier one
        error: Option<BackendError>,
    },
    /// The first fetch failed
    Failed { error: BackendError },
}

impl<T> Clone for RefreshState<T> {
    fn clone(&self) -> Self {
        match self {
            RefreshState::Idle => RefreshState::Idle,
            RefreshState::Loading => RefreshState::Loading,
            RefreshState::Ready {
                data,
                refreshing,
                error,
            } => RefreshState::Ready {
                data: Arc::clone(data),
                refreshing: *refreshing,
                error: error.clone(),
            },
            RefreshState::Failed { error } => RefreshState::Failed {
                error: error.clone(),
            },
        }
    }
}

impl<T> RefreshState<T> {
    /// The data to render, if any.
    pub fn data(&self) -> Option<&Arc<T>> {
        match self {
            RefreshState::Ready { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, RefreshState::Loading)
    }
}

type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, BackendResult<T>> + Send + Sync>;

struct Inner<T> {
    fetcher: Fetcher<T>,
    interval: Duration,
    state: watch::Sender<RefreshState<T>>,
    in_flight: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    fetches: AtomicUsize,
}

/// Focus- and interval-driven fetcher of one read view.
pub struct RefreshController<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> RefreshController<T> {
    /// Poll every `interval` while focused.
    pub fn new<F, Fut>(interval: Duration, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BackendResult<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                fetcher: Arc::new(move || fetcher().boxed()),
                interval,
                state: watch::channel(RefreshState::Idle).0,
                in_flight: Mutex::new(None),
                poller: Mutex::new(None),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn state(&self) -> RefreshState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshState<T>> {
        self.inner.state.subscribe()
    }

    /// Number of fetches that actually went out.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Fetch now, or join the fetch already in flight.
    pub async fn refresh(&self) {
        refresh(&self.inner).await;
    }

    /// The screen became visible: fetch now and then every interval.
    pub fn focus(&self) {
        let mut poller = self.inner.poller.lock();
        if poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *poller = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(inner.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                refresh(&inner).await;
            }
        }));
    }

    /// The screen lost focus: stop polling.
    pub fn blur(&self) {
        if let Some(poller) = self.inner.poller.lock().take() {
            poller.abort();
        }
    }

    pub fn is_focused(&self) -> bool {
        self.inner.poller.lock().is_some()
    }
}

impl<T> Drop for RefreshController<T> {
    fn drop(&mut self) {
        if let Some(poller) = self.inner.poller.lock().take() {
            poller.abort();
        }
    }
}

async fn refresh<T: Send + Sync + 'static>(inner: &Arc<Inner<T>>) {
    let shared = {
        let mut slot = inner.in_flight.lock();
        match slot.as_ref() {
            Some(running) => running.clone(),
            None => {
                let running = fetch(Arc::clone(inner)).boxed().shared();
                *slot = Some(running.clone());
                running
            }
        }
    };
    shared.await;
}

async fn fetch<T: Send + Sync + 'static>(inner: Arc<Inner<T>>) {
    inner.fetches.fetch_add(1, Ordering::SeqCst);
    inner.state.send_modify(|state| {
        *state = match std::mem::replace(state, RefreshState::Idle) {
            RefreshState::Ready { data, error, .. } => RefreshState::Ready {
                data,
                refreshing: true,
                error,
            },
            _ => RefreshState::Loading,
        };
    });

    let result = (inner.fetcher)().await;

    inner.state.send_modify(|state| {
        let previous = std::mem::replace(state, RefreshState::Idle);
        *state = match (result, previous) {
            (Ok(data), _) => RefreshState::Ready {
                data: Arc::new(data),
                refreshing: false,
                error: None,
            },
            (Err(error), RefreshState::Ready { data, .. }) => {
                tracing::debug!(error = %error, "refresh failed, keeping previous data");
                RefreshState::Ready {
                    data,
                    refreshing: false,
                    error: Some(error),
                }
            }
            (Err(error), _) => RefreshState::Failed { error },
        };
    });
    *inner.in_flight.lock() = None;
}
