//! Request coalescing.
//!
//! [`RequestGroup`] keys in-flight executions by a caller-supplied string. The first caller for
//! a key starts the body; later callers attach as waiters of the same execution. When the body
//! finishes, a post-process step splits the single result into one value per waiter — the
//! download path needs this because a live byte stream cannot be handed to N callers raw.
//!
//! Cancellation rules:
//! - A caller's cancellation never aborts the shared body. The body runs in its own task and
//!   completes for the benefit of the remaining waiters.
//! - A cancelled caller receives [`RepoError::Cancelled`] and does not consume a post-process
//!   slot; the waiter count is recomputed when the body completes.
//! - The body receives a derived [`CancellationToken`] that fires only once every waiter is
//!   gone. Waiters are refcounted: joins increment and cancellations decrement under the
//!   in-flight table lock, so the decrement that observes zero is the one that signals the
//!   body — a caller joining concurrently can never be mistaken for absent. That same
//!   decrement retires the flight from the table, so later arrivals start a fresh execution
//!   instead of attaching to a doomed one.
//!
//! The in-flight table lock is only ever held for map and slot bookkeeping, never across I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RepoError, RepoResult};

type Slot<T> = oneshot::Sender<RepoResult<T>>;

struct Flight<T> {
    slots: Mutex<Vec<Slot<T>>>,
    /// Live waiters. Changed only under the flight-table lock.
    refs: AtomicUsize,
    body_token: CancellationToken,
}

/// A keyed map of in-flight executions.
///
/// Callers are responsible for key uniqueness: two requests coalesce exactly when their keys
/// are equal. Once an execution completes, the key is free again and new arrivals start fresh.
pub struct RequestGroup<T> {
    flights: Arc<Mutex<HashMap<String, Arc<Flight<T>>>>>,
}

impl<T> Default for RequestGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for RequestGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGroup").finish_non_exhaustive()
    }
}

impl<T> RequestGroup<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> RequestGroup<T> {
    /// Join (or start) the execution for `key`.
    ///
    /// `body` is invoked at most once per in-flight key, in a spawned task, with the derived
    /// all-waiters-gone token. On success, `post(value, live_waiter_count)` must return exactly
    /// one value per live waiter; waiter *i* receives `values[i]`. On error, every live waiter
    /// receives a clone of the error.
    pub async fn run<F, Fut, P>(
        &self,
        key: &str,
        ctx: &CancellationToken,
        body: F,
        post: P,
    ) -> RepoResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = RepoResult<T>> + Send + 'static,
        P: FnOnce(T, usize) -> Vec<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let (flight, lead) = {
            let mut flights = self.flights.lock().expect("flight table lock poisoned");
            match flights.get(key) {
                Some(flight) => {
                    flight
                        .slots
                        .lock()
                        .expect("flight slot lock poisoned")
                        .push(tx);
                    flight.refs.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "joined in-flight execution");
                    (Arc::clone(flight), false)
                }
                None => {
                    let flight = Arc::new(Flight {
                        slots: Mutex::new(vec![tx]),
                        refs: AtomicUsize::new(1),
                        body_token: CancellationToken::new(),
                    });
                    flights.insert(key.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if lead {
            let fut = body(flight.body_token.clone());
            let table = Arc::clone(&self.flights);
            let key = key.to_string();
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                let result = fut.await;
                complete(table, key, flight, result, post);
            });
        }

        self.wait(key, flight, rx, ctx).await
    }

    async fn wait(
        &self,
        key: &str,
        flight: Arc<Flight<T>>,
        mut rx: oneshot::Receiver<RepoResult<T>>,
        ctx: &CancellationToken,
    ) -> RepoResult<T> {
        tokio::select! {
            biased;
            res = &mut rx => match res {
                Ok(value) => value,
                Err(_) => Err(RepoError::internal(
                    "coalesced execution dropped its result channel",
                )),
            },
            _ = ctx.cancelled() => {
                // Closing our slot releases it; the completion recount skips closed slots.
                drop(rx);
                self.release(key, &flight);
                Err(RepoError::Cancelled)
            }
        }
    }

    /// Drop one waiter's reference. The decrement that observes zero retires the flight and
    /// signals the body; it runs under the table lock, so it cannot race a concurrent join.
    fn release(&self, key: &str, flight: &Arc<Flight<T>>) {
        let mut flights = self.flights.lock().expect("flight table lock poisoned");
        if flight.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(existing) = flights.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    flights.remove(key);
                }
            }
            debug!(key, "all waiters cancelled; signalling the shared body");
            flight.body_token.cancel();
        }
    }

    /// Join (or start) the execution for `key`, sharing one clonable result across all waiters.
    pub async fn run_shared<F, Fut>(
        &self,
        key: &str,
        ctx: &CancellationToken,
        body: F,
    ) -> RepoResult<T>
    where
        T: Clone,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = RepoResult<T>> + Send + 'static,
    {
        self.run(key, ctx, body, |value, count| vec![value; count])
            .await
    }
}

fn complete<T, P>(
    table: Arc<Mutex<HashMap<String, Arc<Flight<T>>>>>,
    key: String,
    flight: Arc<Flight<T>>,
    result: RepoResult<T>,
    post: P,
) where
    P: FnOnce(T, usize) -> Vec<T>,
{
    // Retire the entry first: new arrivals from here on start a fresh execution. A fully
    // abandoned flight may already have been retired (and its key reused), so only remove
    // this execution's own entry.
    {
        let mut flights = table.lock().expect("flight table lock poisoned");
        if let Some(existing) = flights.get(&key) {
            if Arc::ptr_eq(existing, &flight) {
                flights.remove(&key);
            }
        }
    }

    let slots: Vec<Slot<T>> = {
        let mut slots = flight.slots.lock().expect("flight slot lock poisoned");
        slots.drain(..).collect()
    };
    let live: Vec<Slot<T>> = slots.into_iter().filter(|slot| !slot.is_closed()).collect();

    match result {
        Err(err) => {
            for slot in live {
                let _ = slot.send(Err(err.clone()));
            }
        }
        Ok(value) => {
            if live.is_empty() {
                // Every caller cancelled; dropping the value closes any stream it holds.
                trace!(%key, "discarding result of fully-abandoned execution");
                return;
            }
            let values = post(value, live.len());
            if values.len() != live.len() {
                let err = RepoError::internal(format!(
                    "post-process returned {} values for {} waiters",
                    values.len(),
                    live.len()
                ));
                for slot in live {
                    let _ = slot.send(Err(err.clone()));
                }
                return;
            }
            for (slot, value) in live.into_iter().zip(values) {
                let _ = slot.send(Ok(value));
            }
        }
    }
}
