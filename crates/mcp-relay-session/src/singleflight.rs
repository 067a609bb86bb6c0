//! Keyed-per-owner single-flight primitive.
//!
//! The first caller to need a recreation starts it and memoizes the
//! in-flight future; concurrent callers await the same future instead of
//! each recreating independently. The slot is reset from inside the shared
//! future the moment it resolves, so whichever waiter drives it to
//! completion performs the reset and a cancelled first caller cannot
//! strand a stale result; a later, unrelated invalidation always triggers
//! a fresh run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use mcp_relay_core::RelayError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, RelayError>>>;
type Slot<T> = Arc<Mutex<Option<(u64, SharedResult<T>)>>>;

/// Deduplicates concurrent executions of one fallible async operation.
pub struct SingleFlight<T: Clone> {
    inflight: Slot<T>,
    ticket: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(None)),
            ticket: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Run `make` unless a run is already in flight, in which case await
    /// that run's result instead.
    ///
    /// # Errors
    /// Propagates the (shared) failure of the single execution.
    pub async fn run<F>(&self, make: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, RelayError>>,
    {
        let shared = {
            let mut slot = self.inflight.lock().expect("inflight lock");
            if let Some((_, existing)) = slot.as_ref() {
                existing.clone()
            } else {
                let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::clone(&self.inflight);
                let inner = make();
                let shared = async move {
                    let result = inner.await;
                    // The ticket guards against clearing a successor run
                    // installed after this one already resolved.
                    let mut slot = handle.lock().expect("inflight lock");
                    if slot.as_ref().is_some_and(|(id, _)| *id == ticket) {
                        slot.take();
                    }
                    drop(slot);
                    result
                }
                .boxed()
                .shared();
                *slot = Some((ticket, shared.clone()));
                shared
            }
        };

        shared.await
    }
}
