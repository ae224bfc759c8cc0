//! Generic transaction wrapper over one event-sourced aggregate.
//!
//! Follows pairing of `EventEmitter` (events/mod.rs) with
//! `StateRebuilder`/`WorkflowStateManager`'s apply loop (engine.rs), but
//! generalized from one fixed aggregate type to any `Applier`, since this
//! engine folds three distinct state shapes (flow, partition, catalog)
//! through the same mechanism.
//!
//! A `Begin`/`Raise`/`OnSuccess`/`Commit` handle-style API does not map
//! cleanly onto Rust's borrow rules across `.await` points, so it is
//! realized here as a retryable closure: `transact` rebuilds state, hands
//! the caller a `Transaction` to `raise` events and `on_success` callbacks
//! against, then commits. On `VersionConflict` the whole closure re-runs
//! against freshly reloaded state, up to a bounded retry count — the same
//! optimistic-concurrency contract, just expressed as `Fn` instead of
//! a long-lived mutable handle.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use flowcore_store::{EventStore, EventStoreError, StateRebuilder, StreamEvent};

use crate::error::AggregatorError;

/// Maximum number of times `Aggregator::transact` retries after a
/// `VersionConflict` before giving up.
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// A pure fold from `(State, Event) -> State`. Implemented by
/// `FlowState`/`PartitionState`/`CatalogState` wrappers in this crate.
pub trait Applier: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Event: StreamEvent;

    #[must_use]
    fn apply(self, event: &Self::Event) -> Self;

    fn stream_type() -> &'static str;
}

type SuccessCallback<A> = Box<dyn FnOnce(&A) + Send>;

/// A staged-but-uncommitted transaction against one aggregate. `raise`
/// applies the event to the in-memory copy immediately, so subsequent reads
/// within the same transaction observe it: events are applied locally and
/// committed atomically.
pub struct Transaction<A: Applier> {
    state: A,
    staged: Vec<A::Event>,
    on_success: Vec<SuccessCallback<A>>,
}

impl<A: Applier> Transaction<A> {
    #[must_use]
    pub fn value(&self) -> &A {
        &self.state
    }

    pub fn raise(&mut self, event: A::Event) {
        self.state = self.state.clone().apply(&event);
        self.staged.push(event);
    }

    /// Registers a callback that runs after a successful commit, with the
    /// final post-fold state. Callbacks must be side-effect-only
    /// (scheduling work, cancelling timers); they must not re-enter this
    /// same aggregate synchronously.
    pub fn on_success(&mut self, callback: impl FnOnce(&A) + Send + 'static) {
        self.on_success.push(Box::new(callback));
    }
}

/// Wraps a transaction on one aggregate stream, with bounded
/// conflict-retry on commit.
pub struct Aggregator<A: Applier> {
    store: Arc<dyn EventStore<A::Event>>,
    rebuilder: StateRebuilder<A::Event, A>,
    stream_id: String,
}

impl<A: Applier> Aggregator<A> {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore<A::Event>>, stream_id: impl Into<String>) -> Self {
        let rebuilder = StateRebuilder::new(Arc::clone(&store));
        Self {
            store,
            rebuilder,
            stream_id: stream_id.into(),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Loads current state without opening a transaction — for read-only
    /// callers (HTTP status endpoints, the CLI).
    pub async fn load(&self, initial: A) -> Result<(A, u64), AggregatorError> {
        Ok(self
            .rebuilder
            .rebuild(&self.stream_id, initial, |state, event| state.apply(event))
            .await?)
    }

    /// Runs `body` against freshly-loaded state, commits the staged events,
    /// and on success runs every registered `on_success` callback in order.
    /// On a `VersionConflict` the whole sequence — reload, re-run `body`,
    /// commit — repeats up to `MAX_COMMIT_ATTEMPTS` times.
    pub async fn transact<F, Fut, T>(&self, initial: A, body: F) -> Result<T, AggregatorError>
    where
        F: Fn(&mut Transaction<A>) -> Fut,
        Fut: Future<Output = Result<T, AggregatorError>>,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (state, version) = self
                .rebuilder
                .rebuild(&self.stream_id, initial.clone(), |state, event| {
                    state.apply(event)
                })
                .await?;

            let mut txn = Transaction {
                state,
                staged: Vec::new(),
                on_success: Vec::new(),
            };

            let result = body(&mut txn).await?;

            if txn.staged.is_empty() {
                return Ok(result);
            }

            match self
                .store
                .append(
                    &self.stream_id,
                    A::stream_type(),
                    Some(version),
                    txn.staged,
                    serde_json::json!({}),
                )
                .await
            {
                Ok(new_version) => {
                    let _ = self
                        .rebuilder
                        .maybe_snapshot(&self.stream_id, A::stream_type(), new_version, &txn.state)
                        .await;
                    for callback in txn.on_success {
                        callback(&txn.state);
                    }
                    return Ok(result);
                }
                Err(EventStoreError::ConcurrencyConflict { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(AggregatorError::RetriesExhausted {
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }
}
