use crate::errors::{AppError, AppResult};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Applies `transform` to a copy of `snapshot` and keeps the result only if `commit` accepts it.
///
/// On any failure the caller still holds the untouched snapshot.
pub fn transactional_apply<T, E, F, C>(snapshot: &T, transform: F, commit: C) -> Result<T, E>
where
    T: Clone,
    F: FnOnce(T) -> Result<T, E>,
    C: FnOnce(&T) -> Result<(), E>,
{
    let next = transform(snapshot.clone())?;
    commit(&next)?;
    Ok(next)
}

/// A published state together with the revision it was published at.
#[derive(Debug)]
pub struct Published<T> {
    pub revision: u64,
    pub state: Arc<T>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Self {
            revision: self.revision,
            state: Arc::clone(&self.state),
        }
    }
}

/// A published mutation whose commit has not settled yet.
#[derive(Debug)]
struct InFlight<T> {
    revision: u64,
    snapshot: Arc<T>,
    discarded: bool,
}

/// State container that publishes mutations before they are confirmed remotely and
/// restores the pre-mutation snapshot when confirmation fails.
///
/// Transforms run under the channel's write lock, so concurrent callers are applied one
/// at a time in call order. Commits run outside the lock. A transform must not call back
/// into the store.
///
/// A rollback also discards every mutation published after the failed one, since their
/// states were derived from it. A discarded mutation never republishes its snapshot, so a
/// failure known to the store is never made visible again.
#[derive(Debug)]
pub struct OptimisticStore<T> {
    sender: watch::Sender<Published<T>>,
    in_flight: Mutex<Vec<InFlight<T>>>,
}

impl<T> OptimisticStore<T>
where
    T: Clone + Send + Sync,
{
    pub fn new(initial: T) -> Self {
        let (sender, _receiver) = watch::channel(Published {
            revision: 0,
            state: Arc::new(initial),
        });
        Self {
            sender,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Arc<T> {
        Arc::clone(&self.sender.borrow().state)
    }

    pub fn revision(&self) -> u64 {
        self.sender.borrow().revision
    }

    pub fn published(&self) -> Published<T> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Published<T>> {
        self.sender.subscribe()
    }

    /// Number of published mutations still waiting on their commit.
    pub fn pending(&self) -> usize {
        self.in_flight().len()
    }

    // Lock order: the channel's write lock first, then `in_flight`.
    fn in_flight(&self) -> MutexGuard<'_, Vec<InFlight<T>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the state wholesale, e.g. after bootstrapping from the remote.
    /// Mutations still in flight can no longer roll back over it.
    pub fn replace(&self, state: T) -> u64 {
        let mut revision = 0;
        self.sender.send_modify(|published| {
            published.revision += 1;
            published.state = Arc::new(state);
            revision = published.revision;
            for entry in self.in_flight().iter_mut() {
                entry.discarded = true;
            }
        });
        revision
    }

    /// Publishes `update(current)` immediately, then awaits `commit`.
    ///
    /// A failing `update` changes nothing and skips the commit. A failing `commit`
    /// republishes the snapshot taken before `update` ran, unless an earlier rollback
    /// already discarded this mutation, and returns the commit error.
    pub async fn apply_optimistic<U, C, Fut>(&self, update: U, commit: C) -> AppResult<Arc<T>>
    where
        U: FnOnce(T) -> AppResult<T>,
        C: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let mut outcome: Option<AppResult<(Arc<T>, u64)>> = None;
        self.sender.send_if_modified(|published| {
            let snapshot = Arc::clone(&published.state);
            match update((*snapshot).clone()) {
                Ok(next) => {
                    let next = Arc::new(next);
                    published.revision += 1;
                    published.state = Arc::clone(&next);
                    self.in_flight().push(InFlight {
                        revision: published.revision,
                        snapshot,
                        discarded: false,
                    });
                    outcome = Some(Ok((next, published.revision)));
                    true
                }
                Err(error) => {
                    outcome = Some(Err(error));
                    false
                }
            }
        });

        let Some(outcome) = outcome else {
            return Err(AppError::Internal("optimistic update did not run".to_string()));
        };
        let (next, revision) = outcome?;

        match commit(Arc::clone(&next)).await {
            Ok(()) => {
                if self.settle(revision) {
                    tracing::warn!(revision, "commit succeeded after an earlier rollback discarded it locally");
                } else {
                    tracing::debug!(revision, "optimistic update committed");
                }
                Ok(next)
            }
            Err(error) => {
                if self.roll_back(revision) {
                    tracing::warn!(error = %error, revision, "remote commit failed; restoring pre-mutation state");
                } else {
                    tracing::warn!(error = %error, revision, "remote commit failed; mutation was already rolled back");
                }
                Err(error)
            }
        }
    }

    /// Forgets a committed mutation. Returns true if it had been discarded.
    fn settle(&self, revision: u64) -> bool {
        let mut in_flight = self.in_flight();
        match in_flight.iter().position(|entry| entry.revision == revision) {
            Some(position) => in_flight.remove(position).discarded,
            None => false,
        }
    }

    /// Restores the failed mutation's snapshot and discards everything published after it.
    /// Returns false when the mutation had already been discarded.
    fn roll_back(&self, revision: u64) -> bool {
        let mut restored = false;
        self.sender.send_if_modified(|published| {
            let mut in_flight = self.in_flight();
            let Some(position) = in_flight.iter().position(|entry| entry.revision == revision) else {
                return false;
            };
            let failed = in_flight.remove(position);
            if failed.discarded {
                return false;
            }
            for later in in_flight.iter_mut().skip(position) {
                later.discarded = true;
            }
            published.revision += 1;
            published.state = failed.snapshot;
            restored = true;
            true
        });
        restored
    }
}

impl<T> Default for OptimisticStore<T>
where
    T: Clone + Default + Send + Sync,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::{transactional_apply, OptimisticStore};
    use crate::errors::{AppError, AppResult};
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    type Labels = Vec<&'static str>;

    /// Pushes `label` and holds the commit until the test resolves the gate.
    fn gated_push(
        store: &Arc<OptimisticStore<Labels>>,
        label: &'static str,
    ) -> (oneshot::Sender<bool>, JoinHandle<AppResult<Arc<Labels>>>) {
        let (gate, accepted) = oneshot::channel::<bool>();
        let store = Arc::clone(store);
        let handle = tokio::spawn(async move {
            store
                .apply_optimistic(
                    move |mut state: Labels| {
                        state.push(label);
                        Ok(state)
                    },
                    move |_| async move {
                        match accepted.await {
                            Ok(true) => Ok(()),
                            _ => Err(AppError::Remote(format!("{} rejected", label))),
                        }
                    },
                )
                .await
        });
        (gate, handle)
    }

    async fn published_with(store: &OptimisticStore<Labels>, label: &'static str) {
        let mut receiver = store.subscribe();
        receiver
            .wait_for(|published| published.state.contains(&label))
            .await
            .expect("store alive");
    }

    #[tokio::test]
    async fn successful_commit_keeps_transformed_state() {
        let store = OptimisticStore::new(vec![1, 2]);
        let next = store
            .apply_optimistic(
                |mut state: Vec<i32>| {
                    state.push(3);
                    Ok(state)
                },
                |_| async { Ok(()) },
            )
            .await
            .expect("apply");

        assert_eq!(*next, vec![1, 2, 3]);
        assert_eq!(*store.current(), vec![1, 2, 3]);
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn failed_commit_restores_snapshot() {
        let store = OptimisticStore::new(vec![1, 2]);
        let err = store
            .apply_optimistic(
                |mut state: Vec<i32>| {
                    state.clear();
                    Ok(state)
                },
                |_| async { Err(AppError::Remote("offline".to_string())) },
            )
            .await
            .expect_err("commit should fail");

        assert!(matches!(err, AppError::Remote(_)));
        assert_eq!(*store.current(), vec![1, 2]);
    }

    #[tokio::test]
    async fn new_state_is_visible_while_commit_is_pending() {
        let store = OptimisticStore::new(0u32);
        let mut receiver = store.subscribe();
        let observed = store
            .apply_optimistic(
                |state| Ok(state + 1),
                |next| {
                    let visible = *receiver.borrow_and_update().state;
                    async move {
                        assert_eq!(*next, 1);
                        assert_eq!(visible, 1);
                        Ok(())
                    }
                },
            )
            .await
            .expect("apply");
        assert_eq!(*observed, 1);
    }

    #[tokio::test]
    async fn rejected_transform_skips_commit_and_publishes_nothing() {
        let store = OptimisticStore::new(String::from("stable"));
        let mut committed = false;
        let err = store
            .apply_optimistic(
                |_state: String| Err(AppError::Validation("bad input".to_string())),
                |_| {
                    committed = true;
                    async { Ok(()) }
                },
            )
            .await
            .expect_err("transform rejects");

        assert!(err.is_validation());
        assert!(!committed);
        assert_eq!(store.revision(), 0);
        assert_eq!(store.current().as_str(), "stable");
    }

    #[tokio::test]
    async fn rollback_bumps_revision_for_subscribers() {
        let store = OptimisticStore::new(5i64);
        let receiver = store.subscribe();
        let _ = store
            .apply_optimistic(|state| Ok(state * 2), |_| async { Err(AppError::Remote("down".to_string())) })
            .await;

        let published = receiver.borrow().clone();
        assert_eq!(published.revision, 2);
        assert_eq!(*published.state, 5);
    }

    #[tokio::test]
    async fn overlapping_failures_in_order_leave_neither_visible() {
        let store = Arc::new(OptimisticStore::new(Labels::new()));
        let (gate_a, first) = gated_push(&store, "A");
        published_with(&store, "A").await;
        let (gate_b, second) = gated_push(&store, "B");
        published_with(&store, "B").await;
        assert_eq!(*store.current(), vec!["A", "B"]);

        gate_a.send(false).expect("gate a");
        assert!(first.await.expect("join a").is_err());
        assert!(store.current().is_empty());

        gate_b.send(false).expect("gate b");
        assert!(second.await.expect("join b").is_err());
        assert!(store.current().is_empty());
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test]
    async fn later_failure_first_keeps_earlier_pending_mutation() {
        let store = Arc::new(OptimisticStore::new(Labels::new()));
        let (gate_a, first) = gated_push(&store, "A");
        published_with(&store, "A").await;
        let (gate_b, second) = gated_push(&store, "B");
        published_with(&store, "B").await;

        gate_b.send(false).expect("gate b");
        assert!(second.await.expect("join b").is_err());
        assert_eq!(*store.current(), vec!["A"]);

        gate_a.send(false).expect("gate a");
        assert!(first.await.expect("join a").is_err());
        assert!(store.current().is_empty());
    }

    #[tokio::test]
    async fn replace_shields_new_state_from_stale_rollbacks() {
        let store = Arc::new(OptimisticStore::new(Labels::new()));
        let (gate_a, first) = gated_push(&store, "A");
        published_with(&store, "A").await;

        store.replace(vec!["fresh"]);
        gate_a.send(false).expect("gate a");
        assert!(first.await.expect("join a").is_err());
        assert_eq!(*store.current(), vec!["fresh"]);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn transactional_apply_returns_transformed_value_on_commit() {
        let original = vec!["a".to_string()];
        let next = transactional_apply(
            &original,
            |mut value: Vec<String>| -> Result<_, String> {
                value.push("b".to_string());
                Ok(value)
            },
            |_| Ok(()),
        )
        .expect("apply");
        assert_eq!(next, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(original, vec!["a".to_string()]);
    }

    #[test]
    fn transactional_apply_surfaces_commit_error() {
        let original = 10;
        let result = transactional_apply(&original, |value| Ok(value + 1), |_| Err("rejected"));
        assert_eq!(result, Err("rejected"));
    }
}
