use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};

use super::world::WorldState;
use crate::gateway::GatewayError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("state store is closed")]
    Closed,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Gateway(err) if err.is_transient())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

struct StoreInner {
    /// Held for the whole of one `apply`, awaits included.
    writer: Mutex<()>,
    committed: watch::Sender<Arc<WorldState>>,
    closed: AtomicBool,
}

/// Owner of the current [`WorldState`].
///
/// Writers go through [`StateStore::apply`], which runs one mutation at a time
/// to completion. A mutation that fails leaves the committed state untouched.
/// Readers call [`StateStore::snapshot`] or follow [`StateStore::watch`] and
/// never block on a writer.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    pub fn new(initial: WorldState) -> Self {
        let (committed, _) = watch::channel(Arc::new(initial));
        Self {
            inner: Arc::new(StoreInner {
                writer: Mutex::new(()),
                committed,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Run `mutation` against a private copy of the current state and commit
    /// the result with the next revision.
    ///
    /// Mutations are serialized: a second `apply` waits until the first one has
    /// committed or failed, even if the first one is parked on gateway I/O.
    pub async fn apply<F, Fut>(&self, mutation: F) -> Result<Arc<WorldState>, StoreError>
    where
        F: FnOnce(WorldState) -> Fut + Send,
        Fut: Future<Output = Result<WorldState, GatewayError>> + Send,
    {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let _writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let current = self.inner.committed.borrow().clone();
        let previous_revision = current.revision;
        let mut next = mutation(WorldState::clone(&current)).await?;
        if self.is_closed() {
            tracing::debug!("discarding draft committed after close");
            return Err(StoreError::Closed);
        }
        next.revision = previous_revision + 1;

        let next = Arc::new(next);
        self.inner.committed.send_replace(Arc::clone(&next));
        tracing::trace!(revision = next.revision, "state committed");
        Ok(next)
    }

    /// Synchronous variant for mutations that do no I/O.
    pub async fn update<F>(&self, mutation: F) -> Result<Arc<WorldState>, StoreError>
    where
        F: FnOnce(&mut WorldState) + Send,
    {
        self.apply(|mut state| async move {
            mutation(&mut state);
            Ok(state)
        })
        .await
    }

    /// Latest committed state.
    pub fn snapshot(&self) -> Arc<WorldState> {
        self.inner.committed.borrow().clone()
    }

    /// Receiver that observes every commit.
    pub fn watch(&self) -> watch::Receiver<Arc<WorldState>> {
        self.inner.committed.subscribe()
    }

    /// Refuse all further mutations. Snapshots keep working.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("state store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
