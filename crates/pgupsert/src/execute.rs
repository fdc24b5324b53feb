//! Savepoint scope around one upsert.
//!
//! The savepoint lets a failed upsert be undone without aborting the
//! caller's transaction. If the upsert future is dropped mid-flight, the
//! rollback is queued on the session as the future is dropped, ahead of
//! anything the caller sends next (such as `COMMIT`). A savepoint that still
//! could not be resolved stays recorded in a shared flag and is rolled back
//! before the session is used again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use crate::error::Error;
use crate::session::{Session, StoreError};

/// SQLSTATE `3B001`: the savepoint does not exist (it was already resolved).
const INVALID_SAVEPOINT_SPECIFICATION: &str = "3B001";

/// Runs work inside `SAVEPOINT <name>`: released on success, rolled back on
/// failure, never retried.
pub struct Executor<'a, S: ?Sized> {
    session: &'a S,
    savepoint: &'a str,
    pending_rollback: &'a AtomicBool,
}

impl<'a, S: Session + ?Sized> Executor<'a, S> {
    /// `savepoint` must be a plain identifier; it is interpolated into the
    /// statement text.
    pub fn new(session: &'a S, savepoint: &'a str, pending_rollback: &'a AtomicBool) -> Self {
        Self {
            session,
            savepoint,
            pending_rollback,
        }
    }

    /// Run `work` inside the savepoint.
    ///
    /// On failure the savepoint is rolled back and the original error is
    /// returned unchanged; a failing rollback is logged, never reported in
    /// its place.
    pub async fn run<T>(&self, work: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        self.recover().await?;

        let guard = RollbackOnDrop { executor: self };
        self.open().await?;
        let result = work.await;
        guard.disarm();

        match result {
            Ok(value) => match self.release().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.rollback().await;
                    Err(e.into())
                }
            },
            Err(e) => {
                tracing::debug!(savepoint = self.savepoint, error = %e, "upsert failed, rolling back");
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Roll back a savepoint left open by a cancelled run, if any.
    pub async fn recover(&self) -> Result<(), StoreError> {
        if !self.pending_rollback.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::warn!(
            savepoint = self.savepoint,
            "rolling back savepoint left open by a cancelled upsert"
        );
        match self.rollback_to_savepoint().await {
            Ok(()) => Ok(()),
            Err(e) if e.sqlstate() == Some(INVALID_SAVEPOINT_SPECIFICATION) => {
                // The savepoint was released (or never created) before the
                // run was dropped: nothing to undo.
                self.pending_rollback.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&self) -> Result<(), StoreError> {
        // Set before sending: a drop while SAVEPOINT is in flight must still
        // be cleaned up.
        self.pending_rollback.store(true, Ordering::SeqCst);
        let sql = format!("SAVEPOINT {}", self.savepoint);
        if let Err(e) = self.session.batch_execute(&sql).await {
            self.pending_rollback.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), StoreError> {
        // Cleared before sending: once queued, the release runs even if this
        // future is dropped. On failure `run` rolls back.
        self.pending_rollback.store(false, Ordering::SeqCst);
        let sql = format!("RELEASE SAVEPOINT {}", self.savepoint);
        self.session.batch_execute(&sql).await
    }

    async fn rollback(&self) {
        if let Err(e) = self.rollback_to_savepoint().await {
            tracing::error!(
                savepoint = self.savepoint,
                error = %e,
                "failed to roll back to savepoint"
            );
        }
    }

    async fn rollback_to_savepoint(&self) -> Result<(), StoreError> {
        self.pending_rollback.store(false, Ordering::SeqCst);
        if let Err(e) = self.session.batch_execute(&self.rollback_sql()).await {
            self.pending_rollback.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn rollback_sql(&self) -> String {
        format!(
            "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
            self.savepoint
        )
    }

    /// Send the rollback without waiting for it.
    ///
    /// A session sends its request on the first poll, so one poll puts the
    /// rollback on the wire ahead of any later statement. The response is
    /// discarded.
    fn queue_rollback(&self) {
        tracing::warn!(
            savepoint = self.savepoint,
            "upsert dropped mid-flight, rolling back savepoint"
        );
        self.pending_rollback.store(false, Ordering::SeqCst);

        let sql = self.rollback_sql();
        let mut rollback = self.session.batch_execute(&sql);
        let mut cx = Context::from_waker(Waker::noop());
        if let Poll::Ready(Err(e)) = rollback.as_mut().poll(&mut cx) {
            tracing::error!(
                savepoint = self.savepoint,
                error = %e,
                "failed to queue savepoint rollback"
            );
            self.pending_rollback.store(true, Ordering::SeqCst);
        }
    }
}

/// Queues the savepoint rollback if the run is dropped while its work is in
/// flight.
struct RollbackOnDrop<'e, 'a, S: Session + ?Sized> {
    executor: &'e Executor<'a, S>,
}

impl<S: Session + ?Sized> RollbackOnDrop<'_, '_, S> {
    /// The work finished; `run` resolves the savepoint itself.
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl<S: Session + ?Sized> Drop for RollbackOnDrop<'_, '_, S> {
    fn drop(&mut self) {
        if self.executor.pending_rollback.load(Ordering::SeqCst) {
            self.executor.queue_rollback();
        }
    }
}
