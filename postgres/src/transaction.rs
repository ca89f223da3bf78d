//! Transaction enlistment through the pipeline context bag.

use ferrobus_core::context::PipelineContext;
use ferrobus_core::error::PipelineError;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A shareable handle to one open `PostgreSQL` transaction.
///
/// Stored in the pipeline context bag so the outbox writer (and optionally
/// the offset store) execute inside the application's transaction without
/// the core depending on sqlx. The handle is cheap to clone; all clones
/// refer to the same transaction.
#[derive(Clone)]
pub struct SharedPgTransaction {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl SharedPgTransaction {
    /// Begin a transaction on `pool` and wrap it for enlistment.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the transaction cannot be
    /// started.
    pub async fn begin(pool: &PgPool) -> Result<Self, PipelineError> {
        let tx = pool
            .begin()
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to begin transaction: {e}")))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        })
    }

    /// Enlist this transaction into a pipeline context.
    pub fn enlist(&self, ctx: &mut PipelineContext) {
        ctx.bag.insert(self.clone());
    }

    /// Lock the underlying transaction slot for direct queries.
    pub async fn lock(&self) -> MutexGuard<'_, Option<Transaction<'static, Postgres>>> {
        self.inner.lock().await
    }

    /// Commit the transaction. Further writes through this handle fall back
    /// to autonomous execution.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the commit fails or the
    /// transaction was already finished.
    pub async fn commit(&self) -> Result<(), PipelineError> {
        let tx = self.inner.lock().await.take().ok_or_else(|| {
            PipelineError::Storage("transaction already committed or rolled back".into())
        })?;
        tx.commit()
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to commit transaction: {e}")))
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the rollback fails or the
    /// transaction was already finished.
    pub async fn rollback(&self) -> Result<(), PipelineError> {
        let tx = self.inner.lock().await.take().ok_or_else(|| {
            PipelineError::Storage("transaction already committed or rolled back".into())
        })?;
        tx.rollback()
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to roll back transaction: {e}")))
    }
}

impl std::fmt::Debug for SharedPgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedPgTransaction")
    }
}
