//! `PostgreSQL` storage for Ferrobus.
//!
//! This crate provides the database-backed collaborators of the integration
//! core:
//!
//! - [`PostgresOutbox`] — the transactional outbox (writer + reader) on the
//!   `outbox_messages` table, FIFO by id
//! - [`PostgresOffsetStore`] — the client-side offset store on the
//!   `stored_offsets` table, monotonic per `(group, topic, partition)`
//! - [`PostgresLeaseLock`] — a row-based lease lock with fencing tokens
//! - [`PostgresAdvisoryLock`] — a session-held advisory lock
//! - [`SharedPgTransaction`] — the context-bag handle enlisting the
//!   application's transaction into outbox and offset writes
//!
//! # Exactly-once at the domain boundary
//!
//! ```ignore
//! let shared = SharedPgTransaction::begin(&pool).await?;
//! let mut ctx = PipelineContext::detached();
//! ctx.bag.insert(shared.clone());
//!
//! // Domain write and outbox insert share one transaction.
//! sqlx::query("INSERT INTO orders ...").execute(&mut *shared.lock().await).await?;
//! producer.produce_with_context(message, None, &mut ctx).await?;
//!
//! shared.commit().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod lock;
mod offset_store;
mod outbox;
mod transaction;

pub use lock::{PostgresAdvisoryLock, PostgresLeaseLock};
pub use offset_store::PostgresOffsetStore;
pub use outbox::PostgresOutbox;
pub use transaction::SharedPgTransaction;
