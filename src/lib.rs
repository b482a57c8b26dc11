//! Kalkan: optimistic software transactional memory with multi-version
//! cells, composable commutes and commit subscriptions.
//!
//! # Architecture
//!
//! - **Reads**: snapshot-based. Each transaction pins a read stamp on
//!   the global version list and only sees versions committed at or
//!   before it.
//! - **Writes**: buffered in the thread's transaction context and
//!   installed at commit under a freshly allocated write stamp, after
//!   per-cell validation.
//! - **Conflicts**: detected pessimistically between in-flight writers
//!   on the version list, and at validation time against committed
//!   versions; losers retry against a fresh snapshot.
//! - **Commutes**: deferred reorderable updates that run at commit time
//!   against the freshest value, so counters need not conflict. They
//!   degenerate to inline execution when the transaction otherwise
//!   touches the same cell.
//! - **Reclamation**: superseded copies are trimmed once no reader's
//!   stamp can observe them.
//!
//! # Example
//!
//! ```
//! use kalkan::{in_transaction, TVar};
//!
//! let account = TVar::new(100i64);
//! let savings = TVar::new(0i64);
//!
//! in_transaction(|| {
//!     let balance = account.get()?;
//!     account.set(balance - 40)?;
//!     savings.modify(|s| *s += 40)?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! let (a, s) = in_transaction(|| Ok((account.get()?, savings.get()?))).unwrap();
//! assert_eq!((a, s), (60, 40));
//! ```

mod cell;
mod commute;
mod context;
mod errors;
mod subscription;
mod transaction;
mod var;
mod version;

pub use cell::{CellRef, Shieldable};
pub use commute::{enlist_commute, enlist_strict_commute};
pub use errors::StmError;
pub use subscription::{conditional, pre_commit, SubscriptionHandle};
pub use transaction::{
    current_start_stamp, in_transaction, is_in_transaction, on_commit, on_rollback, rollback,
};
pub use var::TVar;
pub use version::WriteTicket;
