//! `TVar<T>`: the multi-versioned transactional variable.

use crate::cell::{CellRef, Shieldable};
use crate::commute;
use crate::context;
use crate::errors::StmError;
use crate::version::WriteTicket;
use parking_lot::RwLock;
use std::sync::Arc;

struct VersionedCopy<T> {
    stamp: u64,
    value: T,
}

/// Shared state behind a `TVar`: the newest-first chain of committed
/// copies. Buffered writes live in the owning thread's transaction
/// context, keyed by this allocation's identity.
struct Inner<T> {
    versions: RwLock<Vec<VersionedCopy<T>>>,
}

impl<T> Inner<T> {
    fn id(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

impl<T: Clone + Send + Sync + 'static> Shieldable for Inner<T> {
    fn has_changes(&self) -> bool {
        context::with_ctx(|ctx| ctx.locals.contains_key(&self.id())).unwrap_or(false)
    }

    fn can_commit(&self, ticket: &WriteTicket) -> bool {
        let Ok(read_stamp) = context::with_ctx(|ctx| ctx.read_stamp) else {
            return false;
        };
        let versions = self.versions.read();
        let newest = versions.first().map(|copy| copy.stamp).unwrap_or(0);
        newest <= read_stamp && newest < ticket.stamp()
    }

    fn commit(&self) {
        let taken = context::with_ctx(|ctx| {
            ctx.locals
                .remove(&self.id())
                .map(|buffered| (buffered, ctx.write_stamp))
        });
        if let Ok(Some((buffered, stamp))) = taken {
            let stamp = stamp.expect("write stamp missing while installing a buffered write");
            let value = *buffered
                .downcast::<T>()
                .ok()
                .expect("buffered write of mismatched type");
            self.versions
                .write()
                .insert(0, VersionedCopy { stamp, value });
        }
    }

    fn rollback(&self) {
        let _ = context::with_ctx(|ctx| ctx.locals.remove(&self.id()));
    }

    fn trim_copies(&self, up_to: u64) {
        let mut versions = self.versions.write();
        // Keep the newest copy visible at `up_to` and everything newer.
        if let Some(keep) = versions.iter().position(|copy| copy.stamp <= up_to) {
            versions.truncate(keep + 1);
        }
    }
}

/// A transactional variable.
///
/// Every access goes through the transaction open on the current thread;
/// reads come from the snapshot the transaction started at, writes are
/// buffered until commit. Cloning the handle is cheap and refers to the
/// same variable.
pub struct TVar<T: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TVar<T> {
    /// Create a new variable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                versions: RwLock::new(vec![VersionedCopy { stamp: 0, value }]),
            }),
        }
    }

    /// The identity-keyed cell handle, for commute declarations and the
    /// subscription registries.
    pub fn cell_ref(&self) -> CellRef {
        CellRef::new(self.inner.clone())
    }

    /// Read the variable at the transaction's snapshot, observing own
    /// buffered writes first.
    pub fn get(&self) -> Result<T, StmError> {
        let id = self.inner.id();
        let has_local = context::with_ctx(|ctx| ctx.locals.contains_key(&id))?;
        context::enlist(&self.cell_ref(), has_local)?;
        // Enlisting may have degenerated a commute that wrote us.
        let (local, stamp) = context::with_ctx(|ctx| {
            let local = ctx.locals.get(&id).map(|buffered| {
                buffered
                    .downcast_ref::<T>()
                    .expect("buffered write of mismatched type")
                    .clone()
            });
            (local, ctx.read_stamp)
        })?;
        if let Some(value) = local {
            return Ok(value);
        }
        let versions = self.inner.versions.read();
        versions
            .iter()
            .find(|copy| copy.stamp <= stamp)
            .map(|copy| copy.value.clone())
            .ok_or(StmError::Retry)
    }

    /// Buffer `value` as this transaction's write.
    pub fn set(&self, value: T) -> Result<(), StmError> {
        let id = self.inner.id();
        let has_local = context::with_ctx(|ctx| ctx.locals.contains_key(&id))?;
        context::enlist(&self.cell_ref(), has_local)?;
        context::with_ctx(|ctx| {
            ctx.locals.insert(id, Box::new(value));
        })?;
        Ok(())
    }

    /// Read-modify-write in one step.
    pub fn modify<F>(&self, f: F) -> Result<(), StmError>
    where
        F: FnOnce(&mut T),
    {
        let mut value = self.get()?;
        f(&mut value);
        self.set(value)
    }

    /// Register `f` as a strict commute over this variable: it runs at
    /// commit time against the freshest value, reorderable with other
    /// commutes, and may touch no other cell. Degenerates to an inline
    /// update if the transaction otherwise accesses this variable.
    pub fn commute<F>(&self, f: F) -> Result<(), StmError>
    where
        F: Fn(&mut T) + 'static,
    {
        let var = self.clone();
        commute::enlist_strict_commute(
            move || {
                let mut value = var.get()?;
                f(&mut value);
                var.set(value)
            },
            self.cell_ref(),
        )
    }

    /// Number of retained versioned copies. Diagnostic; bounded by the
    /// trimmer.
    pub fn history_len(&self) -> usize {
        self.inner.versions.read().len()
    }
}
