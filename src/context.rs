//! Thread-local transaction state: enlisted cells, buffered local
//! writes, the commute queue, deferred side effects and the block /
//! tracking flags consulted on every cell access.

use crate::cell::{self, CellRef, CellSet, LocalMap};
use crate::commute::{self, Commute};
use crate::errors::StmError;
use crate::version::ReadTicket;
use std::cell::RefCell;
use std::mem;

pub(crate) struct SideEffect {
    pub(crate) on_commit: Option<Box<dyn FnOnce()>>,
    pub(crate) on_rollback: Option<Box<dyn FnOnce()>>,
}

pub(crate) struct TransContext {
    /// The read ticket held for the whole transaction attempt; pins the
    /// trim floor. Released when the context drops.
    pub(crate) ticket: ReadTicket,
    /// Effective snapshot stamp. Equals the ticket's stamp except while
    /// commutes re-run against a fresher untracked stamp.
    pub(crate) read_stamp: u64,
    pub(crate) enlisted: CellSet,
    /// Type-erased buffered writes, keyed by cell identity.
    pub(crate) locals: LocalMap,
    pub(crate) commutes: Vec<Commute>,
    pub(crate) effects: Vec<SideEffect>,
    /// When set, only this cell may enlist (strict commute execution).
    pub(crate) block_enlist: Option<CellRef>,
    /// Set while commutes run at commit time; new commutes degenerate.
    pub(crate) block_commute: bool,
    /// Force enlistment bookkeeping even for cells that already hold
    /// locals, so isolated runs observe every access.
    pub(crate) enforce_tracking: bool,
    /// Degeneration floor: commutes at or beyond this index may not
    /// execute in nested checks.
    pub(crate) commute_time: Option<usize>,
    /// The allocated write stamp, present only during installation.
    pub(crate) write_stamp: Option<u64>,
}

thread_local! {
    static CONTEXT: RefCell<Option<TransContext>> = const { RefCell::new(None) };
}

pub(crate) fn open(ticket: ReadTicket) {
    let read_stamp = ticket.stamp();
    CONTEXT.with(|slot| {
        *slot.borrow_mut() = Some(TransContext {
            ticket,
            read_stamp,
            enlisted: cell::new_cell_set(),
            locals: cell::new_local_map(),
            commutes: Vec::new(),
            effects: Vec::new(),
            block_enlist: None,
            block_commute: false,
            enforce_tracking: false,
            commute_time: None,
            write_stamp: None,
        });
    });
}

pub(crate) fn close() -> Option<TransContext> {
    CONTEXT.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn is_open() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

/// Run `f` against the open context. The borrow is released before `f`'s
/// result is returned, so callers may re-enter between calls; never call
/// back into cell operations from inside `f`.
pub(crate) fn with_ctx<R>(f: impl FnOnce(&mut TransContext) -> R) -> Result<R, StmError> {
    CONTEXT.with(|slot| {
        slot.borrow_mut()
            .as_mut()
            .map(f)
            .ok_or(StmError::NotInTransaction)
    })
}

/// Record that the current transaction touched `cell`.
///
/// Returns `true` when the cell was newly added, in which case any
/// pending commute affecting it has been degenerated before returning.
pub(crate) fn enlist(cell: &CellRef, has_locals: bool) -> Result<bool, StmError> {
    let added = with_ctx(|ctx| {
        if let Some(only) = &ctx.block_enlist {
            if only != cell {
                return Err(StmError::ForbiddenAccess);
            }
        }
        if has_locals && !ctx.enforce_tracking {
            return Ok(false);
        }
        Ok(ctx.enlisted.insert(cell.clone()))
    })??;
    if added {
        commute::check_commutes(cell)?;
    }
    Ok(added)
}

/// Queue a side-effect pair, or run `on_commit` inline when no
/// transaction is active.
pub(crate) fn queue_side_effect(
    on_commit: Option<Box<dyn FnOnce()>>,
    on_rollback: Option<Box<dyn FnOnce()>>,
) {
    if is_open() {
        let _ = with_ctx(|ctx| {
            ctx.effects.push(SideEffect {
                on_commit,
                on_rollback,
            })
        });
    } else if let Some(f) = on_commit {
        f();
    }
}

/// Run `f` in a tracking sub-context sharing everything but the
/// enlisted set, then merge the sub-context's enlistments back and
/// return them alongside `f`'s value.
pub(crate) fn isolated_run<T>(
    f: impl FnOnce() -> Result<T, StmError>,
) -> Result<(T, CellSet), StmError> {
    let (outer, tracking) = with_ctx(|ctx| {
        (
            mem::replace(&mut ctx.enlisted, cell::new_cell_set()),
            mem::replace(&mut ctx.enforce_tracking, true),
        )
    })?;
    let result = f();
    let sub = with_ctx(move |ctx| {
        let sub = mem::replace(&mut ctx.enlisted, outer);
        ctx.enforce_tracking = tracking;
        for cell in &sub {
            ctx.enlisted.insert(cell.clone());
        }
        sub
    })?;
    Ok((result?, sub))
}
