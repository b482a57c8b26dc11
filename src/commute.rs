//! Deferred reorderable updates.
//!
//! A commute is queued instead of executed, so two transactions bumping
//! the same counter need not conflict. The price is degeneration: the
//! moment the enclosing transaction enlists a cell a queued commute
//! affects, that commute must execute inline and loses its reordering
//! freedom.

use crate::cell::{self, CellRef, CellSet};
use crate::context;
use crate::errors::StmError;
use crate::version;
use std::mem;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommuteState {
    Ok,
    Broken,
    Executed,
}

pub(crate) struct Commute {
    pub(crate) perform: Rc<dyn Fn() -> Result<(), StmError>>,
    pub(crate) affecting: Vec<CellRef>,
    pub(crate) state: CommuteState,
}

impl Commute {
    fn affects(&self, cell: &CellRef) -> bool {
        self.affecting.iter().any(|c| c == cell)
    }
}

/// Register a deferred update over `affecting`.
///
/// Degenerates (runs inline) when commutes are blocked or the current
/// transaction has already enlisted one of the affected cells.
pub fn enlist_commute<F>(perform: F, affecting: &[CellRef]) -> Result<(), StmError>
where
    F: Fn() -> Result<(), StmError> + 'static,
{
    enlist(Rc::new(perform), affecting.to_vec())
}

pub(crate) fn enlist(
    perform: Rc<dyn Fn() -> Result<(), StmError>>,
    affecting: Vec<CellRef>,
) -> Result<(), StmError> {
    let degenerate = context::with_ctx(|ctx| {
        ctx.block_commute || affecting.iter().any(|c| ctx.enlisted.contains(c))
    })?;
    if degenerate {
        return perform();
    }
    context::with_ctx(|ctx| {
        ctx.commutes.push(Commute {
            perform,
            affecting,
            state: CommuteState::Ok,
        })
    })
}

/// Register a single-cell commute whose body may touch only that cell;
/// any other access fails with `ForbiddenAccess`.
///
/// The block is installed around every execution of the body — the
/// queued run at commit time and inline degeneration alike.
pub fn enlist_strict_commute<F>(perform: F, cell: CellRef) -> Result<(), StmError>
where
    F: Fn() -> Result<(), StmError> + 'static,
{
    let only = cell.clone();
    let wrapped: Rc<dyn Fn() -> Result<(), StmError>> = Rc::new(move || {
        let prev = context::with_ctx(|ctx| mem::replace(&mut ctx.block_enlist, Some(only.clone())))?;
        let result = perform();
        context::with_ctx(|ctx| ctx.block_enlist = prev)?;
        result
    });
    enlist(wrapped, vec![cell])
}

/// Degenerate queued commutes affected by a newly enlisted cell.
///
/// Commutes marked `Broken` execute in index order below the inherited
/// `commute_time` floor; enlistments made by those executions recurse
/// here with the floor lowered to the running index, which keeps
/// execution in dependency order and each commute runs at most once. On
/// the outermost check, everything that is no longer `Ok` leaves the
/// queue.
pub(crate) fn check_commutes(cell: &CellRef) -> Result<(), StmError> {
    let setup = context::with_ctx(|ctx| {
        // While the queue itself is executing, entries run in order
        // anyway; marking them here would only skip them.
        if ctx.block_commute || ctx.commutes.is_empty() {
            return None;
        }
        for commute in ctx.commutes.iter_mut() {
            if commute.state == CommuteState::Ok && commute.affects(cell) {
                commute.state = CommuteState::Broken;
            }
        }
        let entry_time = ctx.commute_time;
        let limit = entry_time.unwrap_or(ctx.commutes.len());
        Some((entry_time, limit))
    })?;
    let Some((entry_time, limit)) = setup else {
        return Ok(());
    };

    let mut failed = None;
    loop {
        let next = context::with_ctx(|ctx| {
            let bound = limit.min(ctx.commutes.len());
            let index = (0..bound).find(|&i| ctx.commutes[i].state == CommuteState::Broken)?;
            ctx.commutes[index].state = CommuteState::Executed;
            ctx.commute_time = Some(index);
            Some(ctx.commutes[index].perform.clone())
        })?;
        let Some(perform) = next else {
            break;
        };
        if let Err(e) = perform() {
            failed = Some(e);
            break;
        }
    }

    context::with_ctx(|ctx| {
        ctx.commute_time = entry_time;
        if failed.is_some() {
            ctx.commutes.retain(|c| !c.affects(cell));
        } else if entry_time.is_none() {
            ctx.commutes.retain(|c| c.state == CommuteState::Ok);
        }
    })?;
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Execute the queued commutes in an isolated sub-context against the
/// freshest committed stamp, returning the cells they enlisted.
///
/// The sub-context does not merge back; a retry inside rolls back the
/// touched cells and re-runs everything against an even fresher stamp.
pub(crate) fn run_commutes() -> Result<CellSet, StmError> {
    loop {
        let saved = context::with_ctx(|ctx| {
            for commute in ctx.commutes.iter_mut() {
                commute.state = CommuteState::Ok;
            }
            ctx.read_stamp = version::list().untracked_read_stamp();
            (
                mem::replace(&mut ctx.enlisted, cell::new_cell_set()),
                mem::replace(&mut ctx.block_commute, true),
                mem::replace(&mut ctx.enforce_tracking, true),
                ctx.block_enlist.take(),
            )
        })?;

        let mut failed = None;
        loop {
            let next = context::with_ctx(|ctx| {
                let index = ctx
                    .commutes
                    .iter()
                    .position(|c| c.state == CommuteState::Ok)?;
                ctx.commutes[index].state = CommuteState::Executed;
                ctx.commute_time = Some(index);
                Some(ctx.commutes[index].perform.clone())
            })?;
            let Some(perform) = next else {
                break;
            };
            let result = perform();
            context::with_ctx(|ctx| ctx.commute_time = None)?;
            if let Err(e) = result {
                failed = Some(e);
                break;
            }
        }

        let commuted = context::with_ctx(move |ctx| {
            ctx.commute_time = None;
            let sub = mem::replace(&mut ctx.enlisted, saved.0);
            ctx.block_commute = saved.1;
            ctx.enforce_tracking = saved.2;
            ctx.block_enlist = saved.3;
            sub
        })?;

        match failed {
            None => return Ok(commuted),
            Some(StmError::Retry) => {
                for cell in &commuted {
                    cell.rollback();
                }
                tracing::trace!("commute run retried against a fresher stamp");
            }
            Some(e) => {
                for cell in &commuted {
                    cell.rollback();
                }
                return Err(e);
            }
        }
    }
}
