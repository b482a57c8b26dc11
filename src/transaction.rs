//! The transaction driver: retry loop, two-phase validate-and-commit
//! against the version list, commute re-running, rollback and the
//! deferred side-effect dispatch.

use crate::cell::{self, CellRef};
use crate::commute;
use crate::context::{self, TransContext};
use crate::errors::StmError;
use crate::subscription;
use crate::version::{self, WriteTicket};

/// Rolls the attempt back if the body unwinds with the context open.
struct RollbackGuard;

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if context::is_open() {
            do_rollback();
        }
    }
}

/// Run `f` atomically.
///
/// `f` may run multiple times: a conflicting commit or an explicit
/// [`rollback`] restarts it against a fresh snapshot, so it should be
/// free of side effects other than cell operations — defer external work
/// through [`on_commit`] / [`on_rollback`]. A nested call joins the
/// enclosing transaction. Errors other than the retry signal roll the
/// transaction back and propagate.
///
/// # Example
///
/// ```
/// use kalkan::{in_transaction, TVar};
///
/// let var = TVar::new(10);
/// let seen = in_transaction(|| {
///     let value = var.get()?;
///     var.set(value + 5)?;
///     Ok(value)
/// })
/// .unwrap();
/// assert_eq!(seen, 10);
/// ```
pub fn in_transaction<T, F>(mut f: F) -> Result<T, StmError>
where
    F: FnMut() -> Result<T, StmError>,
{
    if context::is_open() {
        return f();
    }
    loop {
        context::open(version::list().get_reader_ticket());
        let _guard = RollbackGuard;
        match f() {
            Ok(value) => match do_commit()? {
                true => return Ok(value),
                false => {
                    tracing::trace!("commit validation failed, retrying");
                }
            },
            Err(StmError::Retry) => {
                do_rollback();
                tracing::trace!("transaction rolled back by request, retrying");
            }
            Err(e) => {
                do_rollback();
                return Err(e);
            }
        }
    }
}

/// Abandon the current attempt and retry with a fresh snapshot.
///
/// Usable as `return rollback();` from inside a transaction body.
pub fn rollback<T>() -> Result<T, StmError> {
    Err(StmError::Retry)
}

/// Is a transaction open on this thread?
pub fn is_in_transaction() -> bool {
    context::is_open()
}

/// The snapshot stamp the current transaction reads at.
pub fn current_start_stamp() -> Result<u64, StmError> {
    context::with_ctx(|ctx| ctx.read_stamp)
}

/// Defer `f` until the enclosing transaction commits; runs immediately
/// when no transaction is active. Fires at most once, on the final
/// outcome of the attempt that queued it.
pub fn on_commit<F>(f: F)
where
    F: FnOnce() + 'static,
{
    context::queue_side_effect(Some(Box::new(f)), None);
}

/// Run `f` if the enclosing attempt rolls back; dropped when no
/// transaction is active.
pub fn on_rollback<F>(f: F)
where
    F: FnOnce() + 'static,
{
    context::queue_side_effect(None, Some(Box::new(f)));
}

enum CheckOutcome {
    Ready {
        ticket: WriteTicket,
        commuted: Vec<CellRef>,
    },
    Failed {
        commuted: Vec<CellRef>,
    },
}

/// Two-phase commit of the open transaction. Closes the context on
/// every path. `Ok(false)` means validation failed and the caller
/// should retry.
pub(crate) fn do_commit() -> Result<bool, StmError> {
    let (commutes_pending, main_cells) = match context::with_ctx(snapshot_enlisted) {
        Ok(v) => v,
        Err(e) => return Err(e),
    };
    let has_changes = commutes_pending || main_cells.iter().any(|c| c.has_changes());

    if !has_changes {
        // Read-only fast path: no stamp, no validation.
        for cell in &main_cells {
            cell.commit();
        }
        finish_commit(Vec::new());
        return Ok(true);
    }

    let outcome = match commit_check() {
        Ok(outcome) => outcome,
        Err(e) => {
            do_rollback();
            return Err(e);
        }
    };

    match outcome {
        CheckOutcome::Failed { commuted } => {
            for cell in &commuted {
                cell.rollback();
            }
            do_rollback();
            Ok(false)
        }
        CheckOutcome::Ready { ticket, commuted } => {
            let main_cells: Vec<CellRef> = match context::with_ctx(|ctx| {
                ctx.write_stamp = Some(ticket.stamp());
                ctx.enlisted.iter().cloned().collect()
            }) {
                Ok(cells) => cells,
                Err(e) => {
                    // Never leave the entry in Checking; later writers
                    // would wait on it forever.
                    ticket.rollback();
                    return Err(e);
                }
            };
            let changed: Vec<CellRef> = main_cells
                .iter()
                .chain(&commuted)
                .filter(|c| c.has_changes())
                .cloned()
                .collect();
            for cell in main_cells.iter().chain(&commuted) {
                cell.commit();
            }
            ticket.set_changes(changed.clone());
            ticket.commit();
            tracing::debug!(
                stamp = ticket.stamp(),
                cells = changed.len(),
                "transaction committed"
            );
            let actions = subscription::post_commit_actions(&changed);
            finish_commit(actions);
            Ok(true)
        }
    }
}

fn snapshot_enlisted(ctx: &mut TransContext) -> (bool, Vec<CellRef>) {
    (
        !ctx.commutes.is_empty(),
        ctx.enlisted.iter().cloned().collect(),
    )
}

/// Close the context, releasing the read ticket, then run the queued
/// on-commit effects followed by the post-commit subscription actions.
fn finish_commit(actions: Vec<Box<dyn FnOnce()>>) {
    if let Some(ctx) = context::close() {
        let TransContext { effects, ticket, .. } = ctx;
        drop(ticket);
        for effect in effects {
            if let Some(f) = effect.on_commit {
                f();
            }
        }
    }
    for action in actions {
        action();
    }
    version::list().maybe_trim();
}

/// Roll back the open transaction: discard every enlisted cell's
/// buffered state, close the context and run the on-rollback effects.
pub(crate) fn do_rollback() {
    let cells: Vec<CellRef> = match context::with_ctx(|ctx| ctx.enlisted.iter().cloned().collect())
    {
        Ok(cells) => cells,
        Err(_) => return,
    };
    for cell in &cells {
        cell.rollback();
    }
    if let Some(ctx) = context::close() {
        let TransContext { effects, ticket, .. } = ctx;
        drop(ticket);
        for effect in effects {
            if let Some(f) = effect.on_rollback {
                f();
            }
        }
    }
    version::list().maybe_trim();
}

/// Validate the transaction against a freshly allocated write stamp.
///
/// Pre-commit subscribers run first, inside the transaction. Commutes
/// then execute in their isolated sub-context; if any of the cells they
/// touched fails validation the commutes re-run against a fresher stamp
/// without disturbing the main transaction. A validation failure on a
/// main cell fails the whole commit.
fn commit_check() -> Result<CheckOutcome, StmError> {
    subscription::run_pre_commit()?;

    let (mut broke_in_commutes, start_stamp) =
        context::with_ctx(|ctx| (!ctx.commutes.is_empty(), ctx.ticket.stamp()))?;
    let had_commutes = broke_in_commutes;
    let mut commuted = cell::new_cell_set();

    loop {
        if broke_in_commutes {
            commuted = commute::run_commutes()?;
            let overlap =
                context::with_ctx(|ctx| commuted.iter().any(|c| ctx.enlisted.contains(c)))?;
            if overlap {
                for cell in &commuted {
                    cell.rollback();
                }
                tracing::error!("commute enlistments overlap the main transaction");
                return Err(StmError::InvalidCommute);
            }
        }

        let main_cells: Vec<CellRef> =
            context::with_ctx(|ctx| ctx.enlisted.iter().cloned().collect())?;
        let comm_cells: Vec<CellRef> = commuted.iter().cloned().collect();

        let mut enlisted_ids = cell::new_id_set();
        for cell in main_cells.iter().chain(&comm_cells) {
            enlisted_ids.insert(cell.id());
        }
        let comm_ids = had_commutes.then(|| {
            let mut ids = cell::new_id_set();
            ids.extend(comm_cells.iter().map(|c| c.id()));
            ids
        });

        let list = version::list();
        let mut commuted_ok = true;
        let mut main_ok = true;
        let ticket;
        {
            let _stamp = list.lock_stamp();
            ticket = list.new_version(enlisted_ids, comm_ids);
            // Commuted cells validate against the stamp their run
            // observed; the main cells against the original snapshot.
            for cell in &comm_cells {
                if !cell.can_commit(&ticket) {
                    commuted_ok = false;
                    break;
                }
            }
            if commuted_ok {
                if let Err(e) = context::with_ctx(|ctx| ctx.read_stamp = start_stamp) {
                    ticket.rollback();
                    return Err(e);
                }
                for cell in &main_cells {
                    if !cell.can_commit(&ticket) {
                        main_ok = false;
                        break;
                    }
                }
            }
        }

        if commuted_ok && main_ok {
            return Ok(CheckOutcome::Ready {
                ticket,
                commuted: comm_cells,
            });
        }
        ticket.rollback();
        if !commuted_ok {
            // The commute results went stale; discard and re-run them.
            for cell in &comm_cells {
                cell.rollback();
            }
            broke_in_commutes = true;
            tracing::trace!("commuted cells failed validation, re-running commutes");
            continue;
        }
        return Ok(CheckOutcome::Failed {
            commuted: comm_cells,
        });
    }
}
