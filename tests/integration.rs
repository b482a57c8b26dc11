use kalkan::{
    conditional, current_start_stamp, enlist_commute, enlist_strict_commute, in_transaction,
    is_in_transaction, on_commit, on_rollback, pre_commit, rollback, StmError, TVar,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn test_basic_transaction() {
    let var = TVar::new(10);

    let result = in_transaction(|| {
        let val = var.get()?;
        var.set(val + 5)?;
        Ok(val)
    })
    .unwrap();

    assert_eq!(result, 10);

    let final_val = in_transaction(|| var.get()).unwrap();
    assert_eq!(final_val, 15);
}

#[test]
fn test_read_your_own_writes() {
    let var = TVar::new(10);

    in_transaction(|| {
        assert_eq!(var.get()?, 10);

        var.set(20)?;
        assert_eq!(var.get()?, 20); // Should see the uncommitted write

        var.set(30)?;
        assert_eq!(var.get()?, 30);

        Ok(())
    })
    .unwrap();

    assert_eq!(in_transaction(|| var.get()).unwrap(), 30);
}

#[test]
fn test_multiple_vars_atomic_swap() {
    let acc1 = TVar::new(100);
    let acc2 = TVar::new(0);

    // Transfer 50 from acc1 to acc2
    in_transaction(|| {
        let v1 = acc1.get()?;
        let v2 = acc2.get()?;
        acc1.set(v1 - 50)?;
        acc2.set(v2 + 50)?;
        Ok(())
    })
    .unwrap();

    let (v1, v2) = in_transaction(|| Ok((acc1.get()?, acc2.get()?))).unwrap();
    assert_eq!(v1, 50);
    assert_eq!(v2, 50);
}

#[test]
fn test_nested_transaction_joins_outer() {
    let var = TVar::new(1);

    in_transaction(|| {
        assert!(is_in_transaction());
        let outer_stamp = current_start_stamp()?;
        var.set(2)?;
        in_transaction(|| {
            // Same context: same stamp, sees the outer buffered write.
            assert_eq!(current_start_stamp()?, outer_stamp);
            assert_eq!(var.get()?, 2);
            Ok(())
        })?;
        Ok(())
    })
    .unwrap();

    assert!(!is_in_transaction());
    assert_eq!(in_transaction(|| var.get()).unwrap(), 2);
}

#[test]
fn test_outside_transaction_errors() {
    let var = TVar::new(0);
    assert_eq!(var.get(), Err(StmError::NotInTransaction));
    assert_eq!(var.set(1), Err(StmError::NotInTransaction));
    assert_eq!(current_start_stamp(), Err(StmError::NotInTransaction));
    assert!(!is_in_transaction());
}

#[test]
fn test_commit_stamps_increase() {
    let var = TVar::new(0);
    let s1 = in_transaction(|| current_start_stamp()).unwrap();
    in_transaction(|| var.set(1)).unwrap();
    let s2 = in_transaction(|| current_start_stamp()).unwrap();
    assert!(s2 > s1, "commit did not advance the stamp: {} -> {}", s1, s2);
}

#[test]
fn test_snapshot_isolation() {
    let var = Arc::new(TVar::new(0));

    let var_writer = var.clone();
    let writer = thread::spawn(move || {
        in_transaction(|| {
            var_writer.set(100)?;
            // Sleep before committing so the reader below overlaps.
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();
    });

    // Started before the writer commits: must still see 0.
    thread::sleep(Duration::from_millis(10));
    assert_eq!(in_transaction(|| var.get()).unwrap(), 0);

    writer.join().unwrap();

    // Started after the commit: sees 100.
    assert_eq!(in_transaction(|| var.get()).unwrap(), 100);
}

#[test]
fn test_write_write_conflict_retries() {
    let var = Arc::new(TVar::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let slow_read_done = Arc::new(AtomicBool::new(false));

    // Slow: reads, waits for the fast writer, then writes.
    let var_slow = var.clone();
    let attempts_slow = attempts.clone();
    let ready = slow_read_done.clone();
    let slow = thread::spawn(move || {
        in_transaction(|| {
            attempts_slow.fetch_add(1, Ordering::SeqCst);
            let v = var_slow.get()?;
            ready.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            var_slow.set(v + 1)?;
            Ok(())
        })
        .unwrap();
    });

    while !slow_read_done.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    // Fast: commits in between the slow transaction's read and commit.
    let var_fast = var.clone();
    let attempts_fast = attempts.clone();
    in_transaction(|| {
        attempts_fast.fetch_add(1, Ordering::SeqCst);
        let v = var_fast.get()?;
        var_fast.set(v + 1)?;
        Ok(())
    })
    .unwrap();

    slow.join().unwrap();

    assert_eq!(in_transaction(|| var.get()).unwrap(), 2);
    assert!(
        attempts.load(Ordering::SeqCst) >= 3,
        "the slow writer should have retried at least once"
    );
}

#[test]
fn test_explicit_rollback_retries() {
    let var = TVar::new(0);
    let mut attempts = 0;

    in_transaction(|| {
        attempts += 1;
        var.set(attempts)?;
        if attempts == 1 {
            return rollback();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(in_transaction(|| var.get()).unwrap(), 2);
}

#[test]
fn test_error_propagates_after_rollback() {
    let var = TVar::new(7);

    let result: Result<(), StmError> = in_transaction(|| {
        var.set(99)?;
        Err(StmError::InvalidCommute)
    });

    assert_eq!(result, Err(StmError::InvalidCommute));
    // The buffered write must not have survived.
    assert_eq!(in_transaction(|| var.get()).unwrap(), 7);
}

#[test]
fn test_side_effects() {
    let var = Arc::new(TVar::new(0));
    let commits = Arc::new(AtomicUsize::new(0));
    let rollbacks = Arc::new(AtomicUsize::new(0));

    // 1. Successful transaction: only the commit hook fires.
    let c = commits.clone();
    let r = rollbacks.clone();
    let var_c = var.clone();
    in_transaction(move || {
        var_c.set(1)?;
        let c = c.clone();
        let r = r.clone();
        on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);

    // 2. Forced retry: the first attempt's rollback hook fires, then the
    // second attempt's commit hook.
    let commits = Arc::new(AtomicUsize::new(0));
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let c = commits.clone();
    let r = rollbacks.clone();
    let mut first = true;
    in_transaction(move || {
        let c = c.clone();
        let r = r.clone();
        on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        if first {
            first = false;
            return rollback();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_on_commit_runs_inline_outside_transaction() {
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    on_commit(move || f.store(true, Ordering::SeqCst));
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn test_commute_applies_at_commit() {
    let counter = TVar::new(0);

    in_transaction(|| counter.commute(|v| *v += 1)).unwrap();
    in_transaction(|| counter.commute(|v| *v += 1)).unwrap();

    assert_eq!(in_transaction(|| counter.get()).unwrap(), 2);
}

#[test]
fn test_commute_degenerates_on_read() {
    let counter = TVar::new(0);

    in_transaction(|| {
        let seen = counter.get()?;
        assert_eq!(seen, 0);
        // Already enlisted: the commute executes inline.
        counter.commute(|v| *v += 1)?;
        assert_eq!(counter.get()?, 1);
        Ok(())
    })
    .unwrap();

    assert_eq!(in_transaction(|| counter.get()).unwrap(), 1);
}

#[test]
fn test_enlist_then_commute_order() {
    let counter = TVar::new(10);

    // Commute first, then a direct read: enlisting the cell must
    // degenerate the queued commute before the read returns.
    in_transaction(|| {
        counter.commute(|v| *v *= 2)?;
        assert_eq!(counter.get()?, 20);
        counter.set(21)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(in_transaction(|| counter.get()).unwrap(), 21);
}

#[test]
fn test_strict_commute_forbids_other_cells() {
    let a = Arc::new(TVar::new(0));
    let b = Arc::new(TVar::new(0));

    let a2 = a.clone();
    let b2 = b.clone();
    let result = in_transaction(move || {
        let b3 = b2.clone();
        enlist_strict_commute(move || b3.set(5), a2.cell_ref())
    });

    assert_eq!(result, Err(StmError::ForbiddenAccess));
    assert_eq!(in_transaction(|| b.get()).unwrap(), 0);
}

#[test]
fn test_overlapping_commute_is_invalid() {
    let a = Arc::new(TVar::new(0));
    let b = Arc::new(TVar::new(0));

    let a2 = a.clone();
    let b2 = b.clone();
    let result = in_transaction(move || {
        a2.set(1)?;
        let a3 = a2.clone();
        let b3 = b2.clone();
        // Declared over b only, but the body also reads a, which the
        // main transaction enlisted.
        enlist_commute(
            move || {
                let v = a3.get()?;
                b3.set(v + 1)
            },
            &[b2.cell_ref()],
        )
    });

    assert_eq!(result, Err(StmError::InvalidCommute));
}

#[test]
fn test_conditional_fires_on_matching_commits() {
    let x = Arc::new(TVar::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    let x_test = x.clone();
    let x_body = x.clone();
    let log_body = log.clone();
    let handle = conditional(
        move || Ok(x_test.get()? > 0),
        move || {
            log_body.lock().unwrap().push(x_body.get()?);
            Ok(())
        },
    )
    .unwrap();

    in_transaction(|| x.set(1)).unwrap();
    in_transaction(|| x.set(2)).unwrap();
    in_transaction(|| x.set(0)).unwrap();

    assert_eq!(*log.lock().unwrap(), vec![1, 2]);

    // Cancelled subscriptions stay silent.
    handle.cancel();
    in_transaction(|| x.set(5)).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![1, 2]);
}

#[test]
fn test_pre_commit_runs_inside_the_transaction() {
    let x = Arc::new(TVar::new(0));
    let audit = Arc::new(TVar::new(0));

    let x_test = x.clone();
    let x_body = x.clone();
    let audit_body = audit.clone();
    let _handle = pre_commit(
        move || Ok(x_test.get()? > 5),
        move || audit_body.set(x_body.get()?),
    )
    .unwrap();

    // Below the threshold: the body must not run.
    in_transaction(|| x.set(3)).unwrap();
    assert_eq!(in_transaction(|| audit.get()).unwrap(), 0);

    // Above it: the audit write commits atomically with the trigger.
    in_transaction(|| x.set(10)).unwrap();
    let (seen_x, seen_audit) = in_transaction(|| Ok((x.get()?, audit.get()?))).unwrap();
    assert_eq!(seen_x, 10);
    assert_eq!(seen_audit, 10);
}

#[test]
fn test_read_only_transaction_installs_nothing() {
    let var = TVar::new(42);
    for _ in 0..10 {
        assert_eq!(in_transaction(|| var.get()).unwrap(), 42);
    }
    // Read-only traffic installs no new copies.
    assert_eq!(var.history_len(), 1);
}
