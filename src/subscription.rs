//! Commit subscriptions: conditions re-evaluated whenever the cells
//! they read change.
//!
//! Each subscription is indexed under every cell its `test` read during
//! its latest evaluation; triggering re-runs the test in an isolated
//! sub-context and re-discovers that set, so subscriptions follow the
//! data their condition actually depends on.

use crate::cell::CellRef;
use crate::context;
use crate::errors::StmError;
use crate::transaction;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type TestFn = Box<dyn Fn() -> Result<bool, StmError> + Send + Sync>;
type BodyFn = Box<dyn Fn() -> Result<(), StmError> + Send + Sync>;

struct Subscription {
    test: TestFn,
    body: BodyFn,
    watched: Mutex<Vec<CellRef>>,
    active: AtomicBool,
}

pub(crate) struct SubscriptionRegistry {
    index: DashMap<usize, Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    fn new() -> Self {
        Self {
            index: DashMap::new(),
        }
    }

    /// Active subscriptions watching any of `cells`, deduplicated.
    fn trigger(&self, cells: &[CellRef]) -> Vec<Arc<Subscription>> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut matched = Vec::new();
        for cell in cells {
            let Some(subs) = self.index.get(&cell.id()) else {
                continue;
            };
            for sub in subs.iter() {
                if sub.active.load(Ordering::Acquire)
                    && seen.insert(Arc::as_ptr(sub) as usize)
                {
                    matched.push(sub.clone());
                }
            }
        }
        matched
    }

    /// Replace a subscription's watched set in the index.
    fn reindex(&self, sub: &Arc<Subscription>, new_watch: Vec<CellRef>) {
        let mut watched = sub.watched.lock();
        for cell in watched.iter() {
            if let Some(mut subs) = self.index.get_mut(&cell.id()) {
                subs.retain(|s| !Arc::ptr_eq(s, sub));
            }
        }
        if new_watch.is_empty() || !sub.active.load(Ordering::Acquire) {
            // A subscription reading no cells can never fire again.
            watched.clear();
            return;
        }
        for cell in &new_watch {
            self.index.entry(cell.id()).or_default().push(sub.clone());
        }
        *watched = new_watch;
    }

    fn unsubscribe(&self, sub: &Arc<Subscription>) {
        sub.active.store(false, Ordering::Release);
        self.reindex(sub, Vec::new());
    }
}

static PRE_COMMIT: Lazy<SubscriptionRegistry> = Lazy::new(SubscriptionRegistry::new);
static POST_COMMIT: Lazy<SubscriptionRegistry> = Lazy::new(SubscriptionRegistry::new);

/// Cancellation handle for a [`conditional`] or [`pre_commit`]
/// subscription.
pub struct SubscriptionHandle {
    sub: Arc<Subscription>,
    registry: &'static SubscriptionRegistry,
}

impl SubscriptionHandle {
    /// Deactivate the subscription and drop it from the index.
    pub fn cancel(&self) {
        self.registry.unsubscribe(&self.sub);
    }
}

/// Evaluate a subscription inside the open transaction: isolated test,
/// body on a passing test, watched set re-discovered and re-indexed once
/// the enclosing transaction commits.
fn evaluate(sub: &Arc<Subscription>, registry: &'static SubscriptionRegistry) -> Result<(), StmError> {
    let (fire, accessed) = context::isolated_run(|| (sub.test)())?;
    if fire {
        (sub.body)()?;
    }
    let watch: Vec<CellRef> = accessed.into_iter().collect();
    let sub = sub.clone();
    transaction::on_commit(move || registry.reindex(&sub, watch));
    Ok(())
}

/// Run the pre-commit subscribers matching the transaction's changed
/// cells (and the affected cells of still-pending commutes) inside the
/// committing transaction, before stamp acquisition.
pub(crate) fn run_pre_commit() -> Result<(), StmError> {
    if PRE_COMMIT.index.is_empty() {
        return Ok(());
    }
    let (enlisted, commute_cells) = context::with_ctx(|ctx| {
        let enlisted: Vec<CellRef> = ctx.enlisted.iter().cloned().collect();
        let affecting: Vec<CellRef> = ctx
            .commutes
            .iter()
            .flat_map(|c| c.affecting.iter().cloned())
            .collect();
        (enlisted, affecting)
    })?;
    let mut touched: Vec<CellRef> = enlisted.into_iter().filter(|c| c.has_changes()).collect();
    touched.extend(commute_cells);
    for sub in PRE_COMMIT.trigger(&touched) {
        evaluate(&sub, &PRE_COMMIT)?;
    }
    Ok(())
}

/// Actions to run after commit for the subscriptions watching `changed`.
/// Each action evaluates its subscription in a transaction of its own.
pub(crate) fn post_commit_actions(changed: &[CellRef]) -> Vec<Box<dyn FnOnce()>> {
    if changed.is_empty() || POST_COMMIT.index.is_empty() {
        return Vec::new();
    }
    POST_COMMIT
        .trigger(changed)
        .into_iter()
        .map(|sub| {
            Box::new(move || {
                let result = transaction::in_transaction(|| evaluate(&sub, &POST_COMMIT));
                if let Err(e) = result {
                    tracing::error!(error = %e, "post-commit subscription failed");
                }
            }) as Box<dyn FnOnce()>
        })
        .collect()
}

fn register(
    registry: &'static SubscriptionRegistry,
    test: TestFn,
    body: BodyFn,
) -> Result<SubscriptionHandle, StmError> {
    let sub = Arc::new(Subscription {
        test,
        body,
        watched: Mutex::new(Vec::new()),
        active: AtomicBool::new(true),
    });
    let registering = sub.clone();
    transaction::in_transaction(move || {
        // Run the test once purely to discover its read set; firing is
        // left to future commits.
        let (_, accessed) = context::isolated_run(|| (registering.test)())?;
        let watch: Vec<CellRef> = accessed.into_iter().collect();
        let sub = registering.clone();
        transaction::on_commit(move || {
            if watch.is_empty() {
                tracing::warn!("subscription test reads no cells and will never fire");
                return;
            }
            registry.reindex(&sub, watch);
        });
        Ok(())
    })?;
    Ok(SubscriptionHandle { sub, registry })
}

/// Subscribe `body` to run (in its own transaction) after any commit
/// that changes a cell `test` reads, whenever `test` passes.
pub fn conditional<Ft, Fb>(test: Ft, body: Fb) -> Result<SubscriptionHandle, StmError>
where
    Ft: Fn() -> Result<bool, StmError> + Send + Sync + 'static,
    Fb: Fn() -> Result<(), StmError> + Send + Sync + 'static,
{
    register(&POST_COMMIT, Box::new(test), Box::new(body))
}

/// Subscribe `body` to run inside any committing transaction that
/// changes a cell `test` reads, before its write stamp is taken.
pub fn pre_commit<Ft, Fb>(test: Ft, body: Fb) -> Result<SubscriptionHandle, StmError>
where
    Ft: Fn() -> Result<bool, StmError> + Send + Sync + 'static,
    Fb: Fn() -> Result<(), StmError> + Send + Sync + 'static,
{
    register(&PRE_COMMIT, Box::new(test), Box::new(body))
}
