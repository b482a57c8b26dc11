//! The global version list: a forward-linked chain of version entries
//! issuing monotonic stamps to readers and writers, detecting conflicts
//! between in-flight writers and trimming copies no reader can observe.

use crate::cell::{self, CellRef, CellSet, IdSet};
use crossbeam_utils::Backoff;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use std::hint::spin_loop;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Finalization state of a version entry.
///
/// A `Checking` entry is between stamp allocation and finalization;
/// later conflicting writers must wait for it to leave this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EntryState {
    Checking = 0,
    Commit = 1,
    Rollback = 2,
}

/// Node of the version list.
///
/// Shared between the threads holding read tickets on it and the thread
/// finalizing it; reclaimed through `Arc` once the trimmer has tombstoned
/// its reader count and advanced past it.
pub(crate) struct VersionEntry {
    stamp: AtomicU64,
    state: AtomicU8,
    /// Registered reader count. `i64::MIN` is the tombstone meaning the
    /// trimmer has passed this entry and no further readers may register.
    reader_count: AtomicI64,
    enlisted: RwLock<Option<IdSet>>,
    comm_enlisted: RwLock<Option<IdSet>>,
    /// Cells with versions installed by this entry. `None` until the
    /// writer finalizes; the transition to `Some` happens exactly once
    /// and makes the entry eligible for trimming.
    changes: Mutex<Option<Vec<CellRef>>>,
    /// Single-writer-wins forward link.
    later: OnceCell<Arc<VersionEntry>>,
}

impl VersionEntry {
    fn base() -> Self {
        Self {
            stamp: AtomicU64::new(0),
            state: AtomicU8::new(EntryState::Commit as u8),
            reader_count: AtomicI64::new(0),
            enlisted: RwLock::new(None),
            comm_enlisted: RwLock::new(None),
            changes: Mutex::new(Some(Vec::new())),
            later: OnceCell::new(),
        }
    }

    fn checking(enlisted: IdSet, comm_enlisted: Option<IdSet>) -> Self {
        Self {
            stamp: AtomicU64::new(0),
            state: AtomicU8::new(EntryState::Checking as u8),
            reader_count: AtomicI64::new(0),
            enlisted: RwLock::new(Some(enlisted)),
            comm_enlisted: RwLock::new(comm_enlisted),
            changes: Mutex::new(None),
            later: OnceCell::new(),
        }
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    fn state(&self) -> EntryState {
        match self.state.load(Ordering::Acquire) {
            0 => EntryState::Checking,
            1 => EntryState::Commit,
            _ => EntryState::Rollback,
        }
    }
}

/// Writer-writer overlap check.
///
/// Only entries still in `Checking` with their enlisted sets intact can
/// conflict; a finalized predecessor has already installed (or discarded)
/// its versions and is safe to pass.
fn is_conflict(new: &VersionEntry, old: &VersionEntry) -> bool {
    if old.state() != EntryState::Checking {
        return false;
    }
    let old_enlisted = old.enlisted.read();
    let Some(old_enlisted) = old_enlisted.as_ref() else {
        return false;
    };
    let new_enlisted = new.enlisted.read();
    let Some(new_enlisted) = new_enlisted.as_ref() else {
        return false;
    };
    if !new_enlisted.is_disjoint(old_enlisted) {
        return true;
    }
    let old_comm = old.comm_enlisted.read();
    if let Some(old_comm) = old_comm.as_ref() {
        if !new_enlisted.is_disjoint(old_comm) {
            return true;
        }
    }
    let new_comm = new.comm_enlisted.read();
    if let Some(new_comm) = new_comm.as_ref() {
        if !new_comm.is_disjoint(old_enlisted) {
            return true;
        }
        if let Some(old_comm) = old_comm.as_ref() {
            if !new_comm.is_disjoint(old_comm) {
                return true;
            }
        }
    }
    false
}

/// A handle pinning the minimum reachable version at its stamp.
///
/// While held, no cell version whose validity covers the stamp may be
/// trimmed. Released on drop.
pub(crate) struct ReadTicket {
    entry: Arc<VersionEntry>,
}

impl ReadTicket {
    pub(crate) fn stamp(&self) -> u64 {
        self.entry.stamp()
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        self.entry.reader_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A commit-rights handle over a `Checking` version entry.
///
/// Handed out by the version list once the writer has passed conflict
/// detection; carries the allocated write stamp and must be finalized
/// exactly once, to `Commit` or `Rollback`.
pub struct WriteTicket {
    entry: Arc<VersionEntry>,
}

impl WriteTicket {
    /// The stamp new versions will be tagged with.
    pub fn stamp(&self) -> u64 {
        self.entry.stamp()
    }

    /// Record the cells that installed new versions under this ticket.
    pub(crate) fn set_changes(&self, cells: Vec<CellRef>) {
        *self.entry.changes.lock() = Some(cells);
    }

    /// Finalize to `Commit` and advance the list head.
    pub(crate) fn commit(&self) {
        list().finalize(self, EntryState::Commit);
    }

    /// Finalize to `Rollback` and advance the list head. Installs an
    /// empty change set so the entry stays trimmable.
    pub(crate) fn rollback(&self) {
        self.set_changes(Vec::new());
        list().finalize(self, EntryState::Rollback);
    }
}

/// TTAS lock serializing write-stamp allocation and commit validation.
struct StampLock {
    acquired: AtomicBool,
}

impl StampLock {
    const fn new() -> Self {
        Self {
            acquired: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> StampGuard<'_> {
        loop {
            while self.acquired.load(Ordering::Relaxed) {
                spin_loop();
            }
            if !self.acquired.swap(true, Ordering::Acquire) {
                return StampGuard { lock: self };
            }
        }
    }
}

pub(crate) struct StampGuard<'a> {
    lock: &'a StampLock,
}

impl Drop for StampGuard<'_> {
    fn drop(&mut self) {
        self.lock.acquired.store(false, Ordering::Release);
    }
}

/// The version list proper.
///
/// `current` anchors the head of the latest finalized region; readers
/// register there. `oldest_read` is the trim cursor and only ever moves
/// forward along `later`.
pub(crate) struct VersionList {
    current: RwLock<Arc<VersionEntry>>,
    oldest_read: Mutex<Arc<VersionEntry>>,
    trimming: AtomicBool,
    trim_clock: AtomicU32,
    stamp_lock: StampLock,
}

impl VersionList {
    fn new() -> Self {
        let base = Arc::new(VersionEntry::base());
        Self {
            current: RwLock::new(base.clone()),
            oldest_read: Mutex::new(base),
            trimming: AtomicBool::new(false),
            trim_clock: AtomicU32::new(0),
            stamp_lock: StampLock::new(),
        }
    }

    /// Register a reader on the current entry.
    pub(crate) fn get_reader_ticket(&self) -> ReadTicket {
        loop {
            let entry = self.current.read().clone();
            if entry.reader_count.fetch_add(1, Ordering::AcqRel) >= 0 {
                return ReadTicket { entry };
            }
            // The entry was trimmed past while we looked; take a fresh head.
        }
    }

    /// Current stamp without registering a reader. Safe only while an
    /// older ticket already holds the floor for this thread.
    pub(crate) fn untracked_read_stamp(&self) -> u64 {
        self.current.read().stamp()
    }

    /// Global mutual exclusion around `new_version` + validation.
    pub(crate) fn lock_stamp(&self) -> StampGuard<'_> {
        self.stamp_lock.lock()
    }

    /// Allocate a write stamp for the given enlistments, waiting out any
    /// conflicting predecessor still in `Checking`.
    pub(crate) fn new_version(
        &self,
        enlisted: IdSet,
        comm_enlisted: Option<IdSet>,
    ) -> WriteTicket {
        let entry = Arc::new(VersionEntry::checking(enlisted, comm_enlisted));
        let mut current = self.current.read().clone();
        loop {
            while let Some(later) = current.later.get() {
                if is_conflict(&entry, later) {
                    let backoff = Backoff::new();
                    while later.state() == EntryState::Checking {
                        backoff.snooze();
                    }
                }
                current = later.clone();
            }
            entry.stamp.store(current.stamp() + 1, Ordering::Release);
            if current.later.set(entry.clone()).is_ok() {
                break;
            }
            // Lost the append race; resume the walk from where we stood.
        }
        WriteTicket { entry }
    }

    pub(crate) fn finalize(&self, ticket: &WriteTicket, state: EntryState) {
        *ticket.entry.enlisted.write() = None;
        *ticket.entry.comm_enlisted.write() = None;
        ticket.entry.state.store(state as u8, Ordering::Release);
        self.move_current();
    }

    /// Advance the head past the contiguous run of finalized entries.
    fn move_current(&self) {
        let mut current = self.current.write();
        let mut head = current.clone();
        while let Some(later) = head.later.get() {
            if later.state() == EntryState::Checking {
                break;
            }
            head = later.clone();
        }
        *current = head;
    }

    /// Tick the shared 4-bit clock; every 16th call pays for a trim.
    pub(crate) fn maybe_trim(&self) {
        if self.trim_clock.fetch_add(1, Ordering::Relaxed) & 0xF == 0 {
            self.trim_copies();
        }
    }

    /// Advance `oldest_read` past entries no reader is registered on,
    /// tombstoning their reader counts, and release the superseded
    /// copies of every cell changed along the walk.
    pub(crate) fn trim_copies(&self) {
        if self.trimming.swap(true, Ordering::Acquire) {
            return;
        }
        let mut to_trim: CellSet = cell::new_cell_set();
        let trim_stamp;
        let displaced;
        {
            let mut oldest = self.oldest_read.lock();
            let current = self.current.read().clone();
            let mut old = oldest.clone();
            loop {
                if Arc::ptr_eq(&old, &current) {
                    break;
                }
                let Some(later) = old.later.get() else {
                    break;
                };
                {
                    let changes = later.changes.lock();
                    let Some(cells) = changes.as_ref() else {
                        break;
                    };
                    if old
                        .reader_count
                        .compare_exchange(0, i64::MIN, Ordering::AcqRel, Ordering::Relaxed)
                        .is_err()
                    {
                        break;
                    }
                    to_trim.extend(cells.iter().cloned());
                }
                old = later.clone();
            }
            trim_stamp = old.stamp();
            *old.changes.lock() = None;
            displaced = mem::replace(&mut *oldest, old);
        }
        // Unlink the trimmed prefix iteratively; a plain drop would
        // recurse once per passed entry.
        let mut head = displaced;
        while let Ok(entry) = Arc::try_unwrap(head) {
            match entry.later.into_inner() {
                Some(next) => head = next,
                None => break,
            }
        }
        if !to_trim.is_empty() {
            tracing::trace!(
                up_to = trim_stamp,
                cells = to_trim.len(),
                "trimming superseded copies"
            );
            for cell in &to_trim {
                cell.trim_copies(trim_stamp);
            }
        }
        self.trimming.store(false, Ordering::Release);
    }
}

static LIST: Lazy<VersionList> = Lazy::new(VersionList::new);

pub(crate) fn list() -> &'static VersionList {
    &LIST
}
