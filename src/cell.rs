use crate::version::WriteTicket;
use foldhash::fast::FixedState;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The capability set the runtime requires of every shielded cell.
///
/// The runtime never inspects cell contents; it only drives this
/// interface during commit validation, installation, rollback and
/// trimming. Cells
/// keep their buffered transactional state in the current thread's
/// transaction context and identify themselves by reference identity.
pub trait Shieldable: Send + Sync + 'static {
    /// Does this cell hold a buffered write in the current context?
    fn has_changes(&self) -> bool;

    /// Validate against the proposed write stamp. Succeeds iff no
    /// concurrent committer installed a newer version of this cell since
    /// the current read stamp and the cell accepts the ticket's stamp.
    /// Must be side-effect-free on failure.
    fn can_commit(&self, ticket: &WriteTicket) -> bool;

    /// Install the buffered write as the newest version, tagged with the
    /// context's write stamp. A no-op for cells without changes.
    fn commit(&self);

    /// Discard the buffered write.
    fn rollback(&self);

    /// Drop historical versions whose validity ends at or before `up_to`.
    fn trim_copies(&self, up_to: u64);
}

/// Shared handle to a shielded cell, keyed by pointer identity.
///
/// Two `CellRef`s compare equal iff they refer to the same cell
/// allocation, which makes them usable as set keys throughout the
/// engine.
#[derive(Clone)]
pub struct CellRef(Arc<dyn Shieldable>);

impl CellRef {
    /// Wrap a cell into an identity-keyed handle.
    pub fn new(cell: Arc<dyn Shieldable>) -> Self {
        Self(cell)
    }

    /// Stable identity of the underlying cell allocation.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.0.has_changes()
    }

    pub(crate) fn can_commit(&self, ticket: &WriteTicket) -> bool {
        self.0.can_commit(ticket)
    }

    pub(crate) fn commit(&self) {
        self.0.commit();
    }

    pub(crate) fn rollback(&self) {
        self.0.rollback();
    }

    pub(crate) fn trim_copies(&self, up_to: u64) {
        self.0.trim_copies(up_to);
    }
}

impl PartialEq for CellRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for CellRef {}

impl Hash for CellRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({:#x})", self.id())
    }
}

pub(crate) type CellSet = HashSet<CellRef, FixedState>;
pub(crate) type IdSet = HashSet<usize, FixedState>;
pub(crate) type LocalMap = HashMap<usize, Box<dyn std::any::Any>, FixedState>;

pub(crate) fn new_cell_set() -> CellSet {
    HashSet::with_hasher(FixedState::default())
}

pub(crate) fn new_id_set() -> IdSet {
    HashSet::with_hasher(FixedState::default())
}

pub(crate) fn new_local_map() -> LocalMap {
    HashMap::with_hasher(FixedState::default())
}
