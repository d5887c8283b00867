//! Persistent memory manager interface.
//!
//! The tree engine never owns storage itself; it consumes a pool through
//! [`PmemPool`]. A pool hands out [`PersistentId`]s, translates them to
//! transient addresses on demand and offers undo-logged transactions. Every
//! mutation of persistent bytes must happen inside a work-stage transaction
//! and must enroll the affected range first (`tx_add`/`tx_add_ptr`).
//!
//! Transactions nest by depth counting. `tx_abort` marks the outermost
//! transaction aborted; the outermost `tx_commit` of an aborted transaction
//! replays the undo log, withdraws transaction-scoped allocations, cancels
//! deferred frees and surfaces the recorded abort reason as its error.

use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pool-relative reference to an allocated persistent object.
///
/// Ids are cheap to copy and are what node slots and record heads persist;
/// a transient address is only ever obtained through [`PmemPool::resolve`]
/// and never written back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PersistentId(u64);

impl PersistentId {
    /// The null id. Allocation failure and empty tree roots are expressed
    /// with it.
    pub const NULL: PersistentId = PersistentId(0);

    /// Returns true iff this is the null id.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        PersistentId(raw)
    }

    pub(crate) fn to_raw(self) -> u64 {
        self.0
    }
}

/// Stage of the current transaction, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// No transaction is active.
    None,
    /// A transaction is active and accepts mutations.
    Work,
    /// The active transaction has been aborted and unwinds on commit.
    Aborted,
}

/// The persistent memory manager consumed by the tree engine.
///
/// Object safe; tree handles carry an `Arc<dyn PmemPool>`. The pool's
/// allocator is assumed thread-safe at pool granularity, the engine adds no
/// locking of its own.
pub trait PmemPool: Send + Sync {
    /// Opens a (possibly nested) transaction.
    fn tx_begin(&self) -> Result<()>;

    /// Closes the innermost transaction. The outermost commit of an aborted
    /// transaction performs the rollback and returns the abort reason.
    fn tx_commit(&self) -> Result<()>;

    /// Aborts the whole outermost transaction with the given reason.
    fn tx_abort(&self, reason: Error);

    /// Reports the stage of the current transaction.
    fn tx_stage(&self) -> TxStage;

    /// Allocates `size` bytes. Work stage only.
    fn alloc(&self, size: usize) -> Result<PersistentId>;

    /// Allocates `size` zeroed bytes. Work stage only.
    fn zalloc(&self, size: usize) -> Result<PersistentId>;

    /// Frees an allocation. Work stage only; the free is deferred to commit
    /// so an abort can cancel it.
    fn free(&self, id: PersistentId) -> Result<()>;

    /// Translates an id to a transient address. The address is stable for
    /// the life of the pool mapping.
    fn resolve(&self, id: PersistentId) -> Option<NonNull<u8>>;

    /// Enrolls `len` bytes at `offset` inside the allocation `id` in the
    /// undo log of the current transaction. Must precede any overwrite.
    fn tx_add(&self, id: PersistentId, offset: usize, len: usize) -> Result<()>;

    /// Enrolls `len` bytes at a resolved address in the undo log. Used for
    /// objects reached by pointer only, such as an in-place root descriptor.
    fn tx_add_ptr(&self, ptr: NonNull<u8>, len: usize) -> Result<()>;
}

/// Fails with [`Error::StageViolation`] unless a work-stage transaction is
/// active.
pub fn require_work(pool: &dyn PmemPool) -> Result<()> {
    match pool.tx_stage() {
        TxStage::Work => Ok(()),
        _ => Err(Error::StageViolation),
    }
}

/// Runs `f` inside a transaction; aborts on error.
///
/// The scoped shape callers use when they have no surrounding transaction of
/// their own. On `Err` the transaction is aborted and the abort reason is
/// returned.
pub fn transaction<T>(pool: &dyn PmemPool, f: impl FnOnce() -> Result<T>) -> Result<T> {
    pool.tx_begin()?;
    match f() {
        Ok(v) => {
            pool.tx_commit()?;
            Ok(v)
        }
        Err(e) => {
            pool.tx_abort(e.clone());
            match pool.tx_commit() {
                Err(reason) => Err(reason),
                Ok(()) => Err(e),
            }
        }
    }
}

pub mod volatile;

pub use volatile::{PoolStats, VolatilePool};
