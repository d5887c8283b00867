//! Volatile reference implementation of the pool interface.
//!
//! Backs every allocation with a boxed heap buffer so resolved addresses
//! stay stable, and implements the full transaction discipline: an undo log
//! of snapshotted byte ranges, allocation withdrawal and deferred frees.
//! This is the pool the test suite runs against; it also exposes allocation
//! statistics so destroy completeness is observable.

use std::{collections::HashMap, ptr::NonNull};

use parking_lot::Mutex;

use super::{PersistentId, PmemPool, TxStage};
use crate::error::{Error, Result};

/// Allocation counters of a [`VolatilePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Allocations currently live (committed view).
    pub live_allocations: usize,
    /// Total allocations ever made, including rolled-back ones.
    pub allocs_total: usize,
    /// Total frees ever committed.
    pub frees_total: usize,
}

enum UndoEntry {
    Range {
        id: u64,
        offset: usize,
        saved: Box<[u8]>,
    },
    Raw {
        ptr: *mut u8,
        saved: Box<[u8]>,
    },
}

#[derive(Default)]
struct TxState {
    depth: usize,
    aborted: Option<Error>,
    undo: Vec<UndoEntry>,
    tx_allocs: Vec<u64>,
    pending_frees: Vec<u64>,
}

struct Inner {
    next_id: u64,
    allocations: HashMap<u64, Box<[u8]>>,
    used: usize,
    capacity: Option<usize>,
    tx: TxState,
    stats: PoolStats,
}

/// In-memory pool with undo-logged transactions.
pub struct VolatilePool {
    inner: Mutex<Inner>,
}

// Raw undo pointers target boxed buffers owned by the same Inner; they are
// only dereferenced under the lock.
unsafe impl Send for VolatilePool {}
unsafe impl Sync for VolatilePool {}

impl VolatilePool {
    /// A pool without an allocation limit.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A pool that fails allocations once `limit` bytes are in use.
    pub fn with_limit(limit: usize) -> Self {
        Self::with_capacity(Some(limit))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        VolatilePool {
            inner: Mutex::new(Inner {
                next_id: 1,
                allocations: HashMap::new(),
                used: 0,
                capacity,
                tx: TxState::default(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Current allocation counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats;
        stats.live_allocations = inner.allocations.len();
        stats
    }

    // Fresh buffers are zeroed either way, alloc and zalloc only differ on
    // pmem-backed pools.
    fn alloc_impl(&self, size: usize) -> Result<PersistentId> {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 || inner.tx.aborted.is_some() {
            return Err(Error::StageViolation);
        }
        if size == 0 {
            return Err(Error::Invalid("zero-size allocation"));
        }
        if let Some(limit) = inner.capacity {
            if inner.used + size > limit {
                return Err(Error::OutOfMemory);
            }
        }
        let buf = vec![0u8; size];
        let id = inner.next_id;
        inner.next_id += 1;
        inner.allocations.insert(id, buf.into_boxed_slice());
        inner.used += size;
        inner.stats.allocs_total += 1;
        inner.tx.tx_allocs.push(id);
        Ok(PersistentId::from_raw(id))
    }

    fn rollback(inner: &mut Inner) {
        trace!("rolling back transaction, {} undo entries", inner.tx.undo.len());
        while let Some(entry) = inner.tx.undo.pop() {
            match entry {
                UndoEntry::Range { id, offset, saved } => {
                    if let Some(buf) = inner.allocations.get_mut(&id) {
                        buf[offset..offset + saved.len()].copy_from_slice(&saved);
                    }
                }
                UndoEntry::Raw { ptr, saved } => unsafe {
                    std::ptr::copy_nonoverlapping(saved.as_ptr(), ptr, saved.len());
                },
            }
        }
        let withdraw: Vec<u64> = inner.tx.tx_allocs.drain(..).collect();
        for id in withdraw {
            if let Some(buf) = inner.allocations.remove(&id) {
                inner.used -= buf.len();
            }
        }
        inner.tx.pending_frees.clear();
    }

    fn apply(inner: &mut Inner) {
        let frees: Vec<u64> = inner.tx.pending_frees.drain(..).collect();
        for id in frees {
            if let Some(buf) = inner.allocations.remove(&id) {
                inner.used -= buf.len();
                inner.stats.frees_total += 1;
            }
        }
        inner.tx.undo.clear();
        inner.tx.tx_allocs.clear();
    }
}

impl Default for VolatilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemPool for VolatilePool {
    fn tx_begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.tx.depth += 1;
        Ok(())
    }

    fn tx_commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 {
            return Err(Error::StageViolation);
        }
        inner.tx.depth -= 1;
        if inner.tx.depth > 0 {
            // Inner commits of an aborted transaction keep propagating the
            // abort outwards.
            return match &inner.tx.aborted {
                Some(reason) => Err(reason.clone()),
                None => Ok(()),
            };
        }
        match inner.tx.aborted.take() {
            Some(reason) => {
                Self::rollback(&mut inner);
                Err(reason)
            }
            None => {
                Self::apply(&mut inner);
                Ok(())
            }
        }
    }

    fn tx_abort(&self, reason: Error) {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 {
            return;
        }
        if inner.tx.aborted.is_none() {
            inner.tx.aborted = Some(reason);
        }
    }

    fn tx_stage(&self) -> TxStage {
        let inner = self.inner.lock();
        if inner.tx.depth == 0 {
            TxStage::None
        } else if inner.tx.aborted.is_some() {
            TxStage::Aborted
        } else {
            TxStage::Work
        }
    }

    fn alloc(&self, size: usize) -> Result<PersistentId> {
        self.alloc_impl(size)
    }

    fn zalloc(&self, size: usize) -> Result<PersistentId> {
        self.alloc_impl(size)
    }

    fn free(&self, id: PersistentId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 || inner.tx.aborted.is_some() {
            return Err(Error::StageViolation);
        }
        if !inner.allocations.contains_key(&id.to_raw()) {
            return Err(Error::Invalid("free of unknown id"));
        }
        // Freeing an allocation made in this very transaction takes effect
        // either way; keep the bookkeeping on one path.
        inner.tx.pending_frees.push(id.to_raw());
        Ok(())
    }

    fn resolve(&self, id: PersistentId) -> Option<NonNull<u8>> {
        let inner = self.inner.lock();
        inner
            .allocations
            .get(&id.to_raw())
            .map(|buf| NonNull::new(buf.as_ptr() as *mut u8).unwrap())
    }

    fn tx_add(&self, id: PersistentId, offset: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 || inner.tx.aborted.is_some() {
            return Err(Error::StageViolation);
        }
        let buf = inner
            .allocations
            .get(&id.to_raw())
            .ok_or(Error::Invalid("tx_add of unknown id"))?;
        if offset + len > buf.len() {
            return Err(Error::Invalid("tx_add range out of bounds"));
        }
        let saved = buf[offset..offset + len].to_vec().into_boxed_slice();
        inner.tx.undo.push(UndoEntry::Range {
            id: id.to_raw(),
            offset,
            saved,
        });
        Ok(())
    }

    fn tx_add_ptr(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tx.depth == 0 || inner.tx.aborted.is_some() {
            return Err(Error::StageViolation);
        }
        let saved =
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec().into_boxed_slice();
        inner.tx.undo.push(UndoEntry::Raw {
            ptr: ptr.as_ptr(),
            saved,
        });
        Ok(())
    }
}
