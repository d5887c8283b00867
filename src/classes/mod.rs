//! Record classes and the class registry.
//!
//! A class supplies everything record-specific the engine delegates: hashed
//! key derivation and ordering, optional full-key comparison for collision
//! resolution, and the record body lifecycle. The engine holds a reference
//! to the class descriptor in each open handle; nothing class-specific is
//! ever persisted beyond the class id in the root descriptor.
//!
//! Classes are process state: register them before the first tree is
//! created or opened. The registry seals on first use and registrations are
//! immutable afterwards.

use std::{
    cmp::Ordering,
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{require_work, PersistentId, PmemPool},
    tree::{Tree, ROOT_DESC_SIZE},
};

pub mod ec;
pub mod nv;
pub mod uv;

/// Identifies a record class inside a root descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

/// Largest hashed key any class may use.
pub const MAX_HKEY_SIZE: usize = 16;

/// Record-specific behavior the engine delegates to.
pub trait RecordClass: Send + Sync {
    /// Class identifier persisted in root descriptors.
    fn id(&self) -> ClassId;

    /// Short class name for diagnostics.
    fn name(&self) -> &'static str;

    /// Bytes of hashed key stored per node slot. At most
    /// [`MAX_HKEY_SIZE`].
    fn hkey_size(&self) -> usize;

    /// Derives the hashed key from a logical key, validating the key.
    fn hkey_gen(&self, key: &[u8], hkey: &mut [u8]) -> Result<()>;

    /// Orders two hashed keys.
    fn hkey_cmp(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Orders a stored record against a probe key within an equal-hash run.
    /// Classes whose hashed key is the identity never collide.
    fn key_cmp(&self, pool: &dyn PmemPool, rec: PersistentId, key: &[u8]) -> Result<Ordering> {
        let _ = (pool, rec, key);
        Ok(Ordering::Equal)
    }

    /// Allocates and fills a record body. A failure must leave no partial
    /// allocation behind and must not abort the transaction.
    fn rec_alloc(&self, pool: &dyn PmemPool, key: &[u8], val: &[u8]) -> Result<PersistentId>;

    /// Frees a record body and everything it owns.
    fn rec_free(&self, pool: &dyn PmemPool, rec: PersistentId) -> Result<()>;

    /// Materializes key and/or value per the fetch buffer protocol. `hkey`
    /// is the slot's stored hashed key.
    fn rec_fetch(
        &self,
        pool: &dyn PmemPool,
        rec: PersistentId,
        hkey: &[u8],
        key_out: Option<&mut FetchBuf<'_>>,
        val_out: Option<&mut FetchBuf<'_>>,
    ) -> Result<()>;

    /// Replaces the record's value in place, enrolling every byte range it
    /// overwrites first.
    fn rec_update(&self, pool: &dyn PmemPool, rec: PersistentId, val: &[u8]) -> Result<()>;

    /// Human-readable rendering for diagnostics.
    fn rec_string(&self, pool: &dyn PmemPool, rec: PersistentId, hkey: &[u8], leaf: bool)
        -> String;
}

struct Registry {
    classes: RwLock<Vec<(u32, &'static dyn RecordClass)>>,
    sealed: AtomicBool,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        classes: RwLock::new(Vec::new()),
        sealed: AtomicBool::new(false),
    };
}

/// Registers a class. Fails `Invalid` once the registry is sealed or when
/// the id is taken.
pub fn register(class: Box<dyn RecordClass>) -> Result<()> {
    if REGISTRY.sealed.load(AtomicOrdering::Acquire) {
        return Err(Error::Invalid("class registry is sealed"));
    }
    if class.hkey_size() == 0 || class.hkey_size() > MAX_HKEY_SIZE {
        return Err(Error::Invalid("hashed key size out of range"));
    }
    let mut classes = REGISTRY.classes.write();
    if classes.iter().any(|(id, _)| *id == class.id().0) {
        return Err(Error::Invalid("class id already registered"));
    }
    // Registrations live for the rest of the process.
    classes.push((class.id().0, Box::leak(class)));
    Ok(())
}

/// Registers the built-in NV, UV and EC classes. Idempotent; concurrent
/// callers block until the first registration completes.
pub fn register_builtin() -> Result<()> {
    static BUILTIN: std::sync::Once = std::sync::Once::new();
    let mut result = Ok(());
    BUILTIN.call_once(|| {
        result = (|| {
            register(Box::new(nv::NvClass))?;
            register(Box::new(uv::UvClass))?;
            register(Box::new(ec::EcClass))
        })();
    });
    result
}

/// Resolves a class id. The first successful resolution seals the registry.
pub(crate) fn class_for(id: ClassId) -> Result<&'static dyn RecordClass> {
    let class = REGISTRY
        .classes
        .read()
        .iter()
        .find(|(cid, _)| *cid == id.0)
        .map(|(_, class)| *class)
        .ok_or(Error::Invalid("unknown tree class"))?;
    REGISTRY.sealed.store(true, AtomicOrdering::Release);
    Ok(class)
}

/// Creates a nested tree as the value of `key` in `parent`.
///
/// Inside the caller's transaction: inserts a record holding a zeroed root
/// descriptor, borrows a pointer to the stored bytes and initializes the
/// child tree in place. Returns the open child handle when `want_handle` is
/// set, otherwise closes it immediately.
pub fn create_tree_at(
    parent: &Tree,
    key: &[u8],
    class: ClassId,
    feats: u64,
    order: usize,
    want_handle: bool,
) -> Result<Option<Tree>> {
    require_work(&**parent.pool())?;
    let desc = [0u8; ROOT_DESC_SIZE];
    parent.update(key, &desc)?;
    let (ptr, len) = parent.lookup_borrowed(key)?;
    if len != ROOT_DESC_SIZE {
        return Err(Error::Invalid("parent value is not a root descriptor"));
    }
    let child = Tree::create_inplace(class, feats, order, parent.pool().clone(), ptr)?;
    Ok(if want_handle { Some(child) } else { None })
}

/// Opens the nested tree stored as the value of `key` in `parent`. Fails
/// `NonExistent` when no such record exists.
pub fn open_tree_at(parent: &Tree, key: &[u8]) -> Result<Tree> {
    let (ptr, len) = parent.lookup_borrowed(key)?;
    if len != ROOT_DESC_SIZE {
        return Err(Error::Invalid("parent value is not a root descriptor"));
    }
    Tree::open_inplace(ptr, parent.pool().clone())
}

/// Destroys the nested tree stored as the value of `key` in `parent` and
/// deletes the parent record, atomically.
pub fn destroy_tree_at(parent: &Tree, key: &[u8]) -> Result<()> {
    let child = open_tree_at(parent, key)?;
    let pool = parent.pool().clone();
    pool.tx_begin()?;
    let mut child = Some(child);
    let r = (|| {
        // Destroy must precede the parent-record delete: the descriptor's
        // bytes are enrolled before the delete frees their storage.
        child.take().ok_or(Error::NoHandle)?.destroy()?;
        parent.delete(key)
    })();
    if let Err(e) = r {
        pool.tx_abort(e);
        // An undestroyed child is merely closed on unwind.
        drop(child.take());
    }
    pool.tx_commit()
}
