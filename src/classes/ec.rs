//! EC: epoch-counter pairs.
//!
//! Epochs are 64-bit integers and order numerically; the hashed key is the
//! epoch in native byte order. The counter is inlined in the record body.
//!
//! With the `ec-tombstone` feature (default) a zero-length update marks the
//! record deleted instead of requiring structural delete, and the ordered
//! [`EcTree::fetch`] skips such records. The record layout keeps the
//! deleted word in both modes so the media format does not fork.

use std::{cmp::Ordering, ptr::NonNull, sync::Arc};

use byteorder::{ByteOrder, NativeEndian};

use super::{ClassId, RecordClass};
use crate::{
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{PersistentId, PmemPool},
    tree::{ProbeOpc, Tree},
};

pub const CLASS_EC: ClassId = ClassId(3);

const EPOCH_SIZE: usize = 8;

const COUNTER_OFF: usize = 0;
const DELETED_OFF: usize = 8;
const REC_SIZE: usize = 16;

fn rec_ptr(pool: &dyn PmemPool, rec: PersistentId) -> Result<NonNull<u8>> {
    pool.resolve(rec)
        .ok_or(Error::IoFailure("unresolvable record id"))
}

fn read_u64(ptr: NonNull<u8>, off: usize) -> u64 {
    NativeEndian::read_u64(unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(off), 8) })
}

fn write_u64(ptr: NonNull<u8>, off: usize, v: u64) {
    NativeEndian::write_u64(
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(off), 8) },
        v,
    );
}

fn counter_len_ok(len: usize) -> bool {
    if cfg!(feature = "ec-tombstone") {
        len == EPOCH_SIZE || len == 0
    } else {
        len == EPOCH_SIZE
    }
}

pub struct EcClass;

impl RecordClass for EcClass {
    fn id(&self) -> ClassId {
        CLASS_EC
    }

    fn name(&self) -> &'static str {
        "ec"
    }

    fn hkey_size(&self) -> usize {
        EPOCH_SIZE
    }

    fn hkey_gen(&self, key: &[u8], hkey: &mut [u8]) -> Result<()> {
        if key.len() != EPOCH_SIZE {
            return Err(Error::Invalid("key is not an epoch"));
        }
        hkey.copy_from_slice(key);
        Ok(())
    }

    fn hkey_cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        NativeEndian::read_u64(a).cmp(&NativeEndian::read_u64(b))
    }

    fn rec_alloc(&self, pool: &dyn PmemPool, key: &[u8], val: &[u8]) -> Result<PersistentId> {
        if key.len() != EPOCH_SIZE || val.len() != EPOCH_SIZE {
            return Err(Error::Invalid("epoch records carry a u64 counter"));
        }
        let rec = pool.zalloc(REC_SIZE)?;
        write_u64(rec_ptr(pool, rec)?, COUNTER_OFF, NativeEndian::read_u64(val));
        Ok(rec)
    }

    fn rec_free(&self, pool: &dyn PmemPool, rec: PersistentId) -> Result<()> {
        pool.free(rec)
    }

    fn rec_fetch(
        &self,
        pool: &dyn PmemPool,
        rec: PersistentId,
        hkey: &[u8],
        key_out: Option<&mut FetchBuf<'_>>,
        val_out: Option<&mut FetchBuf<'_>>,
    ) -> Result<()> {
        if let Some(key_out) = key_out {
            let kptr = NonNull::new(hkey.as_ptr() as *mut u8)
                .ok_or(Error::IoFailure("null hashed key"))?;
            key_out.supply(kptr, EPOCH_SIZE);
        }
        if let Some(val_out) = val_out {
            let ptr = rec_ptr(pool, rec)?;
            if cfg!(feature = "ec-tombstone") && read_u64(ptr, DELETED_OFF) != 0 {
                val_out.supply_empty();
            } else {
                val_out.supply(ptr, EPOCH_SIZE);
            }
        }
        Ok(())
    }

    fn rec_update(&self, pool: &dyn PmemPool, rec: PersistentId, val: &[u8]) -> Result<()> {
        if !counter_len_ok(val.len()) {
            return Err(Error::Invalid("epoch records carry a u64 counter"));
        }
        let ptr = rec_ptr(pool, rec)?;
        pool.tx_add(rec, 0, REC_SIZE)?;
        if val.is_empty() {
            write_u64(ptr, COUNTER_OFF, 0);
            write_u64(ptr, DELETED_OFF, 1);
        } else {
            write_u64(ptr, COUNTER_OFF, NativeEndian::read_u64(val));
            write_u64(ptr, DELETED_OFF, 0);
        }
        Ok(())
    }

    fn rec_string(
        &self,
        pool: &dyn PmemPool,
        rec: PersistentId,
        hkey: &[u8],
        leaf: bool,
    ) -> String {
        let epoch = NativeEndian::read_u64(hkey);
        if !leaf {
            return format!("{epoch}");
        }
        match rec_ptr(pool, rec) {
            Ok(ptr) => format!("{epoch}:{}", read_u64(ptr, COUNTER_OFF)),
            Err(_) => format!("{epoch}:<unresolvable>"),
        }
    }
}

/// Epoch-keyed tree façade.
pub struct EcTree {
    tree: Tree,
}

impl EcTree {
    /// Initializes a caller-provided root descriptor as an EC tree.
    pub fn create(
        feats: u64,
        order: usize,
        pool: Arc<dyn PmemPool>,
        root: NonNull<u8>,
    ) -> Result<Self> {
        Tree::create_inplace(CLASS_EC, feats, order, pool, root).map(|tree| EcTree { tree })
    }

    /// Adopts an existing EC root descriptor.
    pub fn open(root: NonNull<u8>, pool: Arc<dyn PmemPool>) -> Result<Self> {
        Self::from_tree(Tree::open_inplace(root, pool)?)
    }

    /// Wraps an already-open handle, checking the class.
    pub fn from_tree(tree: Tree) -> Result<Self> {
        if tree.class().id() != CLASS_EC {
            return Err(Error::Invalid("not an ec tree"));
        }
        Ok(EcTree { tree })
    }

    /// The underlying engine handle.
    pub fn as_tree(&self) -> &Tree {
        &self.tree
    }

    pub fn update(&self, epoch: u64, counter: u64) -> Result<()> {
        debug!("updating {}:{}", epoch, counter);
        self.tree
            .update(&epoch.to_ne_bytes(), &counter.to_ne_bytes())
            .map_err(|e| {
                error!("failed to update {}: {}", epoch, e);
                e
            })
    }

    /// Marks the record deleted through a zero-length update.
    #[cfg(feature = "ec-tombstone")]
    pub fn tombstone(&self, epoch: u64) -> Result<()> {
        debug!("tombstoning {}", epoch);
        self.tree.update(&epoch.to_ne_bytes(), &[]).map_err(|e| {
            error!("failed to tombstone {}: {}", epoch, e);
            e
        })
    }

    pub fn lookup(&self, epoch: u64) -> Result<u64> {
        let mut buf = [0u8; EPOCH_SIZE];
        let tombstone = {
            let mut val = FetchBuf::copied(&mut buf);
            match self.tree.lookup(&epoch.to_ne_bytes(), &mut val) {
                Ok(()) => val.is_empty(),
                Err(Error::NonExistent) => {
                    debug!("cannot find {}", epoch);
                    return Err(Error::NonExistent);
                }
                Err(e) => {
                    error!("failed to look up {}: {}", epoch, e);
                    return Err(e);
                }
            }
        };
        if tombstone {
            debug!("found deleted {}", epoch);
            return Err(Error::NonExistent);
        }
        Ok(NativeEndian::read_u64(&buf))
    }

    /// Borrows the counter bytes out of persistent memory.
    pub fn lookup_borrow(&self, epoch: u64) -> Result<&[u8]> {
        let (ptr, len) = self.tree.lookup_borrowed(&epoch.to_ne_bytes())?;
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// Structurally removes the record.
    pub fn delete(&self, epoch: u64) -> Result<()> {
        match self.tree.delete(&epoch.to_ne_bytes()) {
            Ok(()) => Ok(()),
            Err(Error::NonExistent) => {
                debug!("cannot find {}", epoch);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to delete {}: {}", epoch, e);
                Err(e)
            }
        }
    }

    /// Ordered fetch: probes with `opc`, then reports the positioned epoch
    /// and counter. Tombstoned records are skipped in the probe's natural
    /// direction; `Eq` on a tombstone is `NonExistent`.
    pub fn fetch(&self, opc: ProbeOpc, epoch_in: Option<u64>) -> Result<(u64, u64)> {
        let key = epoch_in.map(u64::to_ne_bytes);
        let mut iter = self.tree.iter();
        iter.probe(opc, key.as_ref().map(|k| &k[..]))?;
        loop {
            let mut kbuf = [0u8; EPOCH_SIZE];
            let mut vbuf = [0u8; EPOCH_SIZE];
            let vlen = {
                let mut key_out = FetchBuf::copied(&mut kbuf);
                let mut val_out = FetchBuf::copied(&mut vbuf);
                iter.fetch(Some(&mut key_out), Some(&mut val_out))?;
                val_out.len()
            };
            if vlen != 0 {
                return Ok((NativeEndian::read_u64(&kbuf), NativeEndian::read_u64(&vbuf)));
            }
            // Zero-length values only exist in tombstone mode.
            debug!("found deleted record, opc {:?}", opc);
            match opc {
                ProbeOpc::Eq => return Err(Error::NonExistent),
                ProbeOpc::First | ProbeOpc::Ge => iter.next()?,
                ProbeOpc::Last | ProbeOpc::Le => iter.prev()?,
            }
        }
    }
}
