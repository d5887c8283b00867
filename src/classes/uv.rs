//! UV: UUID-value pairs.
//!
//! The hashed key is the UUID itself, so slots order by UUID byte order and
//! no full-key comparison is needed. Values are variable-size blobs
//! allocated separately from the record head, exactly as in the NV class.
//!
//! Record head layout: `{value_pid: u64, value_size: u64,
//! value_buf_size: u64}`.

use std::{cmp::Ordering, ptr::NonNull, sync::Arc};

use byteorder::{ByteOrder, NativeEndian};
use uuid::Uuid;

use super::{ClassId, RecordClass};
use crate::{
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{PersistentId, PmemPool},
    tree::Tree,
};

pub const CLASS_UV: ClassId = ClassId(2);

const UUID_SIZE: usize = 16;

const VALUE_PID_OFF: usize = 0;
const VALUE_SIZE_OFF: usize = 8;
const VALUE_BUF_SIZE_OFF: usize = 16;
const HEAD_SIZE: usize = 24;

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

pub struct UvClass;

impl RecordClass for UvClass {
    fn id(&self) -> ClassId {
        CLASS_UV
    }

    fn name(&self) -> &'static str {
        "uv"
    }

    fn hkey_size(&self) -> usize {
        UUID_SIZE
    }

    fn hkey_gen(&self, key: &[u8], hkey: &mut [u8]) -> Result<()> {
        if key.len() != UUID_SIZE {
            return Err(Error::Invalid("key is not a uuid"));
        }
        hkey.copy_from_slice(key);
        Ok(())
    }

    fn hkey_cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn rec_alloc(&self, pool: &dyn PmemPool, key: &[u8], val: &[u8]) -> Result<PersistentId> {
        if key.len() != UUID_SIZE {
            return Err(Error::Invalid("key is not a uuid"));
        }
        if val.is_empty() {
            return Err(Error::Invalid("empty value"));
        }
        let rec = pool.zalloc(HEAD_SIZE)?;
        let value = match pool.alloc(val.len()) {
            Ok(value) => value,
            Err(e) => {
                pool.free(rec)?;
                return Err(e);
            }
        };
        let vptr = rec_ptr(pool, value)?;
        unsafe { std::ptr::copy_nonoverlapping(val.as_ptr(), vptr.as_ptr(), val.len()) };
        let ptr = rec_ptr(pool, rec)?;
        write_u64(ptr, VALUE_PID_OFF, value.to_raw());
        write_u64(ptr, VALUE_SIZE_OFF, val.len() as u64);
        write_u64(ptr, VALUE_BUF_SIZE_OFF, val.len() as u64);
        Ok(rec)
    }

    fn rec_free(&self, pool: &dyn PmemPool, rec: PersistentId) -> Result<()> {
        let ptr = rec_ptr(pool, rec)?;
        pool.free(PersistentId::from_raw(read_u64(ptr, VALUE_PID_OFF)))?;
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
            // The stored hashed key is the UUID.
            let kptr = NonNull::new(hkey.as_ptr() as *mut u8)
                .ok_or(Error::IoFailure("null hashed key"))?;
            key_out.supply(kptr, UUID_SIZE);
        }
        if let Some(val_out) = val_out {
            let ptr = rec_ptr(pool, rec)?;
            let value = PersistentId::from_raw(read_u64(ptr, VALUE_PID_OFF));
            let vptr = rec_ptr(pool, value)?;
            val_out.supply(vptr, read_u64(ptr, VALUE_SIZE_OFF) as usize);
        }
        Ok(())
    }

    fn rec_update(&self, pool: &dyn PmemPool, rec: PersistentId, val: &[u8]) -> Result<()> {
        if val.is_empty() {
            return Err(Error::Invalid("empty value"));
        }
        let ptr = rec_ptr(pool, rec)?;
        pool.tx_add(rec, 0, HEAD_SIZE)?;
        let mut value = PersistentId::from_raw(read_u64(ptr, VALUE_PID_OFF));
        if (read_u64(ptr, VALUE_BUF_SIZE_OFF) as usize) < val.len() {
            let grown = pool.alloc(val.len())?;
            pool.free(value)?;
            value = grown;
            write_u64(ptr, VALUE_PID_OFF, value.to_raw());
            write_u64(ptr, VALUE_BUF_SIZE_OFF, val.len() as u64);
        } else {
            pool.tx_add(value, 0, val.len())?;
        }
        let vptr = rec_ptr(pool, value)?;
        unsafe { std::ptr::copy_nonoverlapping(val.as_ptr(), vptr.as_ptr(), val.len()) };
        write_u64(ptr, VALUE_SIZE_OFF, val.len() as u64);
        Ok(())
    }

    fn rec_string(
        &self,
        pool: &dyn PmemPool,
        rec: PersistentId,
        hkey: &[u8],
        leaf: bool,
    ) -> String {
        let uuid = Uuid::from_slice(hkey).unwrap_or(Uuid::nil());
        if !leaf {
            return format!("{uuid}");
        }
        match rec_ptr(pool, rec) {
            Ok(ptr) => format!(
                "{uuid}:{}({})",
                read_u64(ptr, VALUE_SIZE_OFF),
                read_u64(ptr, VALUE_BUF_SIZE_OFF),
            ),
            Err(_) => format!("{uuid}:<unresolvable>"),
        }
    }
}

/// UUID-keyed tree façade.
pub struct UvTree {
    tree: Tree,
}

impl UvTree {
    /// Initializes a caller-provided root descriptor as a UV tree.
    pub fn create(
        feats: u64,
        order: usize,
        pool: Arc<dyn PmemPool>,
        root: NonNull<u8>,
    ) -> Result<Self> {
        Tree::create_inplace(CLASS_UV, feats, order, pool, root).map(|tree| UvTree { tree })
    }

    /// Adopts an existing UV root descriptor.
    pub fn open(root: NonNull<u8>, pool: Arc<dyn PmemPool>) -> Result<Self> {
        Self::from_tree(Tree::open_inplace(root, pool)?)
    }

    /// Wraps an already-open handle, checking the class.
    pub fn from_tree(tree: Tree) -> Result<Self> {
        if tree.class().id() != CLASS_UV {
            return Err(Error::Invalid("not a uv tree"));
        }
        Ok(UvTree { tree })
    }

    /// The underlying engine handle.
    pub fn as_tree(&self) -> &Tree {
        &self.tree
    }

    pub fn update(&self, uuid: &Uuid, value: &[u8]) -> Result<()> {
        self.tree.update(uuid.as_bytes(), value).map_err(|e| {
            error!("failed to update {}: {}", uuid, e);
            e
        })
    }

    /// Copies the value into `buf`, returning its actual length.
    pub fn lookup(&self, uuid: &Uuid, buf: &mut [u8]) -> Result<usize> {
        let mut val = FetchBuf::copied(buf);
        match self.tree.lookup(uuid.as_bytes(), &mut val) {
            Ok(()) => Ok(val.len()),
            Err(Error::NonExistent) => {
                debug!("cannot find {}", uuid);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to look up {}: {}", uuid, e);
                Err(e)
            }
        }
    }

    /// Borrows the value bytes out of persistent memory instead of copying.
    pub fn lookup_borrow(&self, uuid: &Uuid) -> Result<&[u8]> {
        let (ptr, len) = self.tree.lookup_borrowed(uuid.as_bytes())?;
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    pub fn delete(&self, uuid: &Uuid) -> Result<()> {
        match self.tree.delete(uuid.as_bytes()) {
            Ok(()) => Ok(()),
            Err(Error::NonExistent) => {
                debug!("cannot find {}", uuid);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to delete {}: {}", uuid, e);
                Err(e)
            }
        }
    }

    /// Creates a nested tree as the value of `uuid`.
    pub fn create_tree(
        &self,
        uuid: &Uuid,
        class: ClassId,
        feats: u64,
        order: usize,
        want_handle: bool,
    ) -> Result<Option<Tree>> {
        super::create_tree_at(&self.tree, uuid.as_bytes(), class, feats, order, want_handle)
            .map_err(|e| {
                error!("failed to create {}: {}", uuid, e);
                e
            })
    }

    pub fn open_tree(&self, uuid: &Uuid) -> Result<Tree> {
        super::open_tree_at(&self.tree, uuid.as_bytes())
    }

    pub fn destroy_tree(&self, uuid: &Uuid) -> Result<()> {
        super::destroy_tree_at(&self.tree, uuid.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classes::register_builtin,
        pmem::{transaction, VolatilePool},
        tree::ROOT_DESC_SIZE,
    };

    fn uv_tree() -> (Arc<VolatilePool>, UvTree) {
        register_builtin().unwrap();
        let pool = Arc::new(VolatilePool::new());
        let root = transaction(&*pool, || pool.alloc(ROOT_DESC_SIZE)).unwrap();
        let ptr = pool.resolve(root).unwrap();
        let tree = transaction(&*pool, || UvTree::create(0, 4, pool.clone(), ptr)).unwrap();
        (pool, tree)
    }

    fn uuid(tail: u8) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[15] = tail;
        Uuid::from_bytes(bytes)
    }

    #[test]
    fn round_trip_and_isolation() {
        let (pool, tree) = uv_tree();
        transaction(&*pool, || {
            tree.update(&uuid(1), &[0x11; 4])?;
            tree.update(&uuid(2), &[0x22; 4])?;
            tree.update(&uuid(3), &[0x33; 4])
        })
        .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(tree.lookup(&uuid(2), &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x22; 4]);

        transaction(&*pool, || tree.delete(&uuid(2))).unwrap();
        assert_eq!(
            tree.lookup(&uuid(2), &mut buf).unwrap_err(),
            Error::NonExistent
        );
        assert_eq!(tree.lookup(&uuid(1), &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x11; 4]);
        assert_eq!(tree.lookup(&uuid(3), &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x33; 4]);
    }

    #[test]
    fn short_keys_are_invalid() {
        let (pool, tree) = uv_tree();
        let err =
            transaction(&*pool, || tree.as_tree().update(&[0u8; 8], &[1])).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn borrow_lookup_sees_persistent_bytes() {
        let (pool, tree) = uv_tree();
        transaction(&*pool, || tree.update(&uuid(7), b"payload")).unwrap();
        let bytes = tree.lookup_borrow(&uuid(7)).unwrap();
        assert_eq!(bytes, b"payload");
    }
}
