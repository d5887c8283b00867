//! NV: name-value pairs.
//!
//! A name is a variable-length, NUL-terminated string; a value is a
//! variable-size blob allocated separately from the record head. Names are
//! unordered: node order is the 32-bit name hash, exact matches within a
//! hash bucket are resolved by byte-wise name comparison.
//!
//! Record head layout: `{value_pid: u64, value_size: u64,
//! value_buf_size: u64, name_size: u64, name: [u8; name_size]}` with
//! `name_size == strlen(name) + 1`.

use std::{cmp::Ordering, hash::Hasher, ptr::NonNull, sync::Arc};

use byteorder::{ByteOrder, NativeEndian};
use twox_hash::XxHash32;

use super::{ClassId, RecordClass};
use crate::{
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{PersistentId, PmemPool},
    tree::Tree,
};

pub const CLASS_NV: ClassId = ClassId(1);

const VALUE_PID_OFF: usize = 0;
const VALUE_SIZE_OFF: usize = 8;
const VALUE_BUF_SIZE_OFF: usize = 16;
const NAME_SIZE_OFF: usize = 24;
const NAME_OFF: usize = 32;
// The fields rec_update may overwrite.
const HEAD_MUT_LEN: usize = 24;

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

fn write_bytes(ptr: NonNull<u8>, off: usize, src: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr().add(off), src.len());
    }
}

// Name bytes without the terminator, or Invalid when no NUL is embedded
// within the declared key length.
fn name_of(key: &[u8]) -> Result<&[u8]> {
    if key.is_empty() {
        return Err(Error::Invalid("empty name key"));
    }
    match key.iter().position(|&b| b == 0) {
        Some(n) => Ok(&key[..n]),
        None => Err(Error::Invalid("name key is not NUL-terminated")),
    }
}

fn name_hash(name: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(name);
    hasher.finish() as u32
}

pub struct NvClass;

impl RecordClass for NvClass {
    fn id(&self) -> ClassId {
        CLASS_NV
    }

    fn name(&self) -> &'static str {
        "nv"
    }

    fn hkey_size(&self) -> usize {
        4
    }

    fn hkey_gen(&self, key: &[u8], hkey: &mut [u8]) -> Result<()> {
        let name = name_of(key)?;
        NativeEndian::write_u32(hkey, name_hash(name));
        Ok(())
    }

    fn hkey_cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        NativeEndian::read_u32(a).cmp(&NativeEndian::read_u32(b))
    }

    fn key_cmp(&self, pool: &dyn PmemPool, rec: PersistentId, key: &[u8]) -> Result<Ordering> {
        let ptr = rec_ptr(pool, rec)?;
        let name_size = read_u64(ptr, NAME_SIZE_OFF) as usize;
        let stored = unsafe {
            std::slice::from_raw_parts(ptr.as_ptr().add(NAME_OFF), name_size - 1)
        };
        Ok(stored.cmp(name_of(key)?))
    }

    fn rec_alloc(&self, pool: &dyn PmemPool, key: &[u8], val: &[u8]) -> Result<PersistentId> {
        let name = name_of(key)?;
        if val.is_empty() {
            return Err(Error::Invalid("empty value"));
        }
        let rec = pool.zalloc(NAME_OFF + name.len() + 1)?;
        let value = match pool.alloc(val.len()) {
            Ok(value) => value,
            Err(e) => {
                // Leave no partial record behind.
                pool.free(rec)?;
                return Err(e);
            }
        };
        let vptr = rec_ptr(pool, value)?;
        write_bytes(vptr, 0, val);
        let ptr = rec_ptr(pool, rec)?;
        write_u64(ptr, VALUE_PID_OFF, value.to_raw());
        write_u64(ptr, VALUE_SIZE_OFF, val.len() as u64);
        write_u64(ptr, VALUE_BUF_SIZE_OFF, val.len() as u64);
        write_u64(ptr, NAME_SIZE_OFF, (name.len() + 1) as u64);
        write_bytes(ptr, NAME_OFF, name);
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
        _hkey: &[u8],
        key_out: Option<&mut FetchBuf<'_>>,
        val_out: Option<&mut FetchBuf<'_>>,
    ) -> Result<()> {
        let ptr = rec_ptr(pool, rec)?;
        if let Some(key_out) = key_out {
            let name_size = read_u64(ptr, NAME_SIZE_OFF) as usize;
            let name = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(NAME_OFF)) };
            key_out.supply(name, name_size);
        }
        if let Some(val_out) = val_out {
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
        pool.tx_add(rec, 0, HEAD_MUT_LEN)?;
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
        write_bytes(rec_ptr(pool, value)?, 0, val);
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
        if !leaf {
            return format!("{}", NativeEndian::read_u32(hkey));
        }
        match rec_ptr(pool, rec) {
            Ok(ptr) => {
                let name_size = read_u64(ptr, NAME_SIZE_OFF) as usize;
                let name = unsafe {
                    std::slice::from_raw_parts(ptr.as_ptr().add(NAME_OFF), name_size - 1)
                };
                format!(
                    "\"{}\":{}({})",
                    String::from_utf8_lossy(name),
                    read_u64(ptr, VALUE_SIZE_OFF),
                    read_u64(ptr, VALUE_BUF_SIZE_OFF),
                )
            }
            Err(_) => "<unresolvable>".to_string(),
        }
    }
}

/// Name-keyed tree façade.
pub struct NvTree {
    tree: Tree,
}

fn key_of(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

impl NvTree {
    /// Initializes a caller-provided root descriptor as an NV tree.
    pub fn create(
        feats: u64,
        order: usize,
        pool: Arc<dyn PmemPool>,
        root: NonNull<u8>,
    ) -> Result<Self> {
        Tree::create_inplace(CLASS_NV, feats, order, pool, root).map(|tree| NvTree { tree })
    }

    /// Adopts an existing NV root descriptor.
    pub fn open(root: NonNull<u8>, pool: Arc<dyn PmemPool>) -> Result<Self> {
        Self::from_tree(Tree::open_inplace(root, pool)?)
    }

    /// Wraps an already-open handle, checking the class.
    pub fn from_tree(tree: Tree) -> Result<Self> {
        if tree.class().id() != CLASS_NV {
            return Err(Error::Invalid("not an nv tree"));
        }
        Ok(NvTree { tree })
    }

    /// The underlying engine handle.
    pub fn as_tree(&self) -> &Tree {
        &self.tree
    }

    pub fn update(&self, name: &str, value: &[u8]) -> Result<()> {
        debug!("updating \"{}\", {} bytes", name, value.len());
        self.tree.update(&key_of(name), value).map_err(|e| {
            error!("failed to update \"{}\": {}", name, e);
            e
        })
    }

    /// Copies the value into `buf`, returning its actual length.
    pub fn lookup(&self, name: &str, buf: &mut [u8]) -> Result<usize> {
        let mut val = FetchBuf::copied(buf);
        match self.tree.lookup(&key_of(name), &mut val) {
            Ok(()) => Ok(val.len()),
            Err(Error::NonExistent) => {
                debug!("cannot find \"{}\"", name);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to look up \"{}\": {}", name, e);
                Err(e)
            }
        }
    }

    /// Borrows the value bytes out of persistent memory instead of copying.
    /// The slice stays valid for the life of the pool mapping and the
    /// surrounding transaction.
    pub fn lookup_borrow(&self, name: &str) -> Result<&[u8]> {
        let (ptr, len) = self.tree.lookup_borrowed(&key_of(name))?;
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        debug!("deleting \"{}\"", name);
        match self.tree.delete(&key_of(name)) {
            Ok(()) => Ok(()),
            Err(Error::NonExistent) => {
                debug!("cannot find \"{}\"", name);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to delete \"{}\": {}", name, e);
                Err(e)
            }
        }
    }

    /// Creates a nested tree as the value of `name`. See
    /// [`super::create_tree_at`].
    pub fn create_tree(
        &self,
        name: &str,
        class: ClassId,
        feats: u64,
        order: usize,
        want_handle: bool,
    ) -> Result<Option<Tree>> {
        super::create_tree_at(&self.tree, &key_of(name), class, feats, order, want_handle)
            .map_err(|e| {
                error!("failed to create \"{}\": {}", name, e);
                e
            })
    }

    pub fn open_tree(&self, name: &str) -> Result<Tree> {
        match super::open_tree_at(&self.tree, &key_of(name)) {
            Ok(tree) => Ok(tree),
            Err(Error::NonExistent) => {
                debug!("cannot find \"{}\"", name);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to open \"{}\": {}", name, e);
                Err(e)
            }
        }
    }

    pub fn destroy_tree(&self, name: &str) -> Result<()> {
        match super::destroy_tree_at(&self.tree, &key_of(name)) {
            Ok(()) => Ok(()),
            Err(Error::NonExistent) => {
                debug!("cannot find \"{}\"", name);
                Err(Error::NonExistent)
            }
            Err(e) => {
                error!("failed to destroy \"{}\": {}", name, e);
                Err(e)
            }
        }
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

    fn nv_tree() -> (Arc<VolatilePool>, NvTree) {
        register_builtin().unwrap();
        let pool = Arc::new(VolatilePool::new());
        let root = transaction(&*pool, || pool.alloc(ROOT_DESC_SIZE)).unwrap();
        let ptr = pool.resolve(root).unwrap();
        let tree = transaction(&*pool, || NvTree::create(0, 4, pool.clone(), ptr)).unwrap();
        (pool, tree)
    }

    #[test]
    fn round_trip() {
        let (pool, tree) = nv_tree();
        transaction(&*pool, || tree.update("answer", &[0x2a])).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(tree.lookup("answer", &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x2a);
    }

    #[test]
    fn keys_without_terminator_are_invalid() {
        let (pool, tree) = nv_tree();
        let err = transaction(&*pool, || tree.as_tree().update(b"raw", &[1])).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn empty_values_are_invalid() {
        let (pool, tree) = nv_tree();
        let err = transaction(&*pool, || tree.update("k", &[])).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        transaction(&*pool, || tree.update("k", b"hi")).unwrap();
        let err = transaction(&*pool, || tree.update("k", &[])).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn growing_update_reallocates_the_blob() {
        let (pool, tree) = nv_tree();
        transaction(&*pool, || tree.update("k", b"hi")).unwrap();
        let live = pool.stats().live_allocations;
        // Shrink fits the buffer: no reallocation.
        transaction(&*pool, || tree.update("k", b"a")).unwrap();
        assert_eq!(pool.stats().live_allocations, live);
        let allocs = pool.stats().allocs_total;
        transaction(&*pool, || tree.update("k", b"hello world!")).unwrap();
        assert_eq!(pool.stats().live_allocations, live);
        assert_eq!(pool.stats().allocs_total, allocs + 1);
        let mut buf = [0u8; 32];
        let n = tree.lookup("k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world!");
    }

    #[test]
    fn last_writer_wins() {
        let (pool, tree) = nv_tree();
        transaction(&*pool, || {
            tree.update("k", b"one")?;
            tree.update("k", b"two")
        })
        .unwrap();
        let mut buf = [0u8; 8];
        let n = tree.lookup("k", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn many_names_with_shared_prefixes() {
        let (pool, tree) = nv_tree();
        transaction(&*pool, || {
            for i in 0..200u32 {
                tree.update(&format!("key-{i}"), &i.to_ne_bytes())?;
            }
            Ok(())
        })
        .unwrap();
        let mut buf = [0u8; 4];
        for i in (0..200u32).rev() {
            tree.lookup(&format!("key-{i}"), &mut buf).unwrap();
            assert_eq!(buf, i.to_ne_bytes());
        }
        transaction(&*pool, || tree.delete("key-100")).unwrap();
        assert_eq!(
            tree.lookup("key-100", &mut buf).unwrap_err(),
            Error::NonExistent
        );
        tree.lookup("key-101", &mut buf).unwrap();
    }

    #[test]
    fn truncated_lookup_reports_real_length() {
        let (pool, tree) = nv_tree();
        transaction(&*pool, || tree.update("k", b"0123456789")).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            tree.lookup("k", &mut buf).unwrap_err(),
            Error::Truncated { len: 10 }
        );
    }
}
