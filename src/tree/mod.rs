//! The B-tree engine.
//!
//! A [`Tree`] is a process-local handle onto one persistent tree: the class
//! descriptor, the fan-out and a pointer to the tree's root descriptor. All
//! record-specific behavior is delegated to the class vtable; the engine
//! owns node layout, descent and structural changes.
//!
//! Mutating operations must be called inside a work-stage transaction of the
//! pool. Clean validation failures (malformed keys, allocation failure
//! inside `rec_alloc`) return without aborting; failures after structural
//! mutation has begun abort the transaction before returning.

use std::{cmp::Ordering, ptr::NonNull, sync::Arc};

use byteorder::{ByteOrder, NativeEndian};

use crate::{
    classes::{self, ClassId, RecordClass},
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{require_work, transaction, PersistentId, PmemPool},
};

mod iter;
mod node;

pub use iter::{ProbeOpc, TreeIter};

use node::{NodeLayout, NodeView};

/// On-media version tag of the root descriptor.
pub const TREE_VERSION: u32 = 1;

/// Feature bits the engine understands. None are defined yet; the mask
/// exists so descriptors written by a newer deployment are rejected instead
/// of misread.
pub const KNOWN_FEATS: u64 = 0;

/// Size in bytes of a root descriptor. Storage embedding a nested tree must
/// be sized exactly to this.
pub const ROOT_DESC_SIZE: usize = 32;

const ROOT_CLASS_OFF: usize = 0;
const ROOT_VERSION_OFF: usize = 4;
const ROOT_FEATS_OFF: usize = 8;
const ROOT_NODE_OFF: usize = 16;
const ROOT_ORDER_OFF: usize = 24;
const ROOT_DEPTH_OFF: usize = 26;

struct Split {
    sep: Vec<u8>,
    right: PersistentId,
}

/// Open handle onto one persistent tree.
///
/// Valid between create/open and drop; dropping a handle never touches
/// persistent state. Handles are single-owner, the engine performs no
/// locking.
pub struct Tree {
    pool: Arc<dyn PmemPool>,
    class: &'static dyn RecordClass,
    root: NonNull<u8>,
    order: usize,
}

impl Tree {
    /// Initializes a caller-provided root descriptor and opens it.
    ///
    /// `root` must point at [`ROOT_DESC_SIZE`] bytes of already-allocated
    /// persistent storage. Work stage only.
    pub fn create_inplace(
        class: ClassId,
        feats: u64,
        order: usize,
        pool: Arc<dyn PmemPool>,
        root: NonNull<u8>,
    ) -> Result<Tree> {
        require_work(&*pool)?;
        let class = classes::class_for(class)?;
        if order < 2 || order > u16::MAX as usize {
            return Err(Error::Invalid("tree order out of range"));
        }
        if feats & !KNOWN_FEATS != 0 {
            return Err(Error::Invalid("unknown feature bits"));
        }
        pool.tx_add_ptr(root, ROOT_DESC_SIZE)?;
        let desc = unsafe { std::slice::from_raw_parts_mut(root.as_ptr(), ROOT_DESC_SIZE) };
        desc.fill(0);
        NativeEndian::write_u32(&mut desc[ROOT_CLASS_OFF..], class.id().0);
        NativeEndian::write_u32(&mut desc[ROOT_VERSION_OFF..], TREE_VERSION);
        NativeEndian::write_u64(&mut desc[ROOT_FEATS_OFF..], feats);
        NativeEndian::write_u64(&mut desc[ROOT_NODE_OFF..], PersistentId::NULL.to_raw());
        NativeEndian::write_u16(&mut desc[ROOT_ORDER_OFF..], order as u16);
        Ok(Tree {
            pool,
            class,
            root,
            order,
        })
    }

    /// Adopts an existing root descriptor.
    pub fn open_inplace(root: NonNull<u8>, pool: Arc<dyn PmemPool>) -> Result<Tree> {
        let desc = unsafe { std::slice::from_raw_parts(root.as_ptr(), ROOT_DESC_SIZE) };
        let version = NativeEndian::read_u32(&desc[ROOT_VERSION_OFF..]);
        if version != TREE_VERSION {
            return Err(Error::Invalid("root descriptor version mismatch"));
        }
        let feats = NativeEndian::read_u64(&desc[ROOT_FEATS_OFF..]);
        if feats & !KNOWN_FEATS != 0 {
            return Err(Error::Invalid("unknown feature bits"));
        }
        let class = classes::class_for(ClassId(NativeEndian::read_u32(&desc[ROOT_CLASS_OFF..])))?;
        let order = NativeEndian::read_u16(&desc[ROOT_ORDER_OFF..]) as usize;
        if order < 2 {
            return Err(Error::Invalid("root descriptor order out of range"));
        }
        Ok(Tree {
            pool,
            class,
            root,
            order,
        })
    }

    pub(crate) fn pool(&self) -> &Arc<dyn PmemPool> {
        &self.pool
    }

    pub(crate) fn class(&self) -> &'static dyn RecordClass {
        self.class
    }

    /// Feature bits stored in the root descriptor.
    pub fn feats(&self) -> u64 {
        NativeEndian::read_u64(&self.desc()[ROOT_FEATS_OFF..])
    }

    /// Fan-out of this tree.
    pub fn order(&self) -> usize {
        self.order
    }

    fn desc(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.root.as_ptr(), ROOT_DESC_SIZE) }
    }

    fn root_node(&self) -> PersistentId {
        PersistentId::from_raw(NativeEndian::read_u64(&self.desc()[ROOT_NODE_OFF..]))
    }

    fn depth(&self) -> u16 {
        NativeEndian::read_u16(&self.desc()[ROOT_DEPTH_OFF..])
    }

    fn set_root_node(&self, id: PersistentId, depth: u16) -> Result<()> {
        self.pool.tx_add_ptr(self.root, ROOT_DESC_SIZE)?;
        let desc = unsafe { std::slice::from_raw_parts_mut(self.root.as_ptr(), ROOT_DESC_SIZE) };
        NativeEndian::write_u64(&mut desc[ROOT_NODE_OFF..], id.to_raw());
        NativeEndian::write_u16(&mut desc[ROOT_DEPTH_OFF..], depth);
        Ok(())
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout {
            order: self.order,
            hkey_size: self.class.hkey_size(),
        }
    }

    fn hkey_for(&self, key: &[u8]) -> Result<([u8; classes::MAX_HKEY_SIZE], usize)> {
        let len = self.class.hkey_size();
        let mut buf = [0u8; classes::MAX_HKEY_SIZE];
        self.class.hkey_gen(key, &mut buf[..len])?;
        Ok((buf, len))
    }

    // First leaf slot with hashed key >= `hkey`, then resolved within the
    // equal-hash run via the class's full-key compare.
    fn leaf_search(&self, leaf: &NodeView<'_>, hkey: &[u8], key: &[u8]) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, leaf.count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.class.hkey_cmp(leaf.hkey(mid), hkey) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let mut idx = lo;
        while idx < leaf.count() && self.class.hkey_cmp(leaf.hkey(idx), hkey) == Ordering::Equal {
            match self.class.key_cmp(&*self.pool, leaf.rec(idx), key)? {
                Ordering::Less => idx += 1,
                Ordering::Equal => return Ok((idx, true)),
                Ordering::Greater => break,
            }
        }
        Ok((idx, false))
    }

    // Child to descend into: the rightmost whose low bound is <= `hkey`,
    // i.e. the number of separators <= `hkey`.
    fn descend_idx(&self, inner: &NodeView<'_>, hkey: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, inner.count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.class.hkey_cmp(inner.hkey(mid), hkey) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn find_leaf(&self, hkey: &[u8]) -> Result<Option<NodeView<'_>>> {
        let mut id = self.root_node();
        if id.is_null() {
            return Ok(None);
        }
        loop {
            let node = NodeView::open(&*self.pool, id, self.layout())?;
            if node.is_leaf() {
                return Ok(Some(node));
            }
            id = node.child(self.descend_idx(&node, hkey));
        }
    }

    /// Locates the record for `key` and materializes the value per the fetch
    /// buffer protocol. Fails `NonExistent` without aborting; fails
    /// `Truncated` when a copy-mode buffer is too small (the real length is
    /// still reported in `val`).
    pub fn lookup(&self, key: &[u8], val: &mut FetchBuf<'_>) -> Result<()> {
        let (hk, n) = self.hkey_for(key)?;
        let leaf = match self.find_leaf(&hk[..n])? {
            Some(leaf) => leaf,
            None => return Err(Error::NonExistent),
        };
        let (idx, exact) = self.leaf_search(&leaf, &hk[..n], key)?;
        if !exact {
            return Err(Error::NonExistent);
        }
        self.class
            .rec_fetch(&*self.pool, leaf.rec(idx), leaf.hkey(idx), None, Some(val))?;
        if val.is_truncated() {
            return Err(Error::Truncated { len: val.len() });
        }
        Ok(())
    }

    /// Borrow-mode lookup: pointer into persistent memory plus length.
    pub fn lookup_borrowed(&self, key: &[u8]) -> Result<(NonNull<u8>, usize)> {
        let mut val = FetchBuf::borrowed();
        self.lookup(key, &mut val)?;
        val.borrowed_parts().ok_or(Error::NonExistent)
    }

    /// Upsert. Allocates and inserts a record if `key` is absent, otherwise
    /// replaces the value through the class's `rec_update`.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<()> {
        require_work(&*self.pool)?;
        let (hk, n) = self.hkey_for(key)?;
        let hkey = &hk[..n];
        let root_id = self.root_node();
        if root_id.is_null() {
            let rec = self.class.rec_alloc(&*self.pool, key, val)?;
            return self.abort_on_err((|| {
                let leaf = NodeView::alloc(&*self.pool, self.layout(), 0)?;
                leaf.leaf_insert(0, hkey, rec)?;
                self.set_root_node(leaf.id(), 1)
            })());
        }
        match self.upsert(root_id, hkey, key, val)? {
            None => Ok(()),
            Some(split) => self.abort_on_err((|| {
                let old_depth = self.depth();
                let inner = NodeView::alloc(&*self.pool, self.layout(), old_depth)?;
                inner.inner_install(root_id)?;
                inner.inner_insert(0, &split.sep, split.right)?;
                self.set_root_node(inner.id(), old_depth + 1)
            })()),
        }
    }

    fn abort_on_err(&self, r: Result<()>) -> Result<()> {
        if let Err(e) = &r {
            self.pool.tx_abort(e.clone());
        }
        r
    }

    fn upsert(&self, node_id: PersistentId, hkey: &[u8], key: &[u8], val: &[u8]) -> Result<Option<Split>> {
        let node = NodeView::open(&*self.pool, node_id, self.layout())?;
        if node.is_leaf() {
            let (idx, exact) = self.leaf_search(&node, hkey, key)?;
            if exact {
                return self.class.rec_update(&*self.pool, node.rec(idx), val).map(|_| None);
            }
            if node.count() < self.order {
                let rec = self.class.rec_alloc(&*self.pool, key, val)?;
                self.abort_on_err(node.leaf_insert(idx, hkey, rec))?;
                return Ok(None);
            }
            // Pick the split point before the record exists so a clean
            // refusal leaves nothing allocated.
            let at = self.leaf_split_point(&node)?;
            let rec = self.class.rec_alloc(&*self.pool, key, val)?;
            let mut split = None;
            self.abort_on_err((|| {
                let right = NodeView::alloc(&*self.pool, self.layout(), 0)?;
                node.split_leaf_into(&right, at)?;
                if idx < at {
                    node.leaf_insert(idx, hkey, rec)?;
                } else if idx > at {
                    right.leaf_insert(idx - at, hkey, rec)?;
                } else if self.class.hkey_cmp(hkey, right.hkey(0)) == Ordering::Equal {
                    // The new record sorts at the head of an equal-hash run;
                    // it must stay with the run.
                    right.leaf_insert(0, hkey, rec)?;
                } else {
                    node.leaf_insert(at, hkey, rec)?;
                }
                split = Some(Split {
                    sep: right.hkey(0).to_vec(),
                    right: right.id(),
                });
                Ok(())
            })())?;
            return Ok(split);
        }

        let idx = self.descend_idx(&node, hkey);
        let child_split = match self.upsert(node.child(idx), hkey, key, val)? {
            None => return Ok(None),
            Some(split) => split,
        };
        if node.count() < self.order {
            self.abort_on_err(node.inner_insert(idx, &child_split.sep, child_split.right))?;
            return Ok(None);
        }
        let at = node.count() / 2;
        let mut split = None;
        self.abort_on_err((|| {
            let right = NodeView::alloc(&*self.pool, self.layout(), node.level())?;
            let promoted = node.split_inner_into(&right, at)?;
            if idx <= at {
                node.inner_insert(idx, &child_split.sep, child_split.right)?;
            } else {
                right.inner_insert(idx - at - 1, &child_split.sep, child_split.right)?;
            }
            split = Some(Split {
                sep: promoted,
                right: right.id(),
            });
            Ok(())
        })())?;
        Ok(split)
    }

    // Split index that keeps equal-hash runs within one leaf, so probes stay
    // single-descent.
    fn leaf_split_point(&self, leaf: &NodeView<'_>) -> Result<usize> {
        let count = leaf.count();
        let mut at = count / 2;
        while at > 0 && self.class.hkey_cmp(leaf.hkey(at), leaf.hkey(at - 1)) == Ordering::Equal {
            at -= 1;
        }
        if at > 0 {
            return Ok(at);
        }
        at = count / 2;
        while at < count && self.class.hkey_cmp(leaf.hkey(at), leaf.hkey(at - 1)) == Ordering::Equal
        {
            at += 1;
        }
        if at == count {
            // An equal-hash run filling a whole leaf cannot be split without
            // breaking the run invariant.
            return Err(Error::Invalid("hash collision run exceeds node capacity"));
        }
        Ok(at)
    }

    /// Removes the record for `key`, freeing its body and collapsing empty
    /// nodes. Fails `NonExistent` without aborting.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        require_work(&*self.pool)?;
        let (hk, n) = self.hkey_for(key)?;
        let root_id = self.root_node();
        if root_id.is_null() {
            return Err(Error::NonExistent);
        }
        let root_empty = self.remove_rec(root_id, &hk[..n], key)?;
        self.abort_on_err((|| {
            if root_empty {
                self.pool.free(root_id)?;
                return self.set_root_node(PersistentId::NULL, 0);
            }
            // Collapse a root chain with a single child per level.
            loop {
                let id = self.root_node();
                let root = NodeView::open(&*self.pool, id, self.layout())?;
                if root.is_leaf() || root.children() > 1 {
                    return Ok(());
                }
                let child = root.child(0);
                root.free()?;
                let level = NodeView::open(&*self.pool, child, self.layout())?.level();
                self.set_root_node(child, level + 1)?;
            }
        })())
    }

    fn remove_rec(&self, node_id: PersistentId, hkey: &[u8], key: &[u8]) -> Result<bool> {
        let node = NodeView::open(&*self.pool, node_id, self.layout())?;
        if node.is_leaf() {
            let (idx, exact) = self.leaf_search(&node, hkey, key)?;
            if !exact {
                return Err(Error::NonExistent);
            }
            self.abort_on_err((|| {
                self.class.rec_free(&*self.pool, node.rec(idx))?;
                node.leaf_remove(idx)
            })())?;
            return Ok(node.count() == 0);
        }
        let idx = self.descend_idx(&node, hkey);
        let child = node.child(idx);
        if self.remove_rec(child, hkey, key)? {
            let only_child = node.children() == 1;
            self.abort_on_err((|| {
                self.pool.free(child)?;
                if !only_child {
                    node.inner_remove_child(idx)?;
                }
                Ok(())
            })())?;
            // With its only child gone this node dies too; the parent (or
            // the root bookkeeping) frees it.
            return Ok(only_child);
        }
        Ok(false)
    }

    /// Recursively frees all nodes and record bodies, then nulls the root
    /// descriptor. Runs inside its own transaction; the descriptor's storage
    /// itself stays with the caller.
    pub fn destroy(self) -> Result<()> {
        transaction(&*self.pool, || {
            let root_id = self.root_node();
            if !root_id.is_null() {
                self.destroy_subtree(root_id)?;
            }
            self.set_root_node(PersistentId::NULL, 0)
        })
    }

    fn destroy_subtree(&self, id: PersistentId) -> Result<()> {
        let node = NodeView::open(&*self.pool, id, self.layout())?;
        if node.is_leaf() {
            for i in 0..node.count() {
                self.class.rec_free(&*self.pool, node.rec(i))?;
            }
        } else {
            for i in 0..node.children() {
                self.destroy_subtree(node.child(i))?;
            }
        }
        self.pool.free(id)
    }

    /// Renders the whole tree through the class's record renderer.
    #[cfg(feature = "internal-api")]
    pub fn dump(&self) -> Result<String> {
        use std::fmt::Write;

        fn walk(tree: &Tree, id: PersistentId, out: &mut String, indent: usize) -> Result<()> {
            let node = NodeView::open(&**tree.pool(), id, tree.layout())?;
            if node.is_leaf() {
                for i in 0..node.count() {
                    let rendered =
                        tree.class
                            .rec_string(&**tree.pool(), node.rec(i), node.hkey(i), true);
                    let _ = writeln!(out, "{:indent$}{rendered}", "");
                }
            } else {
                for i in 0..node.children() {
                    walk(tree, node.child(i), out, indent + 2)?;
                }
            }
            Ok(())
        }

        let mut out = String::new();
        let root_id = self.root_node();
        if !root_id.is_null() {
            walk(self, root_id, &mut out, 0)?;
        }
        Ok(out)
    }
}
