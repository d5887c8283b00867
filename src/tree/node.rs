//! Persistent node layout and the enrolled-write node view.
//!
//! A node is a single pool allocation: an 8-byte header followed by a slot
//! area. Leaves (`level == 0`) hold `order` record slots, inner nodes hold
//! `order + 1` child ids; both keep the class-sized hashed keys in a
//! separate run behind the id area so slot moves are two memmoves.
//!
//! [`NodeView`] is the only write path to node bytes. Every mutating method
//! enrolls the exact ranges it overwrites before touching them, so a node
//! cannot be mutated outside the undo log by construction.

use std::ptr::NonNull;

use byteorder::{ByteOrder, NativeEndian};

use crate::{
    error::{Error, Result},
    pmem::{PersistentId, PmemPool},
};

pub(super) const NODE_HDR_SIZE: usize = 8;
const COUNT_OFF: usize = 0;
const LEVEL_OFF: usize = 2;

/// Geometry of one tree's nodes: fan-out and class hashed-key width.
#[derive(Debug, Clone, Copy)]
pub(super) struct NodeLayout {
    pub order: usize,
    pub hkey_size: usize,
}

impl NodeLayout {
    fn id_slots(&self, leaf: bool) -> usize {
        if leaf {
            self.order
        } else {
            self.order + 1
        }
    }

    fn id_off(&self, idx: usize) -> usize {
        NODE_HDR_SIZE + idx * 8
    }

    fn hkeys_off(&self, leaf: bool) -> usize {
        NODE_HDR_SIZE + self.id_slots(leaf) * 8
    }

    fn hkey_off(&self, leaf: bool, idx: usize) -> usize {
        self.hkeys_off(leaf) + idx * self.hkey_size
    }

    pub fn node_size(&self, leaf: bool) -> usize {
        self.hkeys_off(leaf) + self.order * self.hkey_size
    }
}

/// Transient view of one persistent node.
pub(super) struct NodeView<'a> {
    pool: &'a dyn PmemPool,
    id: PersistentId,
    ptr: NonNull<u8>,
    layout: NodeLayout,
}

impl<'a> NodeView<'a> {
    pub fn open(pool: &'a dyn PmemPool, id: PersistentId, layout: NodeLayout) -> Result<Self> {
        let ptr = pool
            .resolve(id)
            .ok_or(Error::IoFailure("unresolvable node id"))?;
        Ok(NodeView {
            pool,
            id,
            ptr,
            layout,
        })
    }

    /// Allocates a zeroed node of the given level inside the current
    /// transaction.
    pub fn alloc(pool: &'a dyn PmemPool, layout: NodeLayout, level: u16) -> Result<Self> {
        let id = pool.zalloc(layout.node_size(level == 0))?;
        let node = NodeView::open(pool, id, layout)?;
        node.enroll(LEVEL_OFF, 2)?;
        node.write_u16(LEVEL_OFF, level);
        Ok(node)
    }

    pub fn id(&self) -> PersistentId {
        self.id
    }

    pub fn free(self) -> Result<()> {
        self.pool.free(self.id)
    }

    fn enroll(&self, off: usize, len: usize) -> Result<()> {
        self.pool.tx_add(self.id, off, len)
    }

    fn bytes(&self, off: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(off), len) }
    }

    fn write(&self, off: usize, src: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(off), src.len())
        };
    }

    // Overlapping in-node move of `len` bytes from `src` to `dst`.
    fn shift(&self, src: usize, dst: usize, len: usize) {
        unsafe {
            std::ptr::copy(
                self.ptr.as_ptr().add(src),
                self.ptr.as_ptr().add(dst),
                len,
            )
        };
    }

    fn write_u16(&self, off: usize, v: u16) {
        let mut buf = [0u8; 2];
        NativeEndian::write_u16(&mut buf, v);
        self.write(off, &buf);
    }

    fn write_u64(&self, off: usize, v: u64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, v);
        self.write(off, &buf);
    }

    pub fn count(&self) -> usize {
        NativeEndian::read_u16(self.bytes(COUNT_OFF, 2)) as usize
    }

    pub fn level(&self) -> u16 {
        NativeEndian::read_u16(self.bytes(LEVEL_OFF, 2))
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    fn set_count(&self, count: usize) -> Result<()> {
        self.enroll(COUNT_OFF, 2)?;
        self.write_u16(COUNT_OFF, count as u16);
        Ok(())
    }

    pub fn hkey(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.count());
        self.bytes(
            self.layout.hkey_off(self.is_leaf(), idx),
            self.layout.hkey_size,
        )
    }

    fn slot_id(&self, idx: usize) -> PersistentId {
        PersistentId::from_raw(NativeEndian::read_u64(self.bytes(self.layout.id_off(idx), 8)))
    }

    /// Record body id of leaf slot `idx`.
    pub fn rec(&self, idx: usize) -> PersistentId {
        debug_assert!(self.is_leaf() && idx < self.count());
        self.slot_id(idx)
    }

    /// Child node id `idx` of an inner node; `count() + 1` children exist.
    pub fn child(&self, idx: usize) -> PersistentId {
        debug_assert!(!self.is_leaf() && idx <= self.count());
        self.slot_id(idx)
    }

    /// Number of children of an inner node.
    pub fn children(&self) -> usize {
        debug_assert!(!self.is_leaf());
        self.count() + 1
    }

    /// Inserts a record slot into a leaf, shifting the tail right.
    pub fn leaf_insert(&self, idx: usize, hkey: &[u8], rec: PersistentId) -> Result<()> {
        let count = self.count();
        debug_assert!(self.is_leaf() && idx <= count && count < self.layout.order);
        let hs = self.layout.hkey_size;
        self.enroll(self.layout.id_off(idx), (count + 1 - idx) * 8)?;
        self.enroll(self.layout.hkey_off(true, idx), (count + 1 - idx) * hs)?;
        self.shift(
            self.layout.id_off(idx),
            self.layout.id_off(idx + 1),
            (count - idx) * 8,
        );
        self.shift(
            self.layout.hkey_off(true, idx),
            self.layout.hkey_off(true, idx + 1),
            (count - idx) * hs,
        );
        self.write_u64(self.layout.id_off(idx), rec.to_raw());
        self.write(self.layout.hkey_off(true, idx), hkey);
        self.set_count(count + 1)
    }

    /// Removes a record slot from a leaf, shifting the tail left.
    pub fn leaf_remove(&self, idx: usize) -> Result<()> {
        let count = self.count();
        debug_assert!(self.is_leaf() && idx < count);
        let hs = self.layout.hkey_size;
        self.enroll(self.layout.id_off(idx), (count - idx) * 8)?;
        self.enroll(self.layout.hkey_off(true, idx), (count - idx) * hs)?;
        self.shift(
            self.layout.id_off(idx + 1),
            self.layout.id_off(idx),
            (count - 1 - idx) * 8,
        );
        self.shift(
            self.layout.hkey_off(true, idx + 1),
            self.layout.hkey_off(true, idx),
            (count - 1 - idx) * hs,
        );
        self.set_count(count - 1)
    }

    /// Installs the single child of a fresh inner node.
    pub fn inner_install(&self, child: PersistentId) -> Result<()> {
        debug_assert!(!self.is_leaf() && self.count() == 0);
        self.enroll(self.layout.id_off(0), 8)?;
        self.write_u64(self.layout.id_off(0), child.to_raw());
        Ok(())
    }

    /// Inserts separator `hkey` at `idx` and the child right of it.
    pub fn inner_insert(&self, idx: usize, hkey: &[u8], right: PersistentId) -> Result<()> {
        let count = self.count();
        debug_assert!(!self.is_leaf() && idx <= count && count < self.layout.order);
        let hs = self.layout.hkey_size;
        self.enroll(self.layout.id_off(idx + 1), (count + 1 - idx) * 8)?;
        self.enroll(self.layout.hkey_off(false, idx), (count + 1 - idx) * hs)?;
        self.shift(
            self.layout.id_off(idx + 1),
            self.layout.id_off(idx + 2),
            (count - idx) * 8,
        );
        self.shift(
            self.layout.hkey_off(false, idx),
            self.layout.hkey_off(false, idx + 1),
            (count - idx) * hs,
        );
        self.write_u64(self.layout.id_off(idx + 1), right.to_raw());
        self.write(self.layout.hkey_off(false, idx), hkey);
        self.set_count(count + 1)
    }

    /// Removes child `child_idx` and the separator tied to it.
    pub fn inner_remove_child(&self, child_idx: usize) -> Result<()> {
        let count = self.count();
        debug_assert!(!self.is_leaf() && child_idx <= count && count > 0);
        let hs = self.layout.hkey_size;
        let sep_idx = child_idx.saturating_sub(1);
        self.enroll(self.layout.id_off(child_idx), (count + 1 - child_idx) * 8)?;
        self.enroll(self.layout.hkey_off(false, sep_idx), (count - sep_idx) * hs)?;
        self.shift(
            self.layout.id_off(child_idx + 1),
            self.layout.id_off(child_idx),
            (count - child_idx) * 8,
        );
        self.shift(
            self.layout.hkey_off(false, sep_idx + 1),
            self.layout.hkey_off(false, sep_idx),
            (count - 1 - sep_idx) * hs,
        );
        self.set_count(count - 1)
    }

    /// Moves leaf slots `[at..count)` into the empty leaf `right`.
    pub fn split_leaf_into(&self, right: &NodeView<'_>, at: usize) -> Result<()> {
        let count = self.count();
        debug_assert!(self.is_leaf() && right.is_leaf() && right.count() == 0);
        debug_assert!(at > 0 && at < count);
        let moved = count - at;
        let hs = self.layout.hkey_size;
        right.enroll(right.layout.id_off(0), moved * 8)?;
        right.enroll(right.layout.hkey_off(true, 0), moved * hs)?;
        right.write(
            right.layout.id_off(0),
            self.bytes(self.layout.id_off(at), moved * 8),
        );
        right.write(
            right.layout.hkey_off(true, 0),
            self.bytes(self.layout.hkey_off(true, at), moved * hs),
        );
        right.set_count(moved)?;
        self.set_count(at)
    }

    /// Splits an inner node at separator `at`, moving the upper slots into
    /// the empty inner node `right`. Returns the promoted separator.
    pub fn split_inner_into(&self, right: &NodeView<'_>, at: usize) -> Result<Vec<u8>> {
        let count = self.count();
        debug_assert!(!self.is_leaf() && !right.is_leaf() && right.count() == 0);
        debug_assert!(at < count);
        let hs = self.layout.hkey_size;
        let promoted = self.hkey_inner(at).to_vec();
        let moved_seps = count - at - 1;
        let moved_children = count - at;
        right.enroll(right.layout.id_off(0), moved_children * 8)?;
        right.write(
            right.layout.id_off(0),
            self.bytes(self.layout.id_off(at + 1), moved_children * 8),
        );
        if moved_seps > 0 {
            right.enroll(right.layout.hkey_off(false, 0), moved_seps * hs)?;
            right.write(
                right.layout.hkey_off(false, 0),
                self.bytes(self.layout.hkey_off(false, at + 1), moved_seps * hs),
            );
        }
        right.set_count(moved_seps)?;
        self.set_count(at)?;
        Ok(promoted)
    }

    fn hkey_inner(&self, idx: usize) -> &[u8] {
        self.bytes(
            self.layout.hkey_off(false, idx),
            self.layout.hkey_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::{transaction, VolatilePool};

    const LAYOUT: NodeLayout = NodeLayout {
        order: 4,
        hkey_size: 8,
    };

    fn hkey(v: u64) -> [u8; 8] {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, v);
        buf
    }

    #[test]
    fn leaf_insert_keeps_slots_sorted() {
        let pool = VolatilePool::new();
        transaction(&pool, || {
            let leaf = NodeView::alloc(&pool, LAYOUT, 0)?;
            leaf.leaf_insert(0, &hkey(20), PersistentId::from_raw(2))?;
            leaf.leaf_insert(0, &hkey(10), PersistentId::from_raw(1))?;
            leaf.leaf_insert(2, &hkey(30), PersistentId::from_raw(3))?;
            assert_eq!(leaf.count(), 3);
            assert_eq!(leaf.hkey(0), &hkey(10));
            assert_eq!(leaf.hkey(1), &hkey(20));
            assert_eq!(leaf.hkey(2), &hkey(30));
            assert_eq!(leaf.rec(1).to_raw(), 2);
            leaf.leaf_remove(1)?;
            assert_eq!(leaf.count(), 2);
            assert_eq!(leaf.hkey(1), &hkey(30));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn leaf_split_moves_upper_half() {
        let pool = VolatilePool::new();
        transaction(&pool, || {
            let left = NodeView::alloc(&pool, LAYOUT, 0)?;
            for i in 0..4u64 {
                left.leaf_insert(i as usize, &hkey(i * 10), PersistentId::from_raw(i + 1))?;
            }
            let right = NodeView::alloc(&pool, LAYOUT, 0)?;
            left.split_leaf_into(&right, 2)?;
            assert_eq!(left.count(), 2);
            assert_eq!(right.count(), 2);
            assert_eq!(right.hkey(0), &hkey(20));
            assert_eq!(right.rec(1).to_raw(), 4);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn inner_insert_and_remove_child() {
        let pool = VolatilePool::new();
        transaction(&pool, || {
            let inner = NodeView::alloc(&pool, LAYOUT, 1)?;
            inner.inner_install(PersistentId::from_raw(10))?;
            inner.inner_insert(0, &hkey(100), PersistentId::from_raw(11))?;
            inner.inner_insert(1, &hkey(200), PersistentId::from_raw(12))?;
            assert_eq!(inner.children(), 3);
            assert_eq!(inner.child(0).to_raw(), 10);
            assert_eq!(inner.child(2).to_raw(), 12);

            inner.inner_remove_child(1)?;
            assert_eq!(inner.children(), 2);
            assert_eq!(inner.child(1).to_raw(), 12);
            assert_eq!(inner.hkey(0), &hkey(200));

            inner.inner_remove_child(0)?;
            assert_eq!(inner.children(), 1);
            assert_eq!(inner.child(0).to_raw(), 12);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn inner_split_promotes_middle_separator() {
        let pool = VolatilePool::new();
        transaction(&pool, || {
            let left = NodeView::alloc(&pool, LAYOUT, 1)?;
            left.inner_install(PersistentId::from_raw(1))?;
            for i in 0..4u64 {
                left.inner_insert(i as usize, &hkey((i + 1) * 100), PersistentId::from_raw(i + 2))?;
            }
            let right = NodeView::alloc(&pool, LAYOUT, 1)?;
            let promoted = left.split_inner_into(&right, 2)?;
            assert_eq!(promoted, hkey(300));
            assert_eq!(left.count(), 2);
            assert_eq!(right.count(), 1);
            assert_eq!(right.child(0).to_raw(), 4);
            assert_eq!(right.child(1).to_raw(), 5);
            assert_eq!(right.hkey(0), &hkey(400));
            Ok(())
        })
        .unwrap();
    }
}
