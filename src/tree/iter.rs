//! Tree iteration.
//!
//! An iterator is a root-to-leaf position stack over one tree handle. It is
//! prepared with [`super::Tree::iter`], positioned with [`TreeIter::probe`]
//! and stepped with `next`/`prev`; dropping it finishes the iteration.
//! Iteration order is the hashed-key order of the class.

use super::{node::NodeView, Tree};
use crate::{
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::PersistentId,
};

/// Probe opcode selecting the initial iterator position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOpc {
    /// Lowest record in the tree.
    First,
    /// Highest record in the tree.
    Last,
    /// The record matching the key exactly.
    Eq,
    /// Lowest record with key greater than or equal to the probe key.
    Ge,
    /// Highest record with key less than or equal to the probe key.
    Le,
}

/// Cursor over one tree.
pub struct TreeIter<'a> {
    tree: &'a Tree,
    // One (node id, slot index) entry per level, root first, leaf last.
    stack: Vec<(PersistentId, usize)>,
}

impl Tree {
    /// Prepares an iterator; position it with [`TreeIter::probe`].
    pub fn iter(&self) -> TreeIter<'_> {
        TreeIter {
            tree: self,
            stack: Vec::new(),
        }
    }
}

impl<'a> TreeIter<'a> {
    /// Positions the iterator. `key` is required for `Eq`/`Ge`/`Le` and
    /// ignored for `First`/`Last`. Fails `NonExistent` when no record
    /// matches; the iterator is unpositioned afterwards.
    pub fn probe(&mut self, opc: ProbeOpc, key: Option<&[u8]>) -> Result<()> {
        self.stack.clear();
        let root = self.tree.root_node();
        if root.is_null() {
            return Err(Error::NonExistent);
        }
        match opc {
            ProbeOpc::First => self.descend_edge(root, false),
            ProbeOpc::Last => self.descend_edge(root, true),
            ProbeOpc::Eq | ProbeOpc::Ge | ProbeOpc::Le => {
                let key = key.ok_or(Error::Invalid("probe opcode requires a key"))?;
                let (hk, n) = self.tree.hkey_for(key)?;
                self.descend_to_leaf(root, &hk[..n])?;
                let (leaf_id, _) = *self.stack.last().unwrap();
                let leaf = NodeView::open(&**self.tree.pool(), leaf_id, self.tree.layout())?;
                let (idx, exact) = self.tree.leaf_search(&leaf, &hk[..n], key)?;
                match opc {
                    ProbeOpc::Eq => {
                        if !exact {
                            self.stack.clear();
                            return Err(Error::NonExistent);
                        }
                        self.set_leaf_idx(idx);
                        Ok(())
                    }
                    ProbeOpc::Ge => {
                        if idx < leaf.count() {
                            self.set_leaf_idx(idx);
                            return Ok(());
                        }
                        // Past the end of this leaf; the match, if any, is
                        // the first record of the next one.
                        self.set_leaf_idx(leaf.count() - 1);
                        self.next()
                    }
                    ProbeOpc::Le => {
                        if exact {
                            self.set_leaf_idx(idx);
                            return Ok(());
                        }
                        if idx > 0 {
                            self.set_leaf_idx(idx - 1);
                            return Ok(());
                        }
                        self.set_leaf_idx(0);
                        self.prev()
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Materializes key and/or value of the current record per the fetch
    /// buffer protocol. Truncation is observable on the caller's buffers.
    pub fn fetch(
        &self,
        key_out: Option<&mut FetchBuf<'_>>,
        val_out: Option<&mut FetchBuf<'_>>,
    ) -> Result<()> {
        let &(leaf_id, idx) = self.stack.last().ok_or(Error::NonExistent)?;
        let leaf = NodeView::open(&**self.tree.pool(), leaf_id, self.tree.layout())?;
        self.tree
            .class()
            .rec_fetch(&**self.tree.pool(), leaf.rec(idx), leaf.hkey(idx), key_out, val_out)
    }

    /// Advances to the next record in hashed-key order.
    pub fn next(&mut self) -> Result<()> {
        let &(leaf_id, idx) = self.stack.last().ok_or(Error::NonExistent)?;
        let leaf = NodeView::open(&**self.tree.pool(), leaf_id, self.tree.layout())?;
        if idx + 1 < leaf.count() {
            self.set_leaf_idx(idx + 1);
            return Ok(());
        }
        self.stack.pop();
        while let Some(&(id, i)) = self.stack.last() {
            let node = NodeView::open(&**self.tree.pool(), id, self.tree.layout())?;
            if i + 1 < node.children() {
                self.stack.last_mut().unwrap().1 = i + 1;
                return self.descend_edge(node.child(i + 1), false);
            }
            self.stack.pop();
        }
        Err(Error::NonExistent)
    }

    /// Steps back to the previous record in hashed-key order.
    pub fn prev(&mut self) -> Result<()> {
        let &(_, idx) = self.stack.last().ok_or(Error::NonExistent)?;
        if idx > 0 {
            self.set_leaf_idx(idx - 1);
            return Ok(());
        }
        self.stack.pop();
        while let Some(&(id, i)) = self.stack.last() {
            let node = NodeView::open(&**self.tree.pool(), id, self.tree.layout())?;
            if i > 0 {
                self.stack.last_mut().unwrap().1 = i - 1;
                return self.descend_edge(node.child(i - 1), true);
            }
            self.stack.pop();
        }
        Err(Error::NonExistent)
    }

    fn set_leaf_idx(&mut self, idx: usize) {
        self.stack.last_mut().unwrap().1 = idx;
    }

    // Walks to the leftmost or rightmost leaf under `id`.
    fn descend_edge(&mut self, mut id: PersistentId, last: bool) -> Result<()> {
        loop {
            let node = NodeView::open(&**self.tree.pool(), id, self.tree.layout())?;
            if node.is_leaf() {
                let idx = if last { node.count() - 1 } else { 0 };
                self.stack.push((id, idx));
                return Ok(());
            }
            let idx = if last { node.children() - 1 } else { 0 };
            self.stack.push((id, idx));
            id = node.child(idx);
        }
    }

    // Keyed descent recording the path.
    fn descend_to_leaf(&mut self, mut id: PersistentId, hkey: &[u8]) -> Result<()> {
        loop {
            let node = NodeView::open(&**self.tree.pool(), id, self.tree.layout())?;
            if node.is_leaf() {
                self.stack.push((id, 0));
                return Ok(());
            }
            let idx = self.tree.descend_idx(&node, hkey);
            self.stack.push((id, idx));
            id = node.child(idx);
        }
    }
}
