//! Typed, transactional B-tree classes over persistent memory.
//!
//! The crate is organized leaves first:
//!
//!  - [`pmem`] — the persistent memory manager interface the engine
//!    consumes, plus an in-memory reference pool with undo-logged
//!    transactions.
//!  - [`tree`] — the B-tree engine: root descriptors, nodes, lookup,
//!    upsert, structural delete and iteration, with all record-specific
//!    behavior delegated to a class vtable.
//!  - [`classes`] — the record classes (name-value, UUID-value,
//!    epoch-counter), the process-wide class registry and the nested-tree
//!    helper that stores a child tree's root descriptor as the value of a
//!    parent record.
//!
//! Mutations run inside pool transactions; every persistent byte range is
//! enrolled in the undo log before it is overwritten, so aborting the
//! outermost transaction unwinds all structural changes.
//!
//! ```
//! use std::sync::Arc;
//! use pbtree::{classes, pmem::{transaction, VolatilePool}, NvTree, PmemPool, ROOT_DESC_SIZE};
//!
//! classes::register_builtin().unwrap();
//! let pool = Arc::new(VolatilePool::new());
//! let root = transaction(&*pool, || pool.alloc(ROOT_DESC_SIZE)).unwrap();
//! let ptr = pool.resolve(root).unwrap();
//! let tree = transaction(&*pool, || NvTree::create(0, 8, pool.clone(), ptr)).unwrap();
//!
//! transaction(&*pool, || tree.update("answer", &[42])).unwrap();
//! let mut buf = [0u8; 8];
//! assert_eq!(tree.lookup("answer", &mut buf).unwrap(), 1);
//! assert_eq!(buf[0], 42);
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

pub mod classes;
pub mod error;
pub mod fetch;
pub mod pmem;
pub mod tree;

pub use crate::{
    classes::{ec::EcTree, nv::NvTree, uv::UvTree, ClassId, RecordClass},
    error::{Error, Result},
    fetch::FetchBuf,
    pmem::{PersistentId, PmemPool, TxStage, VolatilePool},
    tree::{ProbeOpc, Tree, TreeIter, ROOT_DESC_SIZE},
};

/// Initializes `env_logger` for binaries and tests that want crate logs.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::builder().try_init();
}
