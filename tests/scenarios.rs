//! End-to-end scenarios against the volatile reference pool.

use std::{ptr::NonNull, sync::Arc};

use rstest::rstest;
use uuid::Uuid;

use pbtree::{
    classes::{self, nv::CLASS_NV},
    pmem::{transaction, PmemPool, VolatilePool},
    EcTree, Error, FetchBuf, NvTree, ProbeOpc, UvTree, ROOT_DESC_SIZE,
};

fn new_pool() -> Arc<VolatilePool> {
    classes::register_builtin().unwrap();
    Arc::new(VolatilePool::new())
}

fn alloc_root(pool: &Arc<VolatilePool>) -> NonNull<u8> {
    let id = transaction(&**pool, || pool.alloc(ROOT_DESC_SIZE)).unwrap();
    pool.resolve(id).unwrap()
}

fn nv_tree(pool: &Arc<VolatilePool>, order: usize) -> NvTree {
    let root = alloc_root(pool);
    transaction(&**pool, || NvTree::create(0, order, pool.clone(), root)).unwrap()
}

#[test]
fn nv_single_round_trip() {
    let pool = new_pool();
    let tree = nv_tree(&pool, 4);

    transaction(&*pool, || tree.update("answer", &[0x2a])).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(tree.lookup("answer", &mut buf).unwrap(), 1);
    assert_eq!(buf[0], 0x2a);

    transaction(&*pool, || tree.delete("answer")).unwrap();
    assert_eq!(
        tree.lookup("answer", &mut buf).unwrap_err(),
        Error::NonExistent
    );
}

#[test]
fn nv_value_grow_reallocates() {
    let pool = new_pool();
    let tree = nv_tree(&pool, 4);

    transaction(&*pool, || tree.update("k", b"hi")).unwrap();
    let allocs = pool.stats().allocs_total;

    transaction(&*pool, || tree.update("k", b"hello world!")).unwrap();
    // The blob outgrew its buffer and was reallocated.
    assert_eq!(pool.stats().allocs_total, allocs + 1);

    let mut buf = [0u8; 32];
    let n = tree.lookup("k", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello world!");
}

#[test]
fn nv_update_within_capacity_keeps_the_blob() {
    let pool = new_pool();
    let tree = nv_tree(&pool, 4);

    transaction(&*pool, || tree.update("k", b"hello world!")).unwrap();
    let allocs = pool.stats().allocs_total;
    let live = pool.stats().live_allocations;

    transaction(&*pool, || tree.update("k", b"hi")).unwrap();
    assert_eq!(pool.stats().allocs_total, allocs);
    assert_eq!(pool.stats().live_allocations, live);
}

fn uuid(tail: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[15] = tail;
    Uuid::from_bytes(bytes)
}

#[test]
fn uv_list() {
    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || UvTree::create(0, 4, pool.clone(), root)).unwrap();

    transaction(&*pool, || {
        tree.update(&uuid(1), &[1, 1, 1, 1])?;
        tree.update(&uuid(2), &[2, 2, 2, 2])?;
        tree.update(&uuid(3), &[3, 3, 3, 3])
    })
    .unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(tree.lookup(&uuid(2), &mut buf).unwrap(), 4);
    assert_eq!(buf, [2, 2, 2, 2]);

    transaction(&*pool, || tree.delete(&uuid(2))).unwrap();
    assert_eq!(
        tree.lookup(&uuid(2), &mut buf).unwrap_err(),
        Error::NonExistent
    );
    assert_eq!(tree.lookup(&uuid(1), &mut buf).unwrap(), 4);
    assert_eq!(buf, [1, 1, 1, 1]);
    assert_eq!(tree.lookup(&uuid(3), &mut buf).unwrap(), 4);
    assert_eq!(buf, [3, 3, 3, 3]);
}

#[test]
fn uv_truncated_lookup_reports_real_length() {
    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || UvTree::create(0, 4, pool.clone(), root)).unwrap();

    transaction(&*pool, || tree.update(&uuid(9), &[9; 4])).unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(
        tree.lookup(&uuid(9), &mut buf).unwrap_err(),
        Error::Truncated { len: 4 }
    );
}

#[rstest]
#[case(2)]
#[case(4)]
#[case(7)]
fn ec_ordered_fetch(#[case] order: usize) {
    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || EcTree::create(0, order, pool.clone(), root)).unwrap();

    transaction(&*pool, || {
        tree.update(10, 100)?;
        tree.update(20, 200)?;
        tree.update(30, 300)
    })
    .unwrap();

    assert_eq!(tree.fetch(ProbeOpc::First, None).unwrap(), (10, 100));
    assert_eq!(tree.fetch(ProbeOpc::Ge, Some(15)).unwrap(), (20, 200));
    assert_eq!(tree.fetch(ProbeOpc::Le, Some(25)).unwrap(), (20, 200));

    #[cfg(feature = "ec-tombstone")]
    {
        transaction(&*pool, || tree.tombstone(20)).unwrap();
        assert_eq!(tree.fetch(ProbeOpc::Ge, Some(15)).unwrap(), (30, 300));
        assert_eq!(
            tree.fetch(ProbeOpc::Eq, Some(20)).unwrap_err(),
            Error::NonExistent
        );
    }
}

#[test]
fn ec_dense_population_survives_deep_splits() {
    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || EcTree::create(0, 2, pool.clone(), root)).unwrap();

    transaction(&*pool, || {
        for e in 0..256u64 {
            tree.update(e * 2, e)?;
        }
        Ok(())
    })
    .unwrap();
    for e in 0..256u64 {
        assert_eq!(tree.lookup(e * 2).unwrap(), e);
        assert_eq!(tree.fetch(ProbeOpc::Ge, Some(e * 2 + 1)).ok(),
            if e == 255 { None } else { Some(((e + 1) * 2, e + 1)) });
    }
}

#[test]
fn nested_create_insert_reopen_destroy() {
    let pool = new_pool();
    let parent = nv_tree(&pool, 4);
    let baseline = pool.stats().live_allocations;

    transaction(&*pool, || {
        let child = parent
            .create_tree("inventory", CLASS_NV, 0, 4, true)?
            .ok_or(Error::NoHandle)?;
        let child = NvTree::from_tree(child)?;
        child.update("widget", &[1, 2, 3])
        // Handle dropped here: close releases transient state only.
    })
    .unwrap();

    let child = NvTree::from_tree(parent.open_tree("inventory").unwrap()).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(child.lookup("widget", &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], &[1, 2, 3]);
    drop(child);

    parent.destroy_tree("inventory").unwrap();
    assert_eq!(
        parent.lookup("inventory", &mut buf).unwrap_err(),
        Error::NonExistent
    );
    // Everything reachable from the former child root is freed again.
    assert_eq!(pool.stats().live_allocations, baseline);
}

#[test]
fn nested_destroy_of_populated_child() {
    let pool = new_pool();
    let parent = nv_tree(&pool, 4);
    let baseline = pool.stats().live_allocations;

    transaction(&*pool, || {
        let child = parent
            .create_tree("bulk", CLASS_NV, 0, 3, true)?
            .ok_or(Error::NoHandle)?;
        let child = NvTree::from_tree(child)?;
        for i in 0..64u32 {
            child.update(&format!("item-{i}"), &i.to_ne_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    assert!(pool.stats().live_allocations > baseline);

    parent.destroy_tree("bulk").unwrap();
    assert_eq!(pool.stats().live_allocations, baseline);
}

#[test]
fn abort_unwinds_update_and_nested_create() {
    let pool = new_pool();
    let parent = nv_tree(&pool, 4);
    let baseline = pool.stats().live_allocations;

    pool.tx_begin().unwrap();
    parent.update("a", b"v1").unwrap();
    parent.create_tree("b", CLASS_NV, 0, 4, false).unwrap();
    pool.tx_abort(Error::IoFailure("forced abort"));
    assert_eq!(
        pool.tx_commit().unwrap_err(),
        Error::IoFailure("forced abort")
    );

    let mut buf = [0u8; 8];
    assert_eq!(parent.lookup("a", &mut buf).unwrap_err(), Error::NonExistent);
    assert!(matches!(parent.open_tree("b"), Err(Error::NonExistent)));
    assert_eq!(pool.stats().live_allocations, baseline);
}

#[test]
fn borrowed_fetch_points_into_persistent_memory() {
    let pool = new_pool();
    let tree = nv_tree(&pool, 4);

    transaction(&*pool, || tree.update("k", b"borrowed bytes")).unwrap();

    let bytes = tree.lookup_borrow("k").unwrap();
    assert_eq!(bytes, b"borrowed bytes");

    // The borrow observes in-place persistent updates of equal size.
    transaction(&*pool, || tree.update("k", b"BORROWED BYTES")).unwrap();
    assert_eq!(bytes, b"BORROWED BYTES");
}

#[test]
fn engine_fetch_protocol_over_iterator() {
    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || EcTree::create(0, 4, pool.clone(), root)).unwrap();
    transaction(&*pool, || tree.update(42, 4242)).unwrap();

    let mut iter = tree.as_tree().iter();
    iter.probe(ProbeOpc::First, None).unwrap();

    let mut key_out = FetchBuf::borrowed();
    let mut val_out = FetchBuf::borrowed();
    iter.fetch(Some(&mut key_out), Some(&mut val_out)).unwrap();
    assert_eq!(key_out.as_slice().unwrap(), &42u64.to_ne_bytes());
    assert_eq!(val_out.as_slice().unwrap(), &4242u64.to_ne_bytes());

    // Copy mode with a short buffer still reports the real length.
    let mut short = [0u8; 2];
    let mut val_short = FetchBuf::copied(&mut short);
    iter.fetch(None, Some(&mut val_short)).unwrap();
    assert_eq!(val_short.len(), 8);
    assert!(val_short.is_truncated());
}

#[test]
fn uv_random_population() {
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    let pool = new_pool();
    let root = alloc_root(&pool);
    let tree = transaction(&*pool, || UvTree::create(0, 4, pool.clone(), root)).unwrap();

    let mut uuids: Vec<Uuid> = (0..=255u8).map(uuid).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    uuids.shuffle(&mut rng);

    transaction(&*pool, || {
        for u in &uuids {
            tree.update(u, u.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    let mut buf = [0u8; 16];
    for u in &uuids {
        assert_eq!(tree.lookup(u, &mut buf).unwrap(), 16);
        assert_eq!(&buf, u.as_bytes());
    }
}

#[rstest]
#[case::nv_missing_terminator(&[b'r', b'a', b'w'][..])]
#[case::nv_empty(&[][..])]
fn nv_boundary_keys_are_invalid(#[case] key: &[u8]) {
    let pool = new_pool();
    let tree = nv_tree(&pool, 4);
    let err = transaction(&*pool, || tree.as_tree().update(key, &[1])).unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}
