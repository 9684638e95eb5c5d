//! End-to-end scenarios exercising the red-black tree, trie, and range
//! layer together, including under real concurrent load.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rcu_index::rbt::RbTree;
use rcu_index::trie::KeyWidth;
use rcu_index::{RangeLayer, RcuDomain, Trie};

fn u64_cmp(a: &u64, b: &u64) -> core::cmp::Ordering {
    a.cmp(b)
}

/// Scenario 1: basic 8-bit-key trie insert/miss/delete-all/validate.
#[test]
fn scenario_basic_byte_trie_lifecycle() {
    let domain = RcuDomain::new();
    let trie: Trie<u32> = Trie::new(KeyWidth::Bits8);

    for k in 0u64..200 {
        trie.add_unique(&domain, k, k as u32).unwrap();
    }
    for k in 0u64..200 {
        assert_eq!(trie.lookup(k), Some(&(k as u32)));
    }
    for k in 200u64..240 {
        assert_eq!(trie.lookup(k), None);
    }
    for k in 0u64..200 {
        trie.remove(&domain, k).unwrap();
    }
    for k in 0u64..240 {
        assert_eq!(trie.lookup(k), None);
    }
    domain.barrier();
}

/// Scenario 2: sparse 32-bit trie with 3-way duplicates at widely spaced
/// keys.
#[test]
fn scenario_sparse_wide_trie_with_duplicates() {
    let domain = RcuDomain::new();
    let trie: Trie<u32> = Trie::new(KeyWidth::Bits32);

    let keys: [u64; 4] = [0, 1_000_000, 2_000_000_000, 4_000_000_000];
    for &k in &keys {
        trie.add_dup(&domain, k, 1).unwrap();
        trie.add_dup(&domain, k, 2).unwrap();
        trie.add_dup(&domain, k, 3).unwrap();
    }
    for &k in &keys {
        assert_eq!(trie.lookup(k), Some(&1));
    }
    assert_eq!(trie.lookup(500_000), None);
}

/// Scenario 3: interval search over a handful of overlapping ranges, with
/// min/next traversal in sorted order.
#[test]
fn scenario_interval_search_and_ordered_traversal() {
    let domain = RcuDomain::new();
    let tree: RbTree<u64, &'static str, _> = RbTree::new(u64_cmp);

    tree.insert(&domain, 0, 10, "a").unwrap();
    tree.insert(&domain, 5, 20, "b").unwrap();
    let c = tree.insert(&domain, 30, 40, "c").unwrap();

    // 7 falls inside both [0,10) and [5,20); either is a correct hit.
    let hit = tree.search(7).expect("7 is covered by two intervals");
    assert!(tree.begin(hit) == 0 || tree.begin(hit) == 5);
    assert_eq!(tree.search(25), None);
    assert_eq!(tree.search(35), Some(c));

    let mut order = Vec::new();
    let mut cur = tree.min();
    while let Some(h) = cur {
        order.push(*tree.payload(h));
        cur = tree.next(h);
    }
    assert_eq!(order, ["a", "b", "c"]);
}

/// Scenario 4: splitting an address space with two allocations, then
/// releasing both, must restore exactly one free segment covering
/// everything.
#[test]
fn scenario_range_split_then_merge() {
    let domain = RcuDomain::new();
    let layer: RangeLayer<u32> = RangeLayer::new(&domain, 0);

    layer.range_add(&domain, 10, 19, 1).unwrap();
    layer.range_add(&domain, 30, 39, 2).unwrap();

    assert!(layer.range_lookup(15).is_some());
    assert!(layer.range_lookup(35).is_some());
    assert!(layer.range_lookup(25).is_none());

    layer.range_del(&domain, 10, 19, 0).unwrap();
    layer.range_del(&domain, 30, 39, 0).unwrap();

    assert!(layer.range_lookup(15).is_none());
    assert!(layer.range_lookup(35).is_none());
}

/// Scenario 5: concurrent writers racing concurrent readers against the
/// same tree. Bounded by operation count rather than wall-clock so this
/// stays fast in CI; the property under test — every invariant holds once
/// the population quiesces — doesn't depend on how long the race ran.
#[test]
fn scenario_concurrent_readers_and_writers_then_quiesce() {
    let domain = Arc::new(RcuDomain::new());
    let tree: Arc<RbTree<u64, u64, fn(&u64, &u64) -> core::cmp::Ordering>> =
        Arc::new(RbTree::new(u64_cmp as fn(&u64, &u64) -> core::cmp::Ordering));
    let stop = Arc::new(AtomicBool::new(false));
    let reader_observations = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();

    for writer_id in 0..2u64 {
        let domain = Arc::clone(&domain);
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for i in 0..500u64 {
                let key = writer_id * 100_000 + i;
                if let Ok(h) = tree.insert(&domain, key, key + 1, key) {
                    if i % 7 == 0 {
                        let _ = tree.remove(&domain, h);
                    }
                }
            }
        }));
    }

    for _ in 0..2 {
        let tree = Arc::clone(&tree);
        let domain = Arc::clone(&domain);
        let stop = Arc::clone(&stop);
        let reader_observations = Arc::clone(&reader_observations);
        handles.push(thread::spawn(move || {
            let reader = domain.register();
            let deadline = Instant::now() + Duration::from_millis(200);
            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                let _guard = reader.read_section();
                if tree.search(50).is_some() {
                    reader_observations.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    domain.barrier();

    // Ascending in-order walk confirms the tree is still a valid BST after
    // the race: every node's begin key is strictly greater than the last.
    let mut last: Option<u64> = None;
    let mut cur = tree.min();
    let mut count = 0;
    while let Some(h) = cur {
        let begin = tree.begin(h);
        if let Some(l) = last {
            assert!(begin > l, "tree order violated after concurrent race");
        }
        last = Some(begin);
        count += 1;
        cur = tree.next(h);
    }
    assert!(count > 0);
}

/// Scenario 6: drive a single trie node through every layout class while a
/// concurrent reader continuously re-checks visibility of already-inserted
/// keys, confirming recompaction never produces a window where a
/// previously-visible key disappears.
#[test]
fn scenario_recompaction_stays_visible_to_concurrent_reader() {
    let domain = Arc::new(RcuDomain::new());
    let trie: Arc<Trie<u32>> = Arc::new(Trie::new(KeyWidth::Bits16));
    let inserted = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let reader_trie = Arc::clone(&trie);
    let reader_domain = Arc::clone(&domain);
    let reader_inserted = Arc::clone(&inserted);
    let reader_stop = Arc::clone(&stop);
    let reader = thread::spawn(move || {
        let handle = reader_domain.register();
        while !reader_stop.load(Ordering::Relaxed) {
            let _guard = handle.read_section();
            let visible = reader_inserted.load(Ordering::Acquire);
            for k in 0..visible as u64 {
                assert_eq!(
                    reader_trie.lookup(k),
                    Some(&(k as u32)),
                    "key {k} vanished mid-recompaction"
                );
            }
        }
    });

    for k in 0u64..300 {
        trie.add_unique(&domain, k, k as u32).unwrap();
        inserted.store((k + 1) as usize, Ordering::Release);
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();
}
