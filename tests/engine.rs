//! End-to-end behavior of the storage core through the outward API.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use cachet::storage::Clock;
use cachet::{
    MemPager, Outcome, PageStore, PagerOptions, SliceSupplier, SupplierError, Tree, TreeOptions,
    ValueSupplier,
};

/// Steerable clock so expiry tests do not sleep.
#[derive(Default)]
struct ManualClock(AtomicU32);

impl ManualClock {
    fn advance_to(&self, now: u32) {
        self.0.store(now, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> u32 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Supplier that fails after delivering `good_bytes`.
struct FailingSupplier {
    total: usize,
    good_bytes: usize,
}

impl ValueSupplier for FailingSupplier {
    fn total_len(&self) -> usize {
        self.total
    }

    fn fill(&mut self, dst: &mut [u8]) -> Result<(), SupplierError> {
        if dst.len() > self.good_bytes {
            return Err(SupplierError);
        }
        self.good_bytes -= dst.len();
        dst.fill(0xAB);
        Ok(())
    }
}

fn new_engine() -> (Arc<MemPager>, Tree) {
    new_engine_with(TreeOptions::default())
}

fn new_engine_with(options: TreeOptions) -> (Arc<MemPager>, Tree) {
    let pager = Arc::new(MemPager::new(PagerOptions::default()).expect("pager"));
    let store: Arc<dyn PageStore> = pager.clone();
    let tree = Tree::open_or_create(&store, options).expect("tree");
    (pager, tree)
}

fn set(tree: &Tree, key: &[u8], value: &[u8]) -> Outcome {
    tree.set(key, &mut SliceSupplier::new(value), 0, 0)
        .expect("set")
}

fn get(tree: &Tree, key: &[u8]) -> Option<Vec<u8>> {
    tree.get(key).expect("get").map(|value| value.bytes)
}

#[test]
fn end_to_end_protocol_sequence() {
    let (_pager, tree) = new_engine();
    assert!(matches!(set(&tree, b"k", b"hello"), Outcome::Stored { .. }));
    assert!(matches!(
        tree.append(b"k", &mut SliceSupplier::new(b"world"))
            .expect("append"),
        Outcome::Stored { .. }
    ));
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"helloworld"[..]));
    assert_eq!(tree.incr(b"k", 1).expect("incr"), Outcome::NotNumeric);
    assert_eq!(tree.delete(b"k").expect("delete"), Outcome::Deleted);
    assert_eq!(get(&tree, b"k"), None);
    assert_eq!(tree.delete(b"k").expect("delete"), Outcome::NotFound);
}

#[test]
fn last_writer_wins_across_disjoint_keys() {
    let (_pager, tree) = new_engine();
    let mut rng = ChaCha8Rng::seed_from_u64(0xfeed);
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for round in 0..600u32 {
        let key = format!("key-{:03}", rng.gen_range(0..60)).into_bytes();
        if rng.gen_bool(0.25) {
            let outcome = tree.delete(&key).expect("delete");
            match reference.remove(&key) {
                Some(_) => assert_eq!(outcome, Outcome::Deleted),
                None => assert_eq!(outcome, Outcome::NotFound),
            }
        } else {
            let value = format!("value-{round}-{}", rng.gen::<u32>()).into_bytes();
            assert!(matches!(set(&tree, &key, &value), Outcome::Stored { .. }));
            reference.insert(key, value);
        }
    }
    for (key, value) in &reference {
        assert_eq!(get(&tree, key).as_deref(), Some(value.as_slice()));
    }
    for missing in 60..80 {
        let key = format!("key-{missing:03}").into_bytes();
        if !reference.contains_key(&key) {
            assert_eq!(get(&tree, &key), None);
        }
    }
}

#[test]
fn add_replace_preconditions() {
    let (_pager, tree) = new_engine();
    assert_eq!(
        tree.replace(b"a", &mut SliceSupplier::new(b"x"), 0, 0)
            .expect("replace"),
        Outcome::NotStored
    );
    assert!(matches!(
        tree.add(b"a", &mut SliceSupplier::new(b"1"), 0, 0).expect("add"),
        Outcome::Stored { .. }
    ));
    assert_eq!(
        tree.add(b"a", &mut SliceSupplier::new(b"2"), 0, 0).expect("add"),
        Outcome::NotStored
    );
    assert!(matches!(
        tree.replace(b"a", &mut SliceSupplier::new(b"3"), 0, 0)
            .expect("replace"),
        Outcome::Stored { .. }
    ));
    assert_eq!(get(&tree, b"a").as_deref(), Some(&b"3"[..]));
}

#[test]
fn cas_versions_are_idempotence_guards() {
    let (_pager, tree) = new_engine();
    let Outcome::Stored { cas: v1 } = set(&tree, b"a", b"1") else {
        panic!("first set must store");
    };
    let outcome = tree
        .cas(b"a", &mut SliceSupplier::new(b"2"), 0, 0, v1)
        .expect("cas");
    let Outcome::Stored { cas: v2 } = outcome else {
        panic!("cas with current version must store");
    };
    assert_ne!(v1, v2);
    assert_eq!(
        tree.cas(b"a", &mut SliceSupplier::new(b"3"), 0, 0, v1)
            .expect("stale cas"),
        Outcome::NotStored
    );
    assert_eq!(get(&tree, b"a").as_deref(), Some(&b"2"[..]));
    assert_eq!(
        tree.cas(b"missing", &mut SliceSupplier::new(b"x"), 0, 0, v2)
            .expect("cas on absent"),
        Outcome::NotFound
    );
    let fetched = tree.get(b"a").expect("get").expect("present");
    assert_eq!(fetched.cas, v2);
}

#[test]
fn counter_semantics() {
    let (_pager, tree) = new_engine();
    assert_eq!(tree.incr(b"n", 5).expect("incr"), Outcome::NotFound);
    set(&tree, b"n", b"10");
    assert!(matches!(
        tree.incr(b"n", 5).expect("incr"),
        Outcome::Counter { value: 15, .. }
    ));
    assert!(matches!(
        tree.decr(b"n", 7).expect("decr"),
        Outcome::Counter { value: 8, .. }
    ));
    // Underflow saturates to zero instead of wrapping.
    assert!(matches!(
        tree.decr(b"n", 100).expect("decr"),
        Outcome::Counter { value: 0, .. }
    ));
    assert_eq!(get(&tree, b"n").as_deref(), Some(&b"0"[..]));
    // Overflow saturates to zero as well.
    set(&tree, b"n", u64::MAX.to_string().as_bytes());
    assert!(matches!(
        tree.incr(b"n", 1).expect("incr"),
        Outcome::Counter { value: 0, .. }
    ));
    set(&tree, b"n", b"12x4");
    assert_eq!(tree.incr(b"n", 1).expect("incr"), Outcome::NotNumeric);
    // A 20-digit value past u64::MAX is numeric-looking but rejected.
    set(&tree, b"n", b"99999999999999999999");
    assert_eq!(tree.incr(b"n", 1).expect("incr"), Outcome::NotNumeric);
    // Counters preserve stored flags.
    tree.set(b"m", &mut SliceSupplier::new(b"7"), 42, 0)
        .expect("set");
    tree.incr(b"m", 1).expect("incr");
    assert_eq!(tree.get(b"m").expect("get").expect("present").flags, 42);
}

#[test]
fn inline_threshold_boundary() {
    let (_pager, tree) = new_engine();
    let inline_max = TreeOptions::default().inline_max;
    let exact = vec![b'x'; inline_max];
    let over = vec![b'y'; inline_max + 1];

    set(&tree, b"exact", &exact);
    set(&tree, b"over", &over);
    let mut large_flags = BTreeMap::new();
    tree.for_each(|key, record| {
        large_flags.insert(key.to_vec(), record.is_large());
        Ok(())
    })
    .expect("scan");
    assert!(!large_flags[&b"exact".to_vec()]);
    assert!(large_flags[&b"over".to_vec()]);
    assert_eq!(get(&tree, b"exact").as_deref(), Some(exact.as_slice()));
    assert_eq!(get(&tree, b"over").as_deref(), Some(over.as_slice()));

    // Appending one byte to an exactly-threshold value promotes it and the
    // concatenation survives unchanged.
    tree.append(b"exact", &mut SliceSupplier::new(b"!"))
        .expect("append");
    let mut promoted = false;
    tree.for_each(|key, record| {
        if key == b"exact" {
            promoted = record.is_large();
        }
        Ok(())
    })
    .expect("scan");
    assert!(promoted);
    let mut expected = exact.clone();
    expected.push(b'!');
    assert_eq!(get(&tree, b"exact").as_deref(), Some(expected.as_slice()));
}

#[test]
fn large_values_roundtrip_and_splice() {
    let (pager, tree) = new_engine();
    let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    set(&tree, b"big", &body);
    assert_eq!(get(&tree, b"big").as_deref(), Some(body.as_slice()));

    let tail: Vec<u8> = (0..5_000u32).map(|i| (i % 13) as u8).collect();
    tree.append(b"big", &mut SliceSupplier::new(&tail))
        .expect("append");
    let head: Vec<u8> = (0..3_000u32).map(|i| (i % 7) as u8).collect();
    tree.prepend(b"big", &mut SliceSupplier::new(&head))
        .expect("prepend");

    let mut expected = head;
    expected.extend_from_slice(&body);
    expected.extend_from_slice(&tail);
    assert_eq!(get(&tree, b"big").as_deref(), Some(expected.as_slice()));

    assert_eq!(tree.delete(b"big").expect("delete"), Outcome::Deleted);
    assert_eq!(get(&tree, b"big"), None);
    assert_eq!(pager.live_pages(), 0, "blob and tree pages all released");
}

#[test]
fn too_large_is_a_pure_rejection() {
    let mut options = TreeOptions::default();
    options.hard_max_value = 4096;
    let (_pager, tree) = new_engine_with(options);
    set(&tree, b"k", b"keep-me");
    let oversize = vec![0u8; 5000];
    assert_eq!(set(&tree, b"k", &oversize), Outcome::TooLarge);
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"keep-me"[..]));
    assert_eq!(
        tree.append(b"k", &mut SliceSupplier::new(&oversize))
            .expect("append"),
        Outcome::TooLarge
    );
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"keep-me"[..]));
}

#[test]
fn supplier_failure_leaves_prior_state_intact() {
    let (pager, tree) = new_engine();
    set(&tree, b"k", b"original");
    let live_before = pager.live_pages();

    // Failing mid-way through a large store rolls the allocation back.
    let mut failing = FailingSupplier {
        total: 50_000,
        good_bytes: 10_000,
    };
    assert_eq!(
        tree.set(b"k", &mut failing, 0, 0).expect("set"),
        Outcome::SupplierFailed
    );
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"original"[..]));
    assert_eq!(pager.live_pages(), live_before);

    // Failing mid-append on a large value unwinds the tentative growth.
    let body = vec![7u8; 30_000];
    set(&tree, b"big", &body);
    let live_with_big = pager.live_pages();
    let mut failing = FailingSupplier {
        total: 40_000,
        good_bytes: 5_000,
    };
    assert_eq!(
        tree.append(b"big", &mut failing).expect("append"),
        Outcome::SupplierFailed
    );
    assert_eq!(get(&tree, b"big").as_deref(), Some(body.as_slice()));
    assert_eq!(pager.live_pages(), live_with_big);

    // Same for prepend.
    let mut failing = FailingSupplier {
        total: 40_000,
        good_bytes: 5_000,
    };
    assert_eq!(
        tree.prepend(b"big", &mut failing).expect("prepend"),
        Outcome::SupplierFailed
    );
    assert_eq!(get(&tree, b"big").as_deref(), Some(body.as_slice()));
    assert_eq!(pager.live_pages(), live_with_big);
}

#[test]
fn storage_failure_aborts_without_partial_state() {
    let (pager, tree) = new_engine();
    set(&tree, b"k", b"stable");
    let live_before = pager.live_pages();

    pager.fail_allocation_after(3);
    let big = vec![1u8; 100_000];
    let err = tree.set(b"k", &mut SliceSupplier::new(&big), 0, 0);
    assert!(err.is_err(), "injected allocation fault must surface");
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"stable"[..]));
    assert_eq!(pager.live_pages(), live_before);

    // The engine keeps working after the failed operation.
    set(&tree, b"k2", b"fresh");
    assert_eq!(get(&tree, b"k2").as_deref(), Some(&b"fresh"[..]));
}

#[test]
fn expired_records_read_as_absent_and_are_silently_deleted() {
    let clock = Arc::new(ManualClock::default());
    clock.advance_to(1_000);
    let mut options = TreeOptions::default();
    options.clock = clock.clone();
    let (pager, tree) = new_engine_with(options);

    tree.set(b"k", &mut SliceSupplier::new(b"short-lived"), 0, 1_500)
        .expect("set");
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"short-lived"[..]));

    clock.advance_to(1_500);
    assert_eq!(get(&tree, b"k"), None);

    // A declined operation on the expired record owes a silent delete.
    assert_eq!(tree.delete(b"k").expect("delete"), Outcome::NotFound);
    assert_eq!(tree.stats_snapshot().silent_expiries, 1);
    assert_eq!(pager.live_pages(), 0, "expired entry fully reclaimed");

    // Add treats the expired slot as absent.
    tree.set(b"k", &mut SliceSupplier::new(b"gone"), 0, 1_600)
        .expect("set");
    clock.advance_to(2_000);
    assert!(matches!(
        tree.add(b"k", &mut SliceSupplier::new(b"new"), 0, 0)
            .expect("add"),
        Outcome::Stored { .. }
    ));
    assert_eq!(get(&tree, b"k").as_deref(), Some(&b"new"[..]));
}

#[test]
fn expired_large_value_pages_are_reclaimed() {
    let clock = Arc::new(ManualClock::default());
    clock.advance_to(100);
    let mut options = TreeOptions::default();
    options.clock = clock.clone();
    let (pager, tree) = new_engine_with(options);

    let big = vec![9u8; 50_000];
    tree.set(b"big", &mut SliceSupplier::new(&big), 0, 200)
        .expect("set");
    assert!(pager.live_pages() > 1);

    clock.advance_to(300);
    assert_eq!(tree.incr(b"big", 1).expect("incr"), Outcome::NotFound);
    assert_eq!(pager.live_pages(), 0, "expired blob reclaimed");
}

#[test]
fn rejects_out_of_range_keys() {
    let (_pager, tree) = new_engine();
    assert!(tree.get(b"").is_err());
    let long_key = vec![b'k'; 251];
    assert!(tree.delete(&long_key).is_err());
    let max_key = vec![b'k'; 250];
    assert!(matches!(set(&tree, &max_key, b"v"), Outcome::Stored { .. }));
    assert_eq!(get(&tree, &max_key).as_deref(), Some(&b"v"[..]));
}

#[test]
fn zero_length_values_are_legal() {
    let (_pager, tree) = new_engine();
    assert!(matches!(set(&tree, b"empty", b""), Outcome::Stored { .. }));
    assert_eq!(get(&tree, b"empty").as_deref(), Some(&b""[..]));
    tree.append(b"empty", &mut SliceSupplier::new(b"tail"))
        .expect("append");
    assert_eq!(get(&tree, b"empty").as_deref(), Some(&b"tail"[..]));
}
