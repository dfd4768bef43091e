//! Tests for interned keys and attribute maps.

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use rstest::rstest;

use super::{AttrKey, AttributeMap, UniqueKey};

#[test]
fn same_group_and_name_intern_once() {
    let a = UniqueKey::new("attr-tests-intern", "alpha");
    let b = UniqueKey::new("attr-tests-intern", "alpha");
    let c = UniqueKey::new("attr-tests-intern", "beta");
    assert_eq!(a, b);
    assert_eq!(a.id(), b.id());
    assert_ne!(a, c);
    assert_eq!(c.id(), a.id() + 1);
    assert_eq!(c.name(), "beta");
    assert_eq!(c.group(), "attr-tests-intern");
}

#[test]
fn ids_are_assigned_per_group() {
    let first = UniqueKey::new("attr-tests-group-a", "x");
    let other = UniqueKey::new("attr-tests-group-b", "x");
    assert_eq!(first.id(), 0);
    assert_eq!(other.id(), 0);
    assert_ne!(first, other);
}

#[rstest]
#[case::replace(Some(2))]
#[case::fresh(None)]
fn set_returns_previous_value(#[case] previous: Option<u32>) {
    let map = AttributeMap::new();
    let key: AttrKey<u32> = AttrKey::new("attr-tests-set", "count");
    if let Some(v) = previous {
        map.set(&key, v);
    }
    let old = map.set(&key, 7);
    assert_eq!(old.as_deref().copied(), previous);
    assert_eq!(map.get(&key).as_deref(), Some(&7));
    assert_eq!(map.len(), 1);
}

#[test]
fn remove_drops_entry() {
    let map = AttributeMap::new();
    let key: AttrKey<String> = AttrKey::new("attr-tests-remove", "name");
    map.set(&key, "conn".to_owned());
    assert_eq!(map.remove(&key).as_deref().map(String::as_str), Some("conn"));
    assert!(map.get(&key).is_none());
    assert!(map.is_empty());
}

#[test]
fn entries_stay_sorted_by_key() {
    let map = AttributeMap::new();
    let keys: Vec<AttrKey<usize>> = (0..8)
        .map(|i| AttrKey::new("attr-tests-sorted", &format!("k{i}")))
        .collect();
    for (i, key) in keys.iter().enumerate().rev() {
        map.set(key, i);
    }
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(map.get(key).as_deref(), Some(&i));
    }
}

#[test]
fn concurrent_get_or_create_runs_create_once() {
    const THREADS: usize = 16;
    let map = Arc::new(AttributeMap::new());
    let key: AttrKey<Vec<u8>> = AttrKey::new("attr-tests-race", "shared");
    let created = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let map = Arc::clone(&map);
            let key = key.clone();
            let created = Arc::clone(&created);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                map.get_or_create(&key, || {
                    created.fetch_add(1, Ordering::SeqCst);
                    vec![1, 2, 3]
                })
            })
        })
        .collect();

    let values: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked"))
        .collect();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
}
