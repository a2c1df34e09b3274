#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::node::test_hooks;
use crate::{pin, XArray, XMark, XaError, XaFilter, XaValue};

#[test]
fn test_store_load() {
    let xa: XArray<Arc<i32>> = XArray::new();
    let guard = pin();
    for i in 1..10000 {
        xa.store(&guard, (i * 3) as u64, Arc::new(i * 2));
    }
    for i in 1..10000 {
        let value = xa.load(&guard, (i * 3) as u64).unwrap();
        assert_eq!(**value, i * 2);
        assert!(xa.load(&guard, (i * 3 - 1) as u64).is_none());
    }
}

#[test]
fn test_store_returns_prior_entry() {
    let xa: XArray<Arc<i32>> = XArray::new();
    let guard = pin();

    assert!(xa.store(&guard, 12, Arc::new(1)).is_none());
    let old = xa.store(&guard, 12, Arc::new(2)).unwrap();
    assert_eq!(**old, 1);
    assert_eq!(**xa.load(&guard, 12).unwrap(), 2);

    // Storing the same item again returns it untouched.
    let same = Arc::new(3);
    xa.store(&guard, 13, same.clone());
    let old = xa.store(&guard, 13, same.clone()).unwrap();
    assert!(Arc::ptr_eq(&old, &same));
}

#[test]
fn test_erase() {
    let xa: XArray<Arc<i32>> = XArray::new();
    let guard = pin();
    for i in 0..10000 {
        xa.store(&guard, i as u64, Arc::new(i * 2));
    }
    for i in 0..10000 {
        let removed = xa.erase(&guard, i as u64).unwrap();
        assert_eq!(**removed, i * 2);
        assert!(xa.load(&guard, i as u64).is_none());
        assert!(xa.erase(&guard, i as u64).is_none());
    }
    assert!(xa.is_empty());
}

#[test]
fn test_growth_and_shrink() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let guard = pin();

    xa.store(&guard, 0, Arc::new(0));
    assert_eq!(**xa.load(&guard, 0).unwrap(), 0);

    xa.store(&guard, 1_000_000, Arc::new(1));
    assert_eq!(**xa.load(&guard, 0).unwrap(), 0);
    assert_eq!(**xa.load(&guard, 1_000_000).unwrap(), 1);
    assert!(xa.load(&guard, 999_999).is_none());
    assert!(xa.load(&guard, u64::MAX).is_none());

    // Removing the high entry lets the tree collapse back; removing the
    // last entry empties the array entirely.
    xa.erase(&guard, 1_000_000);
    assert_eq!(**xa.load(&guard, 0).unwrap(), 0);
    xa.erase(&guard, 0);
    assert!(xa.is_empty());
}

#[test]
fn test_marks() {
    let xa: XArray<Arc<i32>, XMark> = XArray::new();
    let guard = pin();
    for i in 1..10000 {
        xa.store(&guard, i as u64, Arc::new(i * 2));
    }

    xa.set_mark(1000, XMark::Mark0).unwrap();
    xa.set_mark(1000, XMark::Mark1).unwrap();
    xa.set_mark(2000, XMark::Mark1).unwrap();
    assert_eq!(xa.set_mark(20000, XMark::Mark1), Err(XaError::NoEntry));

    assert!(xa.get_mark(&guard, 1000, XMark::Mark0));
    assert!(xa.get_mark(&guard, 1000, XMark::Mark1));
    assert!(!xa.get_mark(&guard, 2000, XMark::Mark0));
    assert!(xa.get_mark(&guard, 2000, XMark::Mark1));
    assert!(!xa.get_mark(&guard, 3000, XMark::Mark1));
    assert!(xa.is_marked(XMark::Mark0));
    assert!(xa.is_marked(XMark::Mark1));
    assert!(!xa.is_marked(XMark::Mark2));

    xa.unset_mark(1000, XMark::Mark0).unwrap();
    xa.unset_mark(1000, XMark::Mark2).unwrap();
    assert!(!xa.get_mark(&guard, 1000, XMark::Mark0));
    assert!(!xa.get_mark(&guard, 1000, XMark::Mark2));

    // Erasing an entry releases its marks, and the array-level summary
    // follows once no marked entry remains.
    xa.erase(&guard, 1000);
    xa.erase(&guard, 2000);
    assert!(!xa.get_mark(&guard, 1000, XMark::Mark1));
    assert!(!xa.is_marked(XMark::Mark1));
}

#[test]
fn test_mark_on_head_entry() {
    let xa: XArray<Arc<i32>, XMark> = XArray::new();
    let guard = pin();

    // A single entry at index 0 lives in the head without any node; marks
    // on it are carried by the array-level summary alone.
    xa.store(&guard, 0, Arc::new(7));
    xa.set_mark(0, XMark::Mark2).unwrap();
    assert!(xa.get_mark(&guard, 0, XMark::Mark2));
    assert!(!xa.get_mark(&guard, 1, XMark::Mark2));

    xa.erase(&guard, 0);
    assert!(!xa.is_marked(XMark::Mark2));
}

#[test]
fn test_cmpxchg() {
    let xa: XArray<Arc<i32>> = XArray::new();
    let guard = pin();

    let a = Arc::new(1);
    let b = Arc::new(2);
    let c = Arc::new(3);
    xa.store(&guard, 5, a.clone());

    let prev = xa.cmpxchg(&guard, 5, Some(&a), Some(b.clone())).unwrap();
    assert!(Arc::ptr_eq(&prev, &a));
    assert!(Arc::ptr_eq(&xa.load(&guard, 5).unwrap(), &b));

    let prev = xa.cmpxchg(&guard, 5, Some(&a), Some(c)).unwrap();
    assert!(Arc::ptr_eq(&prev, &b));
    assert!(Arc::ptr_eq(&xa.load(&guard, 5).unwrap(), &b));

    // A conditional erase and a conditional insert into a vacant slot.
    let prev = xa.cmpxchg(&guard, 5, Some(&b), None).unwrap();
    assert!(Arc::ptr_eq(&prev, &b));
    assert!(xa.load(&guard, 5).is_none());
    assert!(xa.cmpxchg(&guard, 5, None, Some(a.clone())).is_none());
    assert!(Arc::ptr_eq(&xa.load(&guard, 5).unwrap(), &a));
}

#[test]
fn test_insert() {
    let xa: XArray<Arc<i32>> = XArray::new();
    let guard = pin();

    xa.insert(&guard, 77, Arc::new(1)).unwrap();
    assert_eq!(
        xa.insert(&guard, 77, Arc::new(2)),
        Err(XaError::AlreadyExists)
    );
    assert_eq!(**xa.load(&guard, 77).unwrap(), 1);
}

#[test]
fn test_multi_index() {
    let xa: XArray<Arc<u64>, XMark> = XArray::new();
    let guard = pin();

    let item = Arc::new(42);
    xa.store_order(&guard, 8, 2, item.clone());

    for index in 8..=11 {
        assert!(Arc::ptr_eq(&xa.load(&guard, index).unwrap(), &item));
    }
    assert!(xa.load(&guard, 7).is_none());
    assert!(xa.load(&guard, 12).is_none());

    // The range is one logical entry for marks as well.
    xa.set_mark(10, XMark::Mark0).unwrap();
    assert!(xa.get_mark(&guard, 8, XMark::Mark0));
    assert!(xa.get_mark(&guard, 11, XMark::Mark0));

    // Erasing at any covered index drops the whole range.
    let removed = xa.erase(&guard, 9).unwrap();
    assert!(Arc::ptr_eq(&removed, &item));
    for index in 8..=11 {
        assert!(xa.load(&guard, index).is_none());
    }
    assert!(!xa.get_mark(&guard, 8, XMark::Mark0));
    assert!(xa.is_empty());
}

#[test]
fn test_multi_index_spanning_nodes() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let guard = pin();

    // An order-6 entry occupies a whole leaf position one level up.
    let item = Arc::new(1);
    xa.store_order(&guard, 128, 6, item.clone());
    for index in [128, 129, 163, 191] {
        assert!(Arc::ptr_eq(&xa.load(&guard, index).unwrap(), &item));
    }
    assert!(xa.load(&guard, 127).is_none());
    assert!(xa.load(&guard, 192).is_none());

    xa.erase(&guard, 163);
    assert!(xa.is_empty());
}

#[test]
fn test_iteration() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let guard = pin();
    let indices: Vec<u64> = (0..1000).map(|i| i * 7 + 3).collect();
    for &index in &indices {
        xa.store(&guard, index, Arc::new(index));
    }

    let visited: Vec<u64> = xa.range(&guard, 0..u64::MAX).map(|(i, _)| i).collect();
    assert_eq!(visited, indices);

    // find / find_after walk the same sequence one entry at a time.
    let (first, _) = xa.find(&guard, 0, u64::MAX).unwrap();
    assert_eq!(first, 3);
    let (second, _) = xa.find_after(&guard, first, u64::MAX).unwrap();
    assert_eq!(second, 10);
    assert!(xa.find(&guard, indices.last().unwrap() + 1, u64::MAX).is_none());
}

#[test]
fn test_marked_iteration() {
    let xa: XArray<Arc<u64>, XMark> = XArray::new();
    let guard = pin();
    for i in 0..3000 {
        xa.store(&guard, i, Arc::new(i));
    }
    let marked: Vec<u64> = (0..3000).filter(|i| i % 7 == 0).collect();
    for &index in &marked {
        xa.set_mark(index, XMark::Mark1).unwrap();
    }

    let visited: Vec<u64> = xa
        .marked_range(&guard, 0..3000, XMark::Mark1)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(visited, marked);

    let (first, _) = xa.find_marked(&guard, 1, 2999, XMark::Mark1).unwrap();
    assert_eq!(first, 7);

    // Every marked index still holds a present entry.
    for &index in &marked {
        assert!(xa.load(&guard, index).is_some());
    }
}

#[test]
fn test_extract() {
    let xa: XArray<Arc<u64>, XMark> = XArray::new();
    let guard = pin();
    for i in 0..100 {
        xa.store(&guard, i, Arc::new(i));
    }
    xa.set_mark(4, XMark::Mark0).unwrap();
    xa.set_mark(9, XMark::Mark0).unwrap();

    let mut dst = Vec::new();
    let copied = xa.extract(&guard, &mut dst, 10, u64::MAX, 5, XaFilter::Present);
    assert_eq!(copied, 5);
    let indices: Vec<u64> = dst.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![10, 11, 12, 13, 14]);

    let mut dst = Vec::new();
    let copied = xa.extract(
        &guard,
        &mut dst,
        0,
        u64::MAX,
        usize::MAX,
        XaFilter::Marked(XMark::Mark0),
    );
    assert_eq!(copied, 2);
    assert_eq!(dst[0].0, 4);
    assert_eq!(dst[1].0, 9);
}

#[test]
fn test_pause_and_resume() {
    let xa: XArray<Arc<u64>> = XArray::new();
    {
        let guard = pin();
        for i in 0..200 {
            xa.store(&guard, i * 3, Arc::new(i));
        }
    }

    // Iterate one entry per pin, pausing in between, the way a caller
    // yields a lock mid-walk.
    let mut seen = Vec::new();
    let mut index = 0u64;
    loop {
        let guard = pin();
        let mut cursor = xa.cursor(&guard, index);
        let Some((found, item)) = cursor.find(u64::MAX) else {
            break;
        };
        seen.push((found, **item));
        cursor.pause();
        index = cursor.index();
    }
    let expected: Vec<(u64, u64)> = (0..200).map(|i| (i * 3, i)).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_locked_api() {
    let xa: XArray<Arc<i32>> = XArray::new();

    let mut locked = xa.lock();
    assert!(locked.store(9, Arc::new(90)).is_none());
    assert_eq!(**locked.load(9).unwrap(), 90);

    let mut cursor = locked.cursor_mut(10);
    cursor.store(Arc::new(100));
    assert_eq!(**cursor.load().unwrap(), 100);
    cursor.reset_to(9);
    assert_eq!(**cursor.load().unwrap(), 90);
    drop(cursor);

    let removed = locked.remove(9).unwrap();
    assert_eq!(**removed, 90);
    drop(removed);
    assert!(locked.load(9).is_none());
    drop(locked);

    let guard = pin();
    assert_eq!(**xa.load(&guard, 10).unwrap(), 100);
}

#[test]
fn test_find_conflict() {
    let xa: XArray<Arc<u64>> = XArray::new();
    {
        let guard = pin();
        xa.store(&guard, 10, Arc::new(10));
    }

    let mut locked = xa.lock();

    // The occupied range reports its entry.
    let mut cursor = locked.cursor_mut_order(8, 2);
    let conflict = cursor.find_conflict().unwrap();
    assert_eq!(**conflict, 10);
    drop(cursor);

    // A vacant range reports none, and the cursor is left positioned so
    // that the store covers the whole range.
    let mut cursor = locked.cursor_mut_order(16, 2);
    assert!(cursor.find_conflict().is_none());
    cursor.store(Arc::new(16));
    drop(cursor);
    drop(locked);

    let guard = pin();
    for index in 16..=19 {
        assert_eq!(**xa.load(&guard, index).unwrap(), 16);
    }
    assert!(xa.load(&guard, 20).is_none());
}

#[test]
fn test_create_range() {
    let xa: XArray<Arc<u64>> = XArray::new();

    let mut locked = xa.lock();
    let mut cursor = locked.cursor_mut_order(0, 6);
    cursor.create_range().unwrap();
    drop(cursor);
    drop(locked);

    // Every slot of the range now exists, so stores into it need no
    // further allocation.
    let guard = pin();
    let before = test_hooks::nowait_failures();
    test_hooks::fail_next_nowait(usize::MAX);
    xa.store(&guard, 5, Arc::new(5));
    xa.store(&guard, 63, Arc::new(63));
    test_hooks::fail_next_nowait(0);
    assert_eq!(test_hooks::nowait_failures(), before);

    assert_eq!(**xa.load(&guard, 5).unwrap(), 5);
    assert_eq!(**xa.load(&guard, 63).unwrap(), 63);
}

#[test]
fn test_store_recovers_from_refused_allocation() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let guard = pin();

    let before = test_hooks::nowait_failures();
    test_hooks::fail_next_nowait(1);
    xa.store(&guard, 70, Arc::new(7));

    // Exactly one no-wait allocation was refused; the store recovered by
    // parking a blocking allocation and retrying.
    assert_eq!(test_hooks::nowait_failures(), before + 1);
    assert_eq!(**xa.load(&guard, 70).unwrap(), 7);
}

#[test]
fn test_values() {
    let xa: XArray<XaValue> = XArray::new();
    let guard = pin();

    xa.store(&guard, 0, XaValue::new(0));
    for i in 1..5000u64 {
        xa.store(&guard, i * 11, XaValue::new(i as usize));
    }
    assert_eq!(xa.load(&guard, 0).unwrap().value(), 0);
    for i in 1..5000u64 {
        assert_eq!(xa.load(&guard, i * 11).unwrap().value(), i as usize);
    }

    assert_eq!(xa.erase(&guard, 11).unwrap().value(), 1);
    assert!(xa.load(&guard, 11).is_none());
}

static STATIC_XA: XArray<XaValue> = XArray::new();

#[test]
fn test_static_array() {
    let guard = pin();
    STATIC_XA.store(&guard, 3, XaValue::new(7));
    assert_eq!(STATIC_XA.load(&guard, 3).unwrap().value(), 7);
}

#[test]
fn test_clear() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let guard = pin();
    for i in 0..5000 {
        xa.store(&guard, i, Arc::new(i));
    }

    xa.clear();
    assert!(xa.is_empty());
    assert!(xa.load(&guard, 0).is_none());
    assert!(xa.load(&guard, 4999).is_none());

    // The array is usable again after being cleared.
    xa.store(&guard, 42, Arc::new(1));
    assert_eq!(**xa.load(&guard, 42).unwrap(), 1);
}

#[test]
fn test_drop_releases_items() {
    static INIT: AtomicU64 = AtomicU64::new(0);
    static DROPPED: AtomicU64 = AtomicU64::new(0);

    struct Wrapper;

    impl Wrapper {
        fn new() -> Self {
            INIT.fetch_add(1, Ordering::Relaxed);
            Wrapper
        }
    }

    impl Drop for Wrapper {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }
    }

    let xa: XArray<Arc<Wrapper>> = XArray::new();
    {
        let guard = pin();
        for i in 0..1000 {
            xa.store(&guard, i, Arc::new(Wrapper::new()));
        }
    }
    drop(xa);
    assert_eq!(
        INIT.load(Ordering::Relaxed),
        DROPPED.load(Ordering::Relaxed)
    );
}

#[test]
fn test_clear_reclaims_items() {
    static INIT: AtomicU64 = AtomicU64::new(0);
    static DROPPED: AtomicU64 = AtomicU64::new(0);

    struct Wrapper;

    impl Wrapper {
        fn new() -> Self {
            INIT.fetch_add(1, Ordering::Relaxed);
            Wrapper
        }
    }

    impl Drop for Wrapper {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }
    }

    let xa: XArray<Arc<Wrapper>> = XArray::new();
    {
        let guard = pin();
        for i in 0..1000 {
            xa.store(&guard, i, Arc::new(Wrapper::new()));
        }
    }
    xa.clear();
    assert!(xa.is_empty());

    // The items are reclaimed through the epoch; drive the collector until
    // the deferred drops have run.
    for _ in 0..4096 {
        if DROPPED.load(Ordering::Relaxed) == INIT.load(Ordering::Relaxed) {
            break;
        }
        pin().flush();
    }
    assert_eq!(
        INIT.load(Ordering::Relaxed),
        DROPPED.load(Ordering::Relaxed)
    );
}

#[test]
fn test_concurrent_load_store() {
    let xa: XArray<Arc<u64>> = XArray::new();

    std::thread::scope(|s| {
        s.spawn(|| {
            for round in 0..1000u64 {
                let guard = pin();
                xa.store(&guard, 5, Arc::new(round));
            }
        });
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    let guard = pin();
                    if let Some(value) = xa.load(&guard, 5) {
                        assert!(**value < 1000);
                    }
                }
            });
        }
    });

    let guard = pin();
    assert_eq!(**xa.load(&guard, 5).unwrap(), 999);
}

#[test]
fn test_concurrent_iteration_with_erase() {
    let xa: XArray<Arc<u64>> = XArray::new();
    {
        let guard = pin();
        for i in 0..100 {
            xa.store(&guard, i, Arc::new(i));
        }
    }

    std::thread::scope(|s| {
        s.spawn(|| {
            let guard = pin();
            let mut last = None;
            for (index, item) in xa.range(&guard, 0..100) {
                // Whatever the interleaving, every observed entry is the
                // one stored at its index, visited at most once and in
                // ascending order.
                assert_eq!(**item, index);
                if let Some(prev) = last {
                    assert!(index > prev);
                }
                last = Some(index);
            }
        });
        s.spawn(|| {
            for i in (1..100).step_by(2) {
                let guard = pin();
                xa.erase(&guard, i);
            }
        });
    });

    let guard = pin();
    for i in (1..100).step_by(2) {
        assert!(xa.load(&guard, i).is_none());
    }
    for i in (0..100).step_by(2) {
        assert_eq!(**xa.load(&guard, i).unwrap(), i);
    }
}

#[test]
fn test_random_against_model() {
    let xa: XArray<Arc<u64>> = XArray::new();
    let mut model: HashMap<u64, u64> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
    let guard = pin();

    for _ in 0..20000 {
        let index = rng.gen_range(0..512u64);
        match rng.gen_range(0..4u32) {
            0 | 1 => {
                let value = rng.gen::<u64>();
                xa.store(&guard, index, Arc::new(value));
                model.insert(index, value);
            }
            2 => {
                let removed = xa.erase(&guard, index).map(|item| **item);
                assert_eq!(removed, model.remove(&index));
            }
            _ => {
                let loaded = xa.load(&guard, index).map(|item| **item);
                assert_eq!(loaded, model.get(&index).copied());
            }
        }
    }

    let mut expected: Vec<(u64, u64)> = model.iter().map(|(&i, &v)| (i, v)).collect();
    expected.sort_unstable();
    let visited: Vec<(u64, u64)> = xa
        .range(&guard, 0..u64::MAX)
        .map(|(i, item)| (i, **item))
        .collect();
    assert_eq!(visited, expected);
}
