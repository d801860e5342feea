//! CONTEXT: Cross-thread tests for the mailbox lock and bitset primitives
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCENARIOS:
//!   - irq_lock_serializes_increments(): counter stays exact under contention
//!   - concurrent_acquire_never_duplicates(): no two threads win the same bit

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use icc_sync::{AtomicBitset, IrqSpinLock, NoIrq};

#[test]
fn irq_lock_serializes_increments() {
    let lock = Arc::new(IrqSpinLock::new(0_u64));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock_irqsave(&NoIrq) += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock_irqsave(&NoIrq), 40_000);
}

#[test]
fn concurrent_acquire_never_duplicates() {
    let set: Arc<AtomicBitset<1>> = Arc::new(AtomicBitset::new(48));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                let mut won = Vec::new();
                while let Some(i) = set.acquire_first_clear() {
                    won.push(i);
                }
                won
            })
        })
        .collect();
    let mut all = HashSet::new();
    for h in handles {
        for i in h.join().unwrap() {
            assert!(all.insert(i), "bit {i} handed out twice");
        }
    }
    assert_eq!(all.len(), 48);
}
