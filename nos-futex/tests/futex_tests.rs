//! Futex tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use nos_futex::{
    EntryRef, FutexError, FutexFlags, FutexSystem, MUTEX_DISABLED, MUTEX_LOCKED, MUTEX_WAITING, Process, SEM_CONTENDED,
    Table, UserMutex, UserSemaphore,
};
use proptest::prelude::*;

fn setup() -> (Arc<FutexSystem>, Process) {
    let system = FutexSystem::new();
    let process = system.spawn_process();
    (system, process)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        thread::sleep(Duration::from_millis(1));
    }
}

// Cheap per-thread jitter so interleavings vary between iterations.
fn jitter(seed: &mut u64) -> u32 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 7;
    *seed ^= *seed << 17;
    (*seed % 4) as u32
}

#[test]
fn test_lock_hand_off_scenario() {
    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();

    // Thread A: fast path on an unlocked word.
    process.mutex_lock(addr, flags, Duration::ZERO).unwrap();
    assert_eq!(process.load(addr).unwrap(), MUTEX_LOCKED);

    thread::scope(|s| {
        let b = s.spawn(|| process.mutex_lock(addr, flags, Duration::ZERO));
        wait_until(|| process.waiters(addr, flags).unwrap() == 1);

        // A releases the way user code does, then hands off.
        let old = process.load(addr).unwrap();
        process.store(addr, old & !MUTEX_LOCKED).unwrap();
        process.mutex_unblock(addr, flags).unwrap();
        assert_eq!(b.join().unwrap(), Ok(()));
    });

    assert_eq!(process.load(addr).unwrap(), MUTEX_LOCKED);
    assert_eq!(process.private_entries(), 0);
}

#[test]
fn test_semaphore_scenario() {
    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();
    process.store(addr, 1).unwrap();

    process.sem_acquire(addr, flags, Duration::ZERO).unwrap();
    assert_eq!(process.load(addr).unwrap(), 0);

    thread::scope(|s| {
        let second = s.spawn(|| process.sem_acquire(addr, flags, Duration::ZERO));
        wait_until(|| process.waiters(addr, flags).unwrap() == 1);
        assert_eq!(process.load(addr).unwrap(), SEM_CONTENDED);

        process.sem_release(addr, flags).unwrap();
        assert_eq!(second.join().unwrap(), Ok(()));
    });

    assert_eq!(process.load(addr).unwrap(), 0);
}

#[test]
fn test_mutual_exclusion_under_contention() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 2_000;

    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let inside = AtomicUsize::new(0);
    let total = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mutex = UserMutex::new(&process, addr, FutexFlags::empty());
                for _ in 0..ITERATIONS {
                    mutex.lock().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    mutex.unlock().unwrap();
                }
            });
        }
    });

    assert_eq!(total.load(Ordering::Relaxed), THREADS * ITERATIONS);
    assert_eq!(process.load(addr).unwrap(), 0);
    assert_eq!(process.private_entries(), 0);
}

#[test]
fn test_no_lost_wakeup_with_random_timing() {
    const THREADS: u64 = 6;
    const ITERATIONS: usize = 500;

    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let done = AtomicUsize::new(0);

    thread::scope(|s| {
        for id in 0..THREADS {
            let (process, done) = (&process, &done);
            s.spawn(move || {
                let mut seed = 0x9E37_79B9_7F4A_7C15 ^ (id + 1);
                let mutex = UserMutex::new(process, addr, FutexFlags::empty());
                for _ in 0..ITERATIONS {
                    mutex.lock().unwrap();
                    for _ in 0..jitter(&mut seed) {
                        thread::yield_now();
                    }
                    mutex.unlock().unwrap();
                    if jitter(&mut seed) == 0 {
                        thread::yield_now();
                    }
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    assert_eq!(done.load(Ordering::SeqCst), THREADS as usize);
    assert_eq!(process.load(addr).unwrap(), 0);
}

#[test]
fn test_timed_out_lockers_race_unlock() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 1_500;

    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let inside = AtomicUsize::new(0);
    let acquired = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let mutex = UserMutex::new(&process, addr, FutexFlags::empty());
                for _ in 0..ITERATIONS {
                    // Waiters give up while unlockers hand off, so some
                    // unblocks find nobody left to take the lock.
                    match mutex.lock_with(FutexFlags::RELATIVE_TIMEOUT, Duration::from_micros(50)) {
                        Ok(()) => {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            acquired.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                            mutex.unlock().unwrap();
                        }
                        Err(FutexError::TimedOut) => {}
                        Err(error) => panic!("unexpected lock error: {}", error),
                    }
                }
            });
        }
    });

    assert!(acquired.load(Ordering::Relaxed) > 0);
    assert_eq!(process.load(addr).unwrap(), 0);
    assert_eq!(process.waiters(addr, FutexFlags::empty()).unwrap(), 0);
    assert_eq!(process.private_entries(), 0);
}

#[test]
fn test_switch_lock_registers_before_release() {
    let (_system, process) = setup();
    let a = process.allocate(1).unwrap();
    let b = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();

    for _ in 0..50 {
        // The switching thread owns A; B is held here.
        process.store(a, MUTEX_LOCKED).unwrap();
        process.store(b, MUTEX_LOCKED).unwrap();

        thread::scope(|s| {
            let switcher = s.spawn(|| process.mutex_switch_lock(a, flags, b, flags, Duration::ZERO));

            wait_until(|| process.load(a).unwrap() & MUTEX_LOCKED == 0);
            // A is already free, so the switcher must already be queued on B.
            assert_eq!(process.waiters(b, flags).unwrap(), 1);

            UserMutex::new(&process, b, flags).unlock().unwrap();
            assert_eq!(switcher.join().unwrap(), Ok(()));
        });

        assert_eq!(process.load(a).unwrap(), 0);
        assert_eq!(process.load(b).unwrap(), MUTEX_LOCKED);
    }
}

#[test]
fn test_switch_lock_wakes_waiter_on_source() {
    let (_system, process) = setup();
    let a = process.allocate(1).unwrap();
    let b = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();
    process.store(a, MUTEX_LOCKED).unwrap();

    thread::scope(|s| {
        let waiter_on_a = s.spawn(|| process.mutex_lock(a, flags, Duration::ZERO));
        wait_until(|| process.waiters(a, flags).unwrap() == 1);

        // B is free: switching acquires it and hands A to the waiter.
        process.mutex_switch_lock(a, flags, b, flags, Duration::ZERO).unwrap();
        assert_eq!(waiter_on_a.join().unwrap(), Ok(()));
    });

    assert_eq!(process.load(a).unwrap(), MUTEX_LOCKED);
    assert_eq!(process.load(b).unwrap(), MUTEX_LOCKED);
}

#[test]
fn test_condition_variable_style_handoff() {
    const ROUNDS: usize = 200;

    let (_system, process) = setup();
    let lock = process.allocate(1).unwrap();
    let gate = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();
    let turn = AtomicUsize::new(0);

    // The gate is never owned: it stays locked so switching to it blocks
    // until someone unblocks it.
    process.store(gate, MUTEX_LOCKED).unwrap();

    thread::scope(|s| {
        for parity in 0..2 {
            let (process, turn) = (&process, &turn);
            s.spawn(move || {
                let mutex = UserMutex::new(process, lock, flags);
                let gate = UserMutex::new(process, gate, flags);
                for _ in 0..ROUNDS {
                    mutex.lock().unwrap();
                    while turn.load(Ordering::SeqCst) % 2 != parity {
                        mutex.switch_to(&gate, FutexFlags::empty(), Duration::ZERO).unwrap();
                        mutex.lock().unwrap();
                    }
                    turn.fetch_add(1, Ordering::SeqCst);
                    process.mutex_unblock(gate.addr(), FutexFlags::UNBLOCK_ALL).unwrap();
                    mutex.unlock().unwrap();
                }
            });
        }
    });

    assert_eq!(turn.load(Ordering::SeqCst), 2 * ROUNDS);
    assert_eq!(process.load(gate).unwrap(), MUTEX_LOCKED);
    assert_eq!(process.load(lock).unwrap(), 0);
}

#[test]
fn test_semaphore_conservation_under_contention() {
    const CONSUMERS: usize = 4;
    const PER_CONSUMER: usize = 300;
    const EXTRA: usize = 7;

    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();

    thread::scope(|s| {
        for _ in 0..CONSUMERS {
            s.spawn(|| {
                let sem = UserSemaphore::new(&process, addr, flags);
                for _ in 0..PER_CONSUMER {
                    sem.acquire().unwrap();
                }
            });
        }
        s.spawn(|| {
            let sem = UserSemaphore::new(&process, addr, flags);
            for i in 0..CONSUMERS * PER_CONSUMER + EXTRA {
                sem.release().unwrap();
                if i % 64 == 0 {
                    thread::yield_now();
                }
            }
        });
    });

    assert_eq!(process.waiters(addr, flags).unwrap(), 0);
    assert_eq!(process.load(addr).unwrap(), EXTRA as i32);
}

#[test]
fn test_shared_mutex_across_processes() {
    let system = FutexSystem::new();
    let first = system.spawn_process();
    let second = system.spawn_process();
    let segment = system.create_segment(1).unwrap();
    let addr = first.map_shared(&segment).unwrap();
    assert_eq!(second.map_shared(&segment).unwrap(), addr);

    let owner = UserMutex::new(&first, addr, FutexFlags::SHARED);
    owner.lock().unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| UserMutex::new(&second, addr, FutexFlags::SHARED).lock());
        wait_until(|| first.waiters(addr, FutexFlags::SHARED).unwrap() == 1);
        assert_eq!(system.shared_entries(), 1);
        owner.unlock().unwrap();
        assert_eq!(blocked.join().unwrap(), Ok(()));
    });

    assert_eq!(first.load(addr).unwrap(), MUTEX_LOCKED);
    assert_eq!(system.shared_entries(), 0);
    assert_eq!(segment.pin_count(), 0);
    assert_eq!(first.private_entries(), 0);
}

#[test]
fn test_private_keys_do_not_cross_processes() {
    let system = FutexSystem::new();
    let first = system.spawn_process();
    let second = system.spawn_process();
    let segment = system.create_segment(1).unwrap();
    let addr = first.map_shared(&segment).unwrap();
    second.map_shared(&segment).unwrap();
    first.store(addr, MUTEX_LOCKED).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            second.mutex_lock(addr, FutexFlags::RELATIVE_TIMEOUT, Duration::from_millis(200))
        });
        wait_until(|| second.waiters(addr, FutexFlags::empty()).unwrap() == 1);

        // Without SHARED the first process looks in its own table.
        assert_eq!(first.waiters(addr, FutexFlags::empty()).unwrap(), 0);
        UserMutex::new(&first, addr, FutexFlags::empty()).unlock().unwrap();
        assert_eq!(blocked.join().unwrap(), Err(FutexError::TimedOut));
    });
}

#[test]
fn test_disabled_mutex_releases_everyone() {
    let (_system, process) = setup();
    let addr = process.allocate(1).unwrap();
    let flags = FutexFlags::empty();
    process.store(addr, MUTEX_LOCKED).unwrap();

    thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|_| s.spawn(|| process.mutex_lock(addr, flags, Duration::ZERO)))
            .collect();
        wait_until(|| process.waiters(addr, flags).unwrap() == 3);

        // Switch to pass-through mode, then release with a hand-off.
        process.store(addr, MUTEX_DISABLED | MUTEX_WAITING).unwrap();
        process.mutex_unblock(addr, flags).unwrap();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    });

    assert_eq!(process.load(addr).unwrap(), MUTEX_DISABLED | MUTEX_LOCKED);
    process.mutex_lock(addr, flags, Duration::ZERO).unwrap();
}

#[test]
fn test_unmapped_word_is_bad_address() {
    let (_system, process) = setup();
    let addr = process.allocate(4).unwrap();
    process.unmap(addr).unwrap();
    let flags = FutexFlags::empty();
    assert_eq!(process.mutex_lock(addr, flags, Duration::ZERO), Err(FutexError::BadAddress));
    assert_eq!(process.mutex_unblock(addr, flags), Err(FutexError::BadAddress));
    assert_eq!(process.sem_acquire(addr, flags, Duration::ZERO), Err(FutexError::BadAddress));
    assert_eq!(process.sem_release(addr, FutexFlags::SHARED), Err(FutexError::BadAddress));
}

#[derive(Debug, Clone)]
enum TableOp {
    Lookup { address: usize, no_insert: bool },
    Release { slot: usize },
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        (0usize..3, any::<bool>()).prop_map(|(a, no_insert)| TableOp::Lookup {
            address: 0x1000 + a * 4,
            no_insert,
        }),
        (0usize..16).prop_map(|slot| TableOp::Release { slot }),
    ]
}

proptest! {
    #[test]
    fn prop_table_keeps_one_entry_per_live_address(ops in prop::collection::vec(table_op(), 1..64)) {
        let table = Table::new();
        let mut held: Vec<EntryRef<'_>> = Vec::new();

        for op in ops {
            match op {
                TableOp::Lookup { address, no_insert } => {
                    let live = held.iter().any(|e| e.address() == address);
                    match table.lookup(address, no_insert, None).unwrap() {
                        Some(entry) => {
                            for other in held.iter().filter(|e| e.address() == address) {
                                prop_assert!(other.same_entry(&entry));
                            }
                            held.push(entry);
                        }
                        None => prop_assert!(no_insert && !live),
                    }
                }
                TableOp::Release { slot } => {
                    if !held.is_empty() {
                        let entry = held.swap_remove(slot % held.len());
                        table.release(Some(entry));
                    }
                }
            }

            let mut live: Vec<usize> = held.iter().map(|e| e.address()).collect();
            live.sort_unstable();
            live.dedup();
            prop_assert_eq!(table.len(), live.len());
            for address in live {
                let count = held.iter().filter(|e| e.address() == address).count();
                let entry = held.iter().find(|e| e.address() == address).unwrap();
                prop_assert_eq!(entry.ref_count() as usize, count);
            }
        }

        drop(held);
        prop_assert!(table.is_empty());
    }

    #[test]
    fn prop_semaphore_counts_round_trip(initial in 0i32..8, ops in prop::collection::vec(any::<bool>(), 0..64)) {
        let (_system, process) = setup();
        let addr = process.allocate(1).unwrap();
        process.store(addr, initial).unwrap();
        let flags = FutexFlags::empty();

        let mut expected = initial;
        for release in ops {
            if release {
                process.sem_release(addr, flags).unwrap();
                expected += 1;
            } else if expected > 0 {
                process.sem_acquire(addr, flags, Duration::ZERO).unwrap();
                expected -= 1;
            }
            prop_assert_eq!(process.load(addr).unwrap(), expected);
        }
        prop_assert_eq!(process.private_entries(), 0);
    }
}
