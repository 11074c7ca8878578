//! Cross-thread object pool invariants: bounded totals, clean handoff,
//! leak-free shutdown.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use mediactl_rs::stdx::object_pool::{AcquireError, ObjectPool, PoolConfig, Pooled};

#[test]
fn total_never_exceeds_cap_under_contention() {
    let cap = 48;
    let pool: ObjectPool<u64> = ObjectPool::new(PoolConfig {
        prealloc: 16,
        max_thread_cache: 4,
        dynamic_expansion: true,
        max_total_objects: cap,
    });

    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                let _reg = pool.register_thread();
                let mut held: Vec<Pooled<u64>> = Vec::new();
                for i in 0..5_000u64 {
                    // Grow and shrink a private working set to force both
                    // cache traffic and global-list traffic.
                    match pool.acquire(t * 1_000_000 + i) {
                        Ok(rec) => held.push(rec),
                        Err(AcquireError::Exhausted) => {
                            held.clear();
                        }
                        Err(err) => panic!("unexpected acquire error: {err}"),
                    }
                    if held.len() > 4 {
                        held.truncate(2);
                    }
                    assert!(pool.total_records() <= cap);
                }
            })
        })
        .collect();
    for th in threads {
        th.join().expect("churn thread");
    }

    assert!(pool.total_records() <= cap);
    pool.shutdown();
    drop(pool); // leak assertion runs here
}

#[test]
fn records_survive_round_trips_between_threads() {
    let pool: ObjectPool<String> = ObjectPool::new(PoolConfig {
        prealloc: 8,
        max_thread_cache: 2,
        dynamic_expansion: false,
        max_total_objects: 8,
    });

    let (to_worker, from_main) = mpsc::channel::<Pooled<String>>();
    let (to_main, from_worker) = mpsc::channel::<Pooled<String>>();

    let worker = {
        let pool = pool.clone();
        thread::spawn(move || {
            let _reg = pool.register_thread();
            // Echo every record back after inspecting it; drop the channel
            // when the main side hangs up.
            while let Ok(mut rec) = from_main.recv() {
                rec.push('!');
                to_main.send(rec).expect("echo");
            }
        })
    };

    {
        let _reg = pool.register_thread();
        for round in 0..200 {
            let rec = pool
                .acquire(format!("msg-{round}"))
                .expect("inventory is large enough");
            to_worker.send(rec).expect("send");
            let rec = from_worker.recv().expect("recv");
            assert_eq!(*rec, format!("msg-{round}!"));
            drop(rec);
            assert_eq!(pool.total_records(), 8);
        }
        drop(to_worker);
    }
    worker.join().expect("worker");

    pool.shutdown();
    drop(pool);
}

#[test]
fn exhaustion_boundary_holds_across_threads() {
    let pool: ObjectPool<u32> = ObjectPool::new(PoolConfig {
        prealloc: 4,
        max_thread_cache: 4,
        dynamic_expansion: false,
        max_total_objects: 4,
    });

    // Park all four records on another thread.
    let (hand_over, receive) = mpsc::channel::<Vec<Pooled<u32>>>();
    let (checked_tx, checked_rx) = mpsc::channel::<()>();
    let holder = {
        let pool = pool.clone();
        thread::spawn(move || {
            let _reg = pool.register_thread();
            let held = receive.recv().expect("records");
            // Hold everything until the main thread has seen Exhausted.
            checked_rx.recv().expect("checked");
            drop(held);
        })
    };

    {
        let _reg = pool.register_thread();
        let held: Vec<_> = (0..4).map(|i| pool.acquire(i).expect("acquire")).collect();
        hand_over.send(held).expect("hand over");

        // While the other thread holds everything, the (prealloc+1)th
        // acquire must fail.
        assert_eq!(pool.acquire(9).unwrap_err(), AcquireError::Exhausted);
        checked_tx.send(()).expect("signal");
        holder.join().expect("holder");

        // Records released remotely are reachable again.
        let again: Vec<_> = (0..4).map(|i| pool.acquire(i).expect("acquire")).collect();
        assert_eq!(again.len(), 4);
    }

    pool.shutdown();
    drop(pool);
}

#[test]
fn guards_drain_caches_for_clean_destruction() {
    let pool: ObjectPool<[u8; 64]> = ObjectPool::new(PoolConfig {
        prealloc: 64,
        max_thread_cache: 16,
        dynamic_expansion: false,
        max_total_objects: 64,
    });

    // Threads leave records in their caches on purpose; the guard drop must
    // hand every one of them back to the global list.
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                let _reg = pool.register_thread();
                let held: Vec<_> = (0..16)
                    .map(|_| pool.acquire([0u8; 64]).expect("acquire"))
                    .collect();
                drop(held); // fills this thread's cache
            })
        })
        .collect();
    for th in threads {
        th.join().expect("cache thread");
    }

    // If any record were stranded in a dead thread's cache, this would
    // either fail to find all 64 or panic on drop.
    {
        let _reg = pool.register_thread();
        let all: Vec<_> = (0..64)
            .map(|_| pool.acquire([1u8; 64]).expect("acquire"))
            .collect();
        assert_eq!(all.len(), 64);
    }

    pool.shutdown();
    drop(pool);
}

#[test]
fn shared_handles_do_not_extend_shutdown() {
    // shutdown() must not deadlock when other handles (clones) still exist,
    // only when threads are still registered.
    let pool: ObjectPool<u8> = ObjectPool::new(PoolConfig {
        prealloc: 2,
        max_thread_cache: 2,
        dynamic_expansion: false,
        max_total_objects: 2,
    });
    let extra_handle = pool.clone();
    let shared = Arc::new(pool);

    shared.shutdown();
    drop(extra_handle);
    drop(shared);
}
