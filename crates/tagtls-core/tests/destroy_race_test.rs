mod support;

use std::sync::{Arc, Barrier};
use std::thread;

use support::{DisposalLog, disposal_log, init_test_worker, recording, sorted, store};
use tagtls_core::{DisposalMode, SlotHandle, Tag, declare_tag};

declare_tag! {
    struct RaceTag;
}

declare_tag! {
    struct OrderTag;
}

declare_tag! {
    struct ChurnTag;
}

const WORKERS: u32 = 8;

fn assert_each_value_disposed_once(log: &DisposalLog) {
    let values: Vec<u32> = sorted(log).into_iter().map(|(value, _)| value).collect();
    let expected: Vec<u32> = (0..WORKERS).collect();
    assert_eq!(values, expected);
}

#[test]
fn destroy_racing_thread_exit_disposes_each_value_once() {
    init_test_worker();
    let registry = RaceTag::registry();

    for _round in 0..50 {
        let handle = Arc::new(SlotHandle::new());
        let log = disposal_log();
        let ready = Arc::new(Barrier::new(WORKERS as usize + 1));

        let workers: Vec<_> = (0..WORKERS)
            .map(|n| {
                let (handle, log, ready) = (Arc::clone(&handle), Arc::clone(&log), Arc::clone(&ready));
                thread::spawn(move || {
                    store(registry, &handle, recording(n, &log));
                    ready.wait();
                })
            })
            .collect();

        ready.wait();
        let destroyed = registry.destroy(&handle);
        for worker in workers {
            worker.join().unwrap();
        }

        assert_each_value_disposed_once(&log);
        let by_destroy = log
            .lock()
            .iter()
            .filter(|(_, mode)| *mode == DisposalMode::AllThreads)
            .count();
        assert_eq!(by_destroy, destroyed);
    }
}

#[test]
fn destroy_before_exit_disposes_in_all_threads_mode() {
    init_test_worker();
    let registry = OrderTag::registry();
    let handle = Arc::new(SlotHandle::new());
    let log = disposal_log();
    let stored = Arc::new(Barrier::new(WORKERS as usize + 1));
    let release = Arc::new(Barrier::new(WORKERS as usize + 1));

    let workers: Vec<_> = (0..WORKERS)
        .map(|n| {
            let (handle, log) = (Arc::clone(&handle), Arc::clone(&log));
            let (stored, release) = (Arc::clone(&stored), Arc::clone(&release));
            thread::spawn(move || {
                store(registry, &handle, recording(n, &log));
                stored.wait();
                release.wait();
            })
        })
        .collect();

    stored.wait();
    assert_eq!(registry.destroy(&handle), WORKERS as usize);
    release.wait();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_each_value_disposed_once(&log);
    assert!(log.lock().iter().all(|(_, mode)| *mode == DisposalMode::AllThreads));
}

#[test]
fn exit_before_destroy_leaves_nothing_to_destroy() {
    init_test_worker();
    let registry = OrderTag::registry();
    let handle = Arc::new(SlotHandle::new());
    let log = disposal_log();

    let workers: Vec<_> = (0..WORKERS)
        .map(|n| {
            let (handle, log) = (Arc::clone(&handle), Arc::clone(&log));
            thread::spawn(move || store(registry, &handle, recording(n, &log)))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(registry.destroy(&handle), 0);
    assert_each_value_disposed_once(&log);
    assert!(log.lock().iter().all(|(_, mode)| *mode == DisposalMode::ThisThread));
}

#[test]
fn slot_churn_across_threads_keeps_registry_consistent() {
    init_test_worker();
    let registry = ChurnTag::registry();
    let log = disposal_log();
    let start = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4_u32)
        .map(|worker| {
            let (log, start) = (Arc::clone(&log), Arc::clone(&start));
            thread::spawn(move || {
                start.wait();
                for round in 0..200_u32 {
                    let handle = SlotHandle::new();
                    store(registry, &handle, recording(worker * 1000 + round, &log));
                    assert_eq!(registry.destroy(&handle), 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let entries = log.lock();
    assert_eq!(entries.len(), 800);
    assert!(entries.iter().all(|(_, mode)| *mode == DisposalMode::AllThreads));
    drop(entries);

    let stats = registry.stats();
    assert_eq!(stats.live_blocks, 0);
    assert!(stats.free_ids >= 1);
    assert!(stats.next_id - 1 <= 4, "ids are recycled instead of minted");
}
