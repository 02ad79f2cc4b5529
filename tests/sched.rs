/*
 * Scheduler behaviour: spawn/join/detach, yielding, staging adoption of
 * background fibres, migration between clusters, and pause/resume.
 */

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::run_fibre;
use strand::{Cluster, Fibre, Priority};

#[test]
fn spawn_join_many() {
    const COUNT: usize = 400;

    let done = run_fibre(|| {
        let done = Arc::new(AtomicUsize::new(0));
        let handles: Vec<Fibre> = (0..COUNT)
            .map(|_| {
                let done = Arc::clone(&done);
                Fibre::spawn(move || {
                    strand::yield_now();
                    done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        done.load(Ordering::Relaxed)
    });
    assert_eq!(done, COUNT);
}

#[test]
fn detached_fibres_complete() {
    let observed = run_fibre(|| {
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = Arc::clone(&done);
            Fibre::spawn(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .detach();
        }
        while done.load(Ordering::Relaxed) < 50 {
            strand::yield_global();
        }
        done.load(Ordering::Relaxed)
    });
    assert_eq!(observed, 50);
}

#[test]
fn repeated_yield_terminates() {
    let yields = run_fibre(|| {
        let mut taken = 0usize;
        for _ in 0..1_000 {
            if strand::yield_now() {
                taken += 1;
            }
        }
        taken
    });
    // Whether anything was runnable locally is schedule-dependent; the
    // call itself must simply come back every time.
    assert!(yields <= 1_000);
}

#[test]
fn background_fibre_is_adopted_from_staging() {
    let ok = run_fibre(|| {
        let handle = Fibre::builder()
            .background(true)
            .spawn(|| {
                strand::yield_now();
            });
        handle.join();
        true
    });
    assert!(ok);
}

#[test]
fn priorities_and_stack_sizes_spawn() {
    let ok = run_fibre(|| {
        let top = Fibre::builder()
            .priority(Priority::Top)
            .stack_size(128 * 1024)
            .spawn(|| {});
        let low = Fibre::builder().priority(Priority::Low).spawn(|| {});
        top.join();
        low.join();
        true
    });
    assert!(ok);
}

#[test]
fn migrate_to_second_cluster_and_back() {
    let ok = run_fibre(|| {
        let main_cluster = strand::default_scope().unwrap().main_cluster();
        let second = Cluster::new();
        second.add_workers(1);
        // Give the new worker a moment to come online.
        strand::sleep(Duration::from_millis(10));

        strand::migrate_to_cluster(second);
        let away = second.worker_count();
        strand::migrate_to_cluster(main_cluster);
        away == 1
    });
    assert!(ok);
}

#[test]
fn pause_freezes_other_workers() {
    let ran_during_pause = run_fibre(|| {
        let cluster = strand::default_scope().unwrap().main_cluster();
        let marker = Arc::new(AtomicUsize::new(0));

        cluster.pause();
        let probe = {
            let marker = Arc::clone(&marker);
            Fibre::spawn(move || {
                marker.fetch_add(1, Ordering::SeqCst);
            })
        };
        // All other workers are held; nothing can run the probe. (The
        // pausing fibre keeps its own worker busy right here.)
        std::thread::sleep(Duration::from_millis(50));
        let during = marker.load(Ordering::SeqCst);
        cluster.resume();
        probe.join();
        let after = marker.load(Ordering::SeqCst);
        assert_eq!(after, 1);
        during
    });
    assert_eq!(ran_during_pause, 0);
}

#[test]
fn worker_ids_reported() {
    let (count, ids) = run_fibre(|| {
        let cluster = strand::default_scope().unwrap().main_cluster();
        (cluster.worker_count(), cluster.worker_ids())
    });
    assert_eq!(count, common::TEST_WORKERS);
    assert_eq!(ids.len(), common::TEST_WORKERS);
}
