/*
 * Timer behaviour: sleep deadlines are honoured, expiry is ordered, and
 * timed waits interleave correctly with many concurrent sleepers.
 */

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::run_fibre;
use strand::Fibre;

#[test]
fn sleep_wakes_at_or_after_deadline() {
    let (requested, elapsed) = run_fibre(|| {
        let requested = Duration::from_millis(50);
        let start = Instant::now();
        strand::sleep(requested);
        (requested, start.elapsed())
    });
    assert!(elapsed >= requested, "woke early: {:?}", elapsed);
    assert!(elapsed < requested + Duration::from_millis(500), "woke far too late: {:?}", elapsed);
}

#[test]
fn many_sleepers_all_wake_on_time() {
    const SLEEPERS: usize = 100;

    let late = run_fibre(|| {
        let results = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handles: Vec<Fibre> = (0..SLEEPERS)
            .map(|i| {
                let results = Arc::clone(&results);
                Fibre::spawn(move || {
                    // Deterministic spread over 1..=100 ms.
                    let d = Duration::from_millis(1 + (i as u64 * 7) % 100);
                    let start = Instant::now();
                    strand::sleep(d);
                    results.lock().unwrap().push((d, start.elapsed()));
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        let results = results.lock().unwrap();
        assert_eq!(results.len(), SLEEPERS);
        results
            .iter()
            .filter(|(want, got)| got < want)
            .count()
    });
    assert_eq!(late, 0, "{} sleepers woke before their deadline", late);
}

#[test]
fn sleeping_fibres_do_not_block_others() {
    let elapsed = run_fibre(|| {
        let sleeper = Fibre::spawn(|| strand::sleep(Duration::from_millis(200)));
        let start = Instant::now();
        // Runnable work proceeds while the sleeper is parked.
        let busy = Fibre::spawn(|| {
            for _ in 0..100 {
                strand::yield_now();
            }
        });
        busy.join();
        let busy_elapsed = start.elapsed();
        sleeper.join();
        busy_elapsed
    });
    assert!(elapsed < Duration::from_millis(200), "busy work waited on the sleeper");
}

#[test]
fn zero_length_sleep_completes() {
    let ok = run_fibre(|| {
        strand::sleep(Duration::ZERO);
        true
    });
    assert!(ok);
}
