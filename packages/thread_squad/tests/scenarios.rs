//! End-to-end scenarios exercising the full dispatch, completion and
//! reduction protocol, in both wait modes where it matters.

use std::sync::atomic::{AtomicUsize, Ordering};

use thread_squad::ThreadSquad;

fn make_squad(num_threads: usize, spin_wait: bool) -> ThreadSquad {
    ThreadSquad::builder()
        .num_threads(num_threads)
        .spin_wait(spin_wait)
        .build()
        .unwrap()
}

#[test]
fn fan_out_reaches_every_worker() {
    for spin_wait in [false, true] {
        let mut squad = make_squad(17, spin_wait);
        let out: Vec<AtomicUsize> = (0..17).map(|_| AtomicUsize::new(0)).collect();

        squad
            .run(|ctx| {
                assert_eq!(ctx.num_threads(), 17);
                out[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        for (index, slot) in out.iter().enumerate() {
            assert_eq!(
                slot.load(Ordering::Relaxed),
                1,
                "spin_wait = {spin_wait}: worker {index} ran {} times",
                slot.load(Ordering::Relaxed)
            );
        }
    }
}

#[test]
fn partial_concurrency_leaves_the_tail_untouched() {
    let mut squad = make_squad(8, false);
    let out: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();

    squad
        .run_on(3, |ctx| {
            assert_eq!(ctx.num_threads(), 3);
            assert!(ctx.thread_index() < 3);
            out[ctx.thread_index()].store(ctx.thread_index() + 1, Ordering::Relaxed);
        })
        .unwrap();

    let values: Vec<usize> = out.iter().map(|slot| slot.load(Ordering::Relaxed)).collect();
    assert_eq!(values, vec![1, 2, 3, 0, 0, 0, 0, 0]);
}

#[test]
fn transform_reduce_seeds_the_accumulator() {
    for spin_wait in [false, true] {
        let mut squad = make_squad(10, spin_wait);

        // Workers contribute 1 + 2 + … + 10 = 55 on top of the seed.
        let result = squad
            .transform_reduce(|ctx| ctx.thread_index() + 1, 100, |a, b| a + b)
            .unwrap();

        assert_eq!(result, 155, "spin_wait = {spin_wait}");
    }
}

#[test]
fn in_task_barrier_orders_all_writes() {
    for spin_wait in [false, true] {
        let mut squad = make_squad(4, spin_wait);
        let counter = AtomicUsize::new(0);
        let seen: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        squad
            .run(|ctx| {
                counter.fetch_add(1, Ordering::Relaxed);
                ctx.sync();
                seen[ctx.thread_index()].store(counter.load(Ordering::Relaxed), Ordering::Relaxed);
            })
            .unwrap();

        for slot in &seen {
            assert_eq!(slot.load(Ordering::Relaxed), 4, "spin_wait = {spin_wait}");
        }
    }
}

#[test]
fn in_task_reduce_transform_broadcasts_to_all() {
    let mut squad = make_squad(3, false);
    let results: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();

    squad
        .run(|ctx| {
            let contributions = [2_usize, 3, 5];
            let product_plus_one = ctx.reduce_transform(
                contributions[ctx.thread_index()],
                |a, b| a * b,
                |product| product + 1,
            );
            results[ctx.thread_index()].store(product_plus_one, Ordering::Relaxed);
        })
        .unwrap();

    for slot in &results {
        assert_eq!(slot.load(Ordering::Relaxed), 31);
    }
}

#[test]
fn in_task_reduce_runs_repeatedly() {
    let mut squad = make_squad(5, false);

    squad
        .run(|ctx| {
            for round in 0..10 {
                let total = ctx.reduce(round + ctx.thread_index(), |a, b| a.max(b));
                assert_eq!(total, round + 4);
            }
        })
        .unwrap();
}

#[test]
fn teardown_without_prior_run() {
    let squad = make_squad(4, false);
    drop(squad);
}

#[test]
fn run_and_join_completes_the_last_task() {
    let squad = make_squad(6, false);
    let out: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();

    squad
        .run_and_join(|ctx| {
            out[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    for slot in &out {
        assert_eq!(slot.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn varying_concurrency_counts_every_invocation() {
    let mut squad = make_squad(7, false);
    let count = AtomicUsize::new(0);

    for concurrency in 1..=7 {
        squad
            .run_on(concurrency, |_ctx| {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    assert_eq!(count.load(Ordering::Relaxed), 7 * 8 / 2);
}

#[test]
fn many_back_to_back_dispatches() {
    for spin_wait in [false, true] {
        let mut squad = make_squad(4, spin_wait);
        let count = AtomicUsize::new(0);

        for _ in 0..200 {
            squad
                .run(|_ctx| {
                    count.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }

        assert_eq!(count.load(Ordering::Relaxed), 800, "spin_wait = {spin_wait}");
    }
}

#[test]
fn single_worker_squad_still_reduces() {
    let mut squad = make_squad(1, false);

    let result = squad
        .transform_reduce(|ctx| ctx.thread_index() + 7, 1, |a, b| a + b)
        .unwrap();

    assert_eq!(result, 8);

    squad
        .run(|ctx| {
            ctx.sync();
            assert_eq!(ctx.reduce(3, |a, b| a + b), 3);
        })
        .unwrap();
}

#[test]
fn reduction_with_non_copy_values() {
    let mut squad = make_squad(4, false);

    let result = squad
        .transform_reduce(
            |ctx| vec![ctx.thread_index()],
            Vec::new(),
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
        )
        .unwrap();

    // Merge order follows the tree, which for 4 workers is index order.
    assert_eq!(result, vec![0, 1, 2, 3]);
}

#[test]
fn oversubscribed_squad_makes_progress() {
    // More workers than the machine has hardware threads.
    let num_threads = 2 * num_cpus::get() + 1;
    let mut squad = make_squad(num_threads, false);
    let count = AtomicUsize::new(0);

    squad
        .run(|_ctx| {
            count.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    assert_eq!(count.load(Ordering::Relaxed), num_threads);
}
