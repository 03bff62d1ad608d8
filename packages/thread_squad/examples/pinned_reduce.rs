//! Pins one worker to each physical core (skipping SMT siblings) and runs an
//! in-task reduction across them.

use thread_squad::{hardware, ThreadSquad};

fn main() {
    let core_ids = hardware::physical_core_ids();
    if core_ids.is_empty() {
        eprintln!("Hardware thread enumeration is not supported here; not pinning.");
        return;
    }

    println!(
        "{} physical cores, pinning to hardware threads {core_ids:?}.",
        hardware::physical_concurrency()
    );

    let mut squad = ThreadSquad::builder()
        .num_threads(core_ids.len())
        .pin_to_hardware_threads(true)
        .hardware_thread_mappings(core_ids)
        .spin_wait(true)
        .build()
        .expect("pinning to enumerated hardware threads must be possible");

    let sum = squad
        .transform_reduce(|ctx| ctx.thread_index() + 1, 0, |a, b| a + b)
        .expect("forking workers failed");

    let n = squad.num_threads();
    println!("Sum of 1..={n} computed across pinned workers: {sum}");
    assert_eq!(sum, n * (n + 1) / 2);
}
