//! Runs one task body on every worker of a squad and shows which OS thread
//! picked up each index.

use std::sync::Mutex;

use thread_squad::ThreadSquad;

fn main() {
    let mut squad = ThreadSquad::builder()
        .build()
        .expect("default squad configuration is always valid");

    println!("Squad with {} workers.", squad.num_threads());

    let lines = Mutex::new(Vec::new());

    squad
        .run(|ctx| {
            lines.lock().unwrap().push(format!(
                "worker {:>2} of {} on {:?}",
                ctx.thread_index(),
                ctx.num_threads(),
                std::thread::current().id()
            ));
        })
        .expect("forking workers failed");

    let mut lines = lines.into_inner().unwrap();
    lines.sort();
    for line in lines {
        println!("{line}");
    }

    println!("All workers have finished.");
}
