//! A reusable, fixed-size squad of worker threads for data-parallel tasks
//! with fast fork/join semantics and in-task collective reductions.
//!
//! # Why a squad and not a task queue?
//!
//! General-purpose thread pools optimize for throughput of many independent
//! tasks. A squad optimizes for the opposite corner: the *same* set of
//! workers runs the *same* task body over and over, and the cost that
//! matters is how quickly all of them can be started and collected again.
//! This shape is common in iterative numeric code, where a parallel region
//! runs thousands of times and the per-invocation work can be microseconds.
//!
//! To keep that launch latency low, the squad coordinates through per-worker
//! single-bit sense flags arranged as a tree with fan-out 8: the driver wakes
//! worker 0, worker 0 wakes the heads of its subtrees, and so on, so both
//! dispatch and completion cost grow logarithmically with the worker count.
//! Workers can optionally spin between tasks (with pause-instruction pacing
//! and an OS-wait fallback) and can be pinned to hardware threads.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use thread_squad::ThreadSquad;
//!
//! let mut squad = ThreadSquad::builder().num_threads(4).build().unwrap();
//!
//! // Every worker runs the task body once.
//! let histogram: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
//! squad.run(|ctx| {
//!     histogram[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
//! }).unwrap();
//! assert!(histogram.iter().all(|slot| slot.load(Ordering::Relaxed) == 1));
//!
//! // Per-worker values reduce along the synchronization tree.
//! let sum = squad
//!     .transform_reduce(|ctx| ctx.thread_index(), 0, |a, b| a + b)
//!     .unwrap();
//! assert_eq!(sum, 6);
//! ```
//!
//! # Collectives inside a task
//!
//! A task body can synchronize with the other workers mid-task through its
//! [`TaskContext`]: a plain barrier ([`TaskContext::sync`]) or a reduction
//! over per-worker values ([`TaskContext::reduce`],
//! [`TaskContext::reduce_transform`]). Collectives use a dedicated pair of
//! sense flags per worker, so a single task invocation can run any number of
//! them.
//!
//! ```rust
//! use thread_squad::ThreadSquad;
//!
//! let mut squad = ThreadSquad::builder().num_threads(3).build().unwrap();
//!
//! squad.run(|ctx| {
//!     let total = ctx.reduce(ctx.thread_index() + 1, |a, b| a + b);
//!     assert_eq!(total, 1 + 2 + 3);
//! }).unwrap();
//! ```
//!
//! # Teardown
//!
//! Dropping the squad dispatches a final join-requested task: every worker
//! wakes, exits its loop and the OS threads are joined bottom-up along the
//! tree. [`ThreadSquad::run_and_join`] folds that teardown into the last
//! useful task.
//!
//! # Panics
//!
//! A panic escaping a task body or a user-supplied reduction operator aborts
//! the process, like the parallel standard algorithms: the squad cannot
//! express a half-completed parallel region. Route recoverable failures
//! through state captured by the task closure instead.

mod context;
mod error;
mod record;
mod squad;
mod task;
mod topology;
mod wait;

pub mod hardware;

pub use context::TaskContext;
pub use error::*;
pub use squad::{ThreadSquad, ThreadSquadBuilder};
