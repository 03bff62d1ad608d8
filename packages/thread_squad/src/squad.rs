//! Squad lifecycle and the driver/worker protocol.
//!
//! The squad owns one record per worker (see [`crate::record`]) plus the
//! shared task slot. The driver dispatches a task by installing it into the
//! slot and flipping worker 0's `incoming`; worker 0 fans the notification
//! out along the tree, every worker within the task's concurrency runs the
//! body, and completion climbs back up through the `outgoing` flags with the
//! per-level merges folded in along the way. The driver's own wait always
//! parks on the OS so it never competes with the workers for CPU.
//!
//! The dispatch chain addresses all workers on every pass, whatever the
//! task's concurrency: workers outside the concurrency skip the body but
//! still relay notifications and completions, which keeps every worker's
//! sense flags in lockstep and bounds the task borrow's validity window for
//! the whole squad (see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::context::TaskContext;
use crate::record::WorkerRecord;
use crate::task::{
    AbortOnUnwind, ActionTask, Task, TaskSlot, TeardownTask, TransformReduceTask, ValueSlot,
};
use crate::topology;
use crate::wait::WaitMode;
use crate::{Error, Result};

static NEXT_SQUAD_ID: AtomicU64 = AtomicU64::new(0);

/// State shared between the driver and all worker threads.
pub(crate) struct SquadShared {
    squad_id: u64,
    wait_mode: WaitMode,
    workers: Box<[CachePadded<WorkerRecord>]>,

    /// Hardware thread to pin each worker to; `None` leaves it unpinned.
    pin_targets: Box<[Option<core_affinity::CoreId>]>,

    task: TaskSlot,
}

impl SquadShared {
    pub(crate) fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    pub(crate) fn workers(&self) -> &[CachePadded<WorkerRecord>] {
        &self.workers
    }
}

/// One full pass of the worker loop body; returns whether the worker should
/// exit afterwards.
fn run_one_pass(shared: &SquadShared, index: usize, pass: u32, mode: WaitMode) -> bool {
    let record = &shared.workers[index];

    record.await_incoming(mode);

    // SAFETY: the driver installed the task before the dispatch flip we just
    // observed, and keeps it installed until the completion climb drains.
    let task = unsafe { shared.task.get() };
    let params = task.params();
    let limit = shared.num_threads();

    // On the fork pass the driver pre-flipped every worker's `incoming`
    // before any OS thread existed; afterwards each parent relays.
    if pass > 0 {
        topology::for_each_child_top_down(index, record.num_subthreads, limit, &mut |child| {
            shared.workers[child].post_incoming();
        });
    }

    {
        let _abort_on_unwind = AbortOnUnwind;

        if index < params.concurrency {
            let mut ctx = TaskContext::new(shared, index, params.concurrency);
            task.execute(&mut ctx);
        }

        topology::for_each_child_bottom_up(index, record.num_subthreads, limit, &mut |child| {
            shared.workers[child].await_outgoing(mode);
            task.merge(index, child);
        });
    }

    record.post_outgoing();

    if params.join_requested {
        topology::for_each_child_bottom_up(index, record.num_subthreads, limit, &mut |child| {
            shared.workers[child].join_os_thread();
        });
        return true;
    }

    false
}

fn worker_main(shared: &SquadShared, index: usize) {
    if let Some(core) = shared.pin_targets[index] {
        // The target was validated at build time; a refusal here leaves the
        // thread unpinned.
        if !core_affinity::set_for_current(core) {
            debug!(
                squad_id = shared.squad_id,
                index,
                core = core.id,
                "hardware thread refused the pin"
            );
        }
    }

    debug!(squad_id = shared.squad_id, index, "worker thread started");

    let mode = shared.wait_mode;
    let mut pass: u32 = 0;

    loop {
        if run_one_pass(shared, index, pass, mode) {
            break;
        }
        pass = pass.saturating_add(1);
    }

    debug!(squad_id = shared.squad_id, index, "worker thread exiting");
}

/// A reusable, fixed-size squad of worker threads for data-parallel tasks
/// with fork/join semantics.
///
/// The squad is built once and then drives any number of tasks over the same
/// set of OS threads; between tasks the workers park in an adaptive wait, so
/// repeated dispatch is cheap. Coordination runs over per-worker sense flags
/// arranged as a tree with fan-out 8, making dispatch and completion cost
/// logarithmic in the worker count.
///
/// # Lifecycle
///
/// Worker OS threads are forked on the first task and live until teardown.
/// Dropping the squad (or calling [`ThreadSquad::run_and_join`]) dispatches
/// a final join-requested task that makes every worker exit; the OS threads
/// are joined bottom-up along the tree.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let mut squad = thread_squad::ThreadSquad::builder()
///     .num_threads(4)
///     .build()
///     .unwrap();
///
/// let counter = AtomicUsize::new(0);
///
/// squad.run(|_ctx| {
///     counter.fetch_add(1, Ordering::Relaxed);
/// }).unwrap();
///
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
///
/// # Panics
///
/// A panic escaping a task body (or a user-supplied reduction operator)
/// aborts the process: the squad cannot express a half-completed pass.
#[derive(Debug)]
pub struct ThreadSquad {
    shared: Arc<SquadShared>,
    forked: bool,
    defunct: bool,
}

impl std::fmt::Debug for SquadShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquadShared")
            .field("squad_id", &self.squad_id)
            .field("num_threads", &self.workers.len())
            .field("wait_mode", &self.wait_mode)
            .finish_non_exhaustive()
    }
}

impl ThreadSquad {
    /// Creates a builder for configuring a squad.
    #[must_use]
    pub fn builder() -> ThreadSquadBuilder {
        ThreadSquadBuilder::new()
    }

    /// The number of worker threads in the squad.
    #[must_use]
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.shared.num_threads()
    }

    /// Runs `action` once on every worker and waits for all of them to
    /// finish.
    pub fn run<F>(&mut self, action: F) -> Result<()>
    where
        F: Fn(&mut TaskContext<'_>) + Sync,
    {
        self.run_on(self.num_threads(), action)
    }

    /// Runs `action` once on each of the first `concurrency` workers and
    /// waits for all of them to finish.
    ///
    /// With `concurrency == 0` this is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` exceeds [`ThreadSquad::num_threads`].
    pub fn run_on<F>(&mut self, concurrency: usize, action: F) -> Result<()>
    where
        F: Fn(&mut TaskContext<'_>) + Sync,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds the squad's thread count"
        );

        let task = ActionTask::new(&action, concurrency, false);
        self.run_task(&task)
    }

    /// Runs `action` once on every worker, waits for all of them to finish
    /// and tears the squad down.
    pub fn run_and_join<F>(self, action: F) -> Result<()>
    where
        F: Fn(&mut TaskContext<'_>) + Sync,
    {
        let concurrency = self.num_threads();
        self.run_and_join_on(concurrency, action)
    }

    /// Runs `action` once on each of the first `concurrency` workers, waits
    /// for all of them to finish and tears the squad down.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` exceeds [`ThreadSquad::num_threads`].
    pub fn run_and_join_on<F>(mut self, concurrency: usize, action: F) -> Result<()>
    where
        F: Fn(&mut TaskContext<'_>) + Sync,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds the squad's thread count"
        );

        let task = ActionTask::new(&action, concurrency, true);
        self.run_task(&task)
    }

    /// Runs `transform` once on every worker and folds the per-worker
    /// results pairwise with `reduce`, starting from `init`.
    ///
    /// Results fold along the synchronization tree, so with an associative
    /// `reduce` the outcome equals the sequential left-fold over the workers
    /// in index order, seeded with `init`.
    pub fn transform_reduce<T, F, O>(&mut self, transform: F, init: T, reduce: O) -> Result<T>
    where
        F: Fn(&mut TaskContext<'_>) -> T + Sync,
        O: Fn(T, T) -> T + Sync,
        T: Send,
    {
        self.transform_reduce_on(self.num_threads(), transform, init, reduce)
    }

    /// Like [`ThreadSquad::transform_reduce`], but only the first
    /// `concurrency` workers contribute. With `concurrency == 0` the result
    /// is `init`.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` exceeds [`ThreadSquad::num_threads`].
    pub fn transform_reduce_on<T, F, O>(
        &mut self,
        concurrency: usize,
        transform: F,
        init: T,
        reduce: O,
    ) -> Result<T>
    where
        F: Fn(&mut TaskContext<'_>) -> T + Sync,
        O: Fn(T, T) -> T + Sync,
        T: Send,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds the squad's thread count"
        );

        let slots: Vec<ValueSlot<T>> = (0..concurrency).map(|_| ValueSlot::new()).collect();
        let task = TransformReduceTask::new(&transform, &reduce, &slots, false);
        self.run_task(&task)?;

        if concurrency == 0 {
            return Ok(init);
        }

        // The completion climb left the tree-wide fold in slot 0; folding
        // the driver-owned accumulator last preserves left-fold order.
        let _abort_on_unwind = AbortOnUnwind;

        // SAFETY: the run has completed; no worker touches the slots now.
        let folded = unsafe { slots[0].take() }.expect("completed climb fills slot 0");
        Ok(reduce(init, folded))
    }

    fn run_task(&mut self, task: &(dyn Task + '_)) -> Result<()> {
        let params = task.params();
        assert!(!self.defunct, "task dispatched to a torn-down thread squad");

        if params.concurrency == 0 && !params.join_requested {
            return Ok(());
        }

        trace!(
            squad_id = self.shared.squad_id,
            concurrency = params.concurrency,
            join = params.join_requested,
            "dispatching task"
        );

        // SAFETY: cleared below, after the completion wait has drained every
        // worker's access window.
        unsafe { self.shared.task.install(task) };

        if !self.forked {
            self.fork_all()?;
        } else {
            self.shared.workers[0].post_incoming();
        }

        // The driver always parks on the OS; burning a core here would steal
        // it from the workers.
        self.shared.workers[0].await_outgoing(WaitMode::Block);

        if params.join_requested {
            self.shared.workers[0].join_os_thread();

            // Backstop for handles a parent could not see yet: on a fork
            // pass that is also a join pass, a worker can observe a child's
            // completion before the driver has stored that child's handle.
            for record in self.shared.workers.iter() {
                record.join_os_thread();
            }

            self.defunct = true;
            debug!(squad_id = self.shared.squad_id, "squad torn down");
        }

        // SAFETY: every worker has posted its completion flip.
        unsafe { self.shared.task.clear() };

        trace!(squad_id = self.shared.squad_id, "task complete");
        Ok(())
    }

    /// Forks all worker OS threads, pre-flipping every `incoming` first so
    /// each worker's first wait already sees the pending task.
    fn fork_all(&mut self) -> Result<()> {
        debug!(
            squad_id = self.shared.squad_id,
            num_threads = self.num_threads(),
            "forking workers"
        );

        for record in self.shared.workers.iter() {
            record.pre_toggle_incoming();
        }

        self.forked = true;

        for index in 0..self.num_threads() {
            let spawned = thread::Builder::new()
                .name(format!("squad-{}-w{index}", self.shared.squad_id))
                .spawn({
                    let shared = Arc::clone(&self.shared);
                    move || worker_main(&shared, index)
                });

            match spawned {
                Ok(handle) => self.shared.workers[index].set_os_thread(handle),
                Err(source) => {
                    self.abandon_after_partial_fork(index);
                    return Err(Error::Spawn { source });
                }
            }
        }

        Ok(())
    }

    /// Best-effort teardown after a spawn failure left workers `[0, absent)`
    /// live and the rest missing.
    ///
    /// A worker's subordinates always carry higher indices, so the missing
    /// workers form a closed suffix of every subtree and the driver can
    /// impersonate them: complete the interrupted pass for each of them with
    /// a single `outgoing` flip (their `incoming` was already pre-flipped,
    /// and on the fork pass nobody relays notifications), then dispatch the
    /// teardown through the normal path and replay each missing worker's
    /// protocol in ascending index order, forwarding notifications before
    /// anything waits on them.
    fn abandon_after_partial_fork(&mut self, absent: usize) {
        let shared = &self.shared;
        let num_threads = shared.num_threads();

        debug!(
            squad_id = shared.squad_id,
            live = absent,
            "spawn failed, abandoning squad"
        );

        for record in &shared.workers[absent..] {
            record.post_outgoing();
        }
        shared.workers[0].await_outgoing(WaitMode::Block);

        // SAFETY: the interrupted pass has drained.
        unsafe { shared.task.clear() };

        let teardown = TeardownTask;

        // SAFETY: cleared below, after the teardown pass has drained.
        unsafe { shared.task.install(&teardown) };

        shared.workers[0].post_incoming();

        for index in absent..num_threads {
            let record = &shared.workers[index];
            record.await_incoming(WaitMode::Block);

            topology::for_each_child_top_down(
                index,
                record.num_subthreads,
                num_threads,
                &mut |child| {
                    shared.workers[child].post_incoming();
                },
            );

            record.post_outgoing();
        }

        shared.workers[0].await_outgoing(WaitMode::Block);

        // SAFETY: the teardown pass has drained.
        unsafe { shared.task.clear() };

        for record in shared.workers.iter() {
            record.join_os_thread();
        }

        self.defunct = true;
    }
}

impl Drop for ThreadSquad {
    fn drop(&mut self) {
        if self.defunct {
            return;
        }

        // Teardown must reach the workers even when the squad is dropped
        // mid-unwind; a fork failure here has already torn everything down
        // inside `run_task`, so the error itself carries no further duty.
        let teardown = TeardownTask;
        let _ = self.run_task(&teardown);
    }
}

/// Builder for configuring a [`ThreadSquad`].
///
/// ```rust
/// let squad = thread_squad::ThreadSquad::builder()
///     .num_threads(2)
///     .spin_wait(true)
///     .build()
///     .unwrap();
///
/// assert_eq!(squad.num_threads(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct ThreadSquadBuilder {
    num_threads: usize,
    pin_to_hardware_threads: bool,
    spin_wait: bool,
    max_num_hardware_threads: usize,
    hardware_thread_mappings: Vec<usize>,
}

impl ThreadSquadBuilder {
    fn new() -> Self {
        Self {
            num_threads: 0,
            pin_to_hardware_threads: false,
            spin_wait: false,
            max_num_hardware_threads: 0,
            hardware_thread_mappings: Vec::new(),
        }
    }

    /// How many worker threads to fork. Zero (the default) means one per
    /// available hardware thread.
    #[must_use]
    pub fn num_threads(mut self, value: usize) -> Self {
        self.num_threads = value;
        self
    }

    /// Whether to pin each worker to a hardware thread. Pinning helps
    /// maintain data locality across repeated task invocations.
    #[must_use]
    pub fn pin_to_hardware_threads(mut self, value: bool) -> Self {
        self.pin_to_hardware_threads = value;
        self
    }

    /// Whether workers wait for work by spinning (with pause-instruction
    /// pacing and an OS-wait fallback) instead of parking immediately.
    /// Spinning wins when tasks arrive back-to-back and the squad does not
    /// oversubscribe the machine.
    #[must_use]
    pub fn spin_wait(mut self, value: bool) -> Self {
        self.spin_wait = value;
        self
    }

    /// The maximal number of hardware threads to pin workers to. Zero (the
    /// default) means as many as possible. Setting a small value runs
    /// several workers on the same hardware thread, which can help
    /// reproduce synchronization bugs.
    #[must_use]
    pub fn max_num_hardware_threads(mut self, value: usize) -> Self {
        self.max_num_hardware_threads = value;
        self
    }

    /// Maps worker indices to hardware thread ids for pinning. When empty
    /// (the default), worker indices are used as hardware thread ids
    /// directly.
    #[must_use]
    pub fn hardware_thread_mappings(mut self, value: impl Into<Vec<usize>>) -> Self {
        self.hardware_thread_mappings = value.into();
        self
    }

    /// Builds the squad with the configured settings.
    ///
    /// Validates the configuration and resolves pin targets; worker OS
    /// threads are forked lazily by the first task.
    pub fn build(self) -> Result<ThreadSquad> {
        let mappings = &self.hardware_thread_mappings;

        if self.num_threads != 0 && self.max_num_hardware_threads > self.num_threads {
            return Err(Error::InvalidConfiguration {
                problem: format!(
                    "max_num_hardware_threads ({}) exceeds num_threads ({})",
                    self.max_num_hardware_threads, self.num_threads
                ),
            });
        }

        if !mappings.is_empty() {
            if self.max_num_hardware_threads > mappings.len() {
                return Err(Error::InvalidConfiguration {
                    problem: format!(
                        "max_num_hardware_threads ({}) exceeds the {} provided mappings",
                        self.max_num_hardware_threads,
                        mappings.len()
                    ),
                });
            }
            if self.num_threads > mappings.len() {
                return Err(Error::InvalidConfiguration {
                    problem: format!(
                        "num_threads ({}) exceeds the {} provided mappings",
                        self.num_threads,
                        mappings.len()
                    ),
                });
            }
        }

        let available = num_cpus::get();

        let num_threads = if self.num_threads == 0 {
            available
        } else {
            self.num_threads
        };

        let max_num_hardware_threads = if self.max_num_hardware_threads == 0 {
            if mappings.is_empty() {
                available
            } else {
                mappings.len()
            }
        } else {
            self.max_num_hardware_threads
        }
        // Upper bound, so clamp downwards to what the machine has.
        .min(available);

        let pin_targets = if self.pin_to_hardware_threads {
            resolve_pin_targets(num_threads, max_num_hardware_threads, mappings)?
        } else {
            vec![None; num_threads].into_boxed_slice()
        };

        let spans = topology::subtree_spans(num_threads);
        let workers = spans
            .iter()
            .enumerate()
            .map(|(index, &span)| CachePadded::new(WorkerRecord::new(index, span)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(SquadShared {
            squad_id: NEXT_SQUAD_ID.fetch_add(1, Ordering::Relaxed),
            wait_mode: if self.spin_wait {
                WaitMode::Spin
            } else {
                WaitMode::Block
            },
            workers,
            pin_targets,
            task: TaskSlot::new(),
        });

        Ok(ThreadSquad {
            shared,
            forked: false,
            defunct: false,
        })
    }
}

/// Resolves each worker's hardware thread id to a pinnable core.
fn resolve_pin_targets(
    num_threads: usize,
    max_num_hardware_threads: usize,
    mappings: &[usize],
) -> Result<Box<[Option<core_affinity::CoreId>]>> {
    let cores = core_affinity::get_core_ids().unwrap_or_default();

    (0..num_threads)
        .map(|index| {
            let subindex = index % max_num_hardware_threads;
            let hardware_thread = mappings.get(subindex).copied().unwrap_or(subindex);

            cores
                .iter()
                .find(|core| core.id == hardware_thread)
                .copied()
                .map(Some)
                .ok_or(Error::PinningUnsupported { hardware_thread })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn builder_rejects_max_exceeding_num_threads() {
        let result = ThreadSquad::builder()
            .num_threads(2)
            .max_num_hardware_threads(4)
            .build();

        assert!(matches!(
            result,
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn builder_rejects_short_mappings() {
        let result = ThreadSquad::builder()
            .num_threads(4)
            .hardware_thread_mappings([0, 1])
            .build();

        assert!(matches!(
            result,
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn builder_rejects_unresolvable_pin_target() {
        let result = ThreadSquad::builder()
            .num_threads(1)
            .pin_to_hardware_threads(true)
            .hardware_thread_mappings([999_999])
            .build();

        assert!(matches!(
            result,
            Err(Error::PinningUnsupported {
                hardware_thread: 999_999
            })
        ));
    }

    #[test]
    fn zero_num_threads_uses_available_parallelism() {
        let squad = ThreadSquad::builder().build().unwrap();

        assert_eq!(squad.num_threads(), num_cpus::get());
    }

    #[test]
    fn zero_concurrency_run_is_a_no_op() {
        let mut squad = ThreadSquad::builder().num_threads(2).build().unwrap();
        let calls = AtomicUsize::new(0);

        squad
            .run_on(0, |_ctx| {
                calls.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn repeated_runs_reuse_the_same_threads() {
        let mut squad = ThreadSquad::builder().num_threads(3).build().unwrap();
        let seen = Mutex::new(Vec::new());

        for _ in 0..2 {
            squad
                .run(|_ctx| {
                    seen.lock().unwrap().push(std::thread::current().id());
                })
                .unwrap();
        }

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 6);

        let first: HashSet<_> = seen[..3].iter().copied().collect();
        let second: HashSet<_> = seen[3..].iter().copied().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn workers_are_named_after_the_squad() {
        let mut squad = ThreadSquad::builder().num_threads(2).build().unwrap();
        let names = Mutex::new(Vec::new());

        squad
            .run(|_ctx| {
                let name = std::thread::current().name().map(String::from);
                names.lock().unwrap().push(name);
            })
            .unwrap();

        for name in names.into_inner().unwrap() {
            let name = name.expect("squad workers are named");
            assert!(name.starts_with("squad-"), "unexpected name {name}");
        }
    }

    #[test]
    fn transform_reduce_with_zero_concurrency_returns_init() {
        let mut squad = ThreadSquad::builder().num_threads(2).build().unwrap();

        let result = squad
            .transform_reduce_on(0, |_ctx| 1, 42, |a, b| a + b)
            .unwrap();

        assert_eq!(result, 42);
    }
}
