//! Tasks dispatched through the squad.
//!
//! Task polymorphism is a closed set: every concrete task type lives in this
//! module, so a small object-safe trait with static construction at the call
//! sites covers all of it. The driver installs a borrow of the task into the
//! shared slot; workers only ever see it through the dispatch handshake.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::context::TaskContext;

/// Parameters of one task invocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TaskParams {
    /// How many workers run the task body; workers at or past this index
    /// only take part in the synchronization chain.
    pub(crate) concurrency: usize,

    /// Whether this is the squad's final task, after which every worker
    /// exits and the OS threads are joined.
    pub(crate) join_requested: bool,
}

/// A unit of work executed once by every worker within the concurrency.
pub(crate) trait Task: Sync {
    fn params(&self) -> TaskParams;

    /// Runs the task body on one worker. Must not unwind; the worker loop
    /// aborts the process if it does.
    fn execute(&self, ctx: &mut TaskContext<'_>);

    /// Folds the completed subtree of worker `src` into worker `dst` during
    /// the upward completion climb. Called on `dst`'s thread, strictly after
    /// `src`'s subtree finished executing.
    fn merge(&self, dst: usize, src: usize) {
        let _ = (dst, src);
    }
}

/// Runs a user closure on every participating worker; nothing to merge.
pub(crate) struct ActionTask<'a, F> {
    action: &'a F,
    params: TaskParams,
}

impl<'a, F> ActionTask<'a, F>
where
    F: Fn(&mut TaskContext<'_>) + Sync,
{
    pub(crate) fn new(action: &'a F, concurrency: usize, join_requested: bool) -> Self {
        Self {
            action,
            params: TaskParams {
                concurrency,
                join_requested,
            },
        }
    }
}

impl<F> Task for ActionTask<'_, F>
where
    F: Fn(&mut TaskContext<'_>) + Sync,
{
    fn params(&self) -> TaskParams {
        self.params
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) {
        (self.action)(ctx);
    }
}

/// The squad's final task when no user action accompanies the teardown:
/// wakes every worker, runs nothing, and requests the join.
pub(crate) struct TeardownTask;

impl Task for TeardownTask {
    fn params(&self) -> TaskParams {
        TaskParams {
            concurrency: 0,
            join_requested: true,
        }
    }

    fn execute(&self, _ctx: &mut TaskContext<'_>) {}
}

/// One per-worker result cell of a transform-reduce invocation.
///
/// Each cell is written by exactly one party at a time: the owning worker
/// during `execute`, then its ancestors during the merge climb. The dispatch
/// and completion handshakes sequence those accesses, so no lock is needed.
pub(crate) struct ValueSlot<T>(UnsafeCell<Option<T>>);

// SAFETY: access is externally sequenced by the squad's sense handshakes;
// the cell itself never hands out overlapping references.
unsafe impl<T: Send> Sync for ValueSlot<T> {}

impl<T> ValueSlot<T> {
    pub(crate) fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    /// # Safety
    ///
    /// The caller must be the sole party accessing this slot, as sequenced
    /// by the dispatch/completion handshakes.
    pub(crate) unsafe fn put(&self, value: T) {
        // SAFETY: exclusive access per the function contract.
        unsafe { *self.0.get() = Some(value) };
    }

    /// # Safety
    ///
    /// Same contract as [`ValueSlot::put`].
    pub(crate) unsafe fn take(&self) -> Option<T> {
        // SAFETY: exclusive access per the function contract.
        unsafe { (*self.0.get()).take() }
    }
}

/// Computes one value per worker and folds them pairwise along the
/// completion climb, leaving the tree-wide fold in slot 0.
pub(crate) struct TransformReduceTask<'a, F, O, T> {
    transform: &'a F,
    reduce: &'a O,
    slots: &'a [ValueSlot<T>],
    params: TaskParams,
}

impl<'a, F, O, T> TransformReduceTask<'a, F, O, T>
where
    F: Fn(&mut TaskContext<'_>) -> T + Sync,
    O: Fn(T, T) -> T + Sync,
    T: Send,
{
    pub(crate) fn new(
        transform: &'a F,
        reduce: &'a O,
        slots: &'a [ValueSlot<T>],
        join_requested: bool,
    ) -> Self {
        Self {
            transform,
            reduce,
            slots,
            params: TaskParams {
                concurrency: slots.len(),
                join_requested,
            },
        }
    }
}

impl<F, O, T> Task for TransformReduceTask<'_, F, O, T>
where
    F: Fn(&mut TaskContext<'_>) -> T + Sync,
    O: Fn(T, T) -> T + Sync,
    T: Send,
{
    fn params(&self) -> TaskParams {
        self.params
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) {
        let value = (self.transform)(ctx);

        // SAFETY: this worker owns its slot until its completion flip.
        unsafe { self.slots[ctx.thread_index()].put(value) };
    }

    fn merge(&self, dst: usize, src: usize) {
        if src >= self.slots.len() {
            // The subordinate sat outside the concurrency and ran nothing.
            return;
        }

        // SAFETY: `src`'s subtree has completed (we were called from the
        // climb after observing its completion flip) and `dst` is this
        // worker's own slot.
        unsafe {
            // A subordinate within the concurrency can still leave its slot
            // empty: when a fork failure makes the driver complete the pass
            // on a dead worker's behalf, the body never ran. Nothing to
            // fold then.
            let Some(rhs) = self.slots[src].take() else {
                return;
            };

            let folded = match self.slots[dst].take() {
                Some(lhs) => (self.reduce)(lhs, rhs),
                None => rhs,
            };
            self.slots[dst].put(folded);
        }
    }
}

/// The shared cell through which the driver hands the current task to the
/// workers.
///
/// The same type-erasure-plus-handshake scheme as a C thread pool's
/// `(function pointer, context)` pair, expressed as a trait object: the
/// driver writes before the dispatch flip (release), workers read after
/// observing the flip (acquire), and the driver clears the cell only after
/// the completion climb has drained.
pub(crate) struct TaskSlot(UnsafeCell<Option<NonNull<dyn Task>>>);

// SAFETY: the dispatch/completion handshakes sequence every access; the
// driver has exclusive access whenever the cell is written.
unsafe impl Send for TaskSlot {}
// SAFETY: as above.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    /// Driver side.
    ///
    /// # Safety
    ///
    /// `task` must stay valid until the matching [`TaskSlot::clear`], and no
    /// worker may be between its dispatch and completion flips.
    pub(crate) unsafe fn install(&self, task: &(dyn Task + '_)) {
        let ptr = NonNull::from(task);

        // SAFETY: same layout; this only erases the caller's lifetime, and
        // validity is bounded by the handshake per the function contract.
        let ptr: NonNull<dyn Task> = unsafe { std::mem::transmute(ptr) };

        // SAFETY: exclusive access per the function contract.
        unsafe { *self.0.get() = Some(ptr) };
    }

    /// Driver side; see [`TaskSlot::install`].
    ///
    /// # Safety
    ///
    /// No worker may be between its dispatch and completion flips.
    pub(crate) unsafe fn clear(&self) {
        // SAFETY: exclusive access per the function contract.
        unsafe { *self.0.get() = None };
    }

    /// Worker side.
    ///
    /// # Safety
    ///
    /// Only valid between observing the dispatch flip and posting the
    /// completion flip.
    pub(crate) unsafe fn get(&self) -> &dyn Task {
        // SAFETY: the driver's install happened-before the dispatch flip we
        // observed with acquire ordering.
        unsafe {
            (*self.0.get())
                .expect("dispatch observed with no task installed")
                .as_ref()
        }
    }
}

/// Aborts the process when dropped during an unwind.
///
/// Task bodies and user-supplied reduction operators must not unwind: the
/// squad's handshakes cannot express a half-completed pass, so the only safe
/// response to a panic is to take the process down, the same way the
/// parallel standard algorithms respond to a throwing task.
pub(crate) struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            std::process::abort();
        }
    }
}
