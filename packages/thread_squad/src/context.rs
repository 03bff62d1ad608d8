//! In-task state and collective synchronization.
//!
//! Workers running a task body receive a [`TaskContext`], which exposes the
//! worker's identity and the collective operations: a plain barrier and
//! reductions with an optional final transform.
//!
//! Collectives ride on the sync pair of each worker record, orthogonal to
//! the dispatch pair, so a task body can run any number of them. Each
//! participating worker stack-allocates a collective payload; child payload
//! addresses cross thread boundaries only inside the `upward`/`downward`
//! handshake window, during which the child is parked and its payload
//! pinned.
//!
//! Ordering, per handshake: the child's payload store happens-before its
//! `upward` flip (release); the parent dereferences only after its acquire
//! observation of that flip; the parent's result write happens-before its
//! `downward` flip (release); the child reads the result only after its
//! acquire observation of that flip.

use crate::squad::SquadShared;
use crate::topology;

/// A payload exchanged between workers during one collective call.
///
/// The closed set of implementations mirrors the collective operations: the
/// barrier's empty payload and the reductions' [`Fold`] payload (a plain
/// reduce is a fold whose apex result is the folded value itself; a
/// reduce-transform applies the transform at the apex). `src`/`dst` always
/// point at another instance of `Self`, because every participant of one
/// collective call runs the same task body and therefore the same call
/// site.
pub(crate) trait Collective {
    /// Folds the payload published by a subordinate into this one.
    ///
    /// # Safety
    ///
    /// `src` must point at a valid, pinned instance of `Self` published by a
    /// subordinate's `upward` flip.
    unsafe fn fold(&mut self, src: *mut u8);

    /// Writes the final result into a subordinate's payload.
    ///
    /// # Safety
    ///
    /// `dst` must point at a valid, pinned instance of `Self` whose owner is
    /// still parked on its `downward` flag.
    unsafe fn finish(&self, dst: *mut u8);
}

/// The no-op payload of a plain barrier.
struct Barrier;

impl Collective for Barrier {
    unsafe fn fold(&mut self, _src: *mut u8) {}

    unsafe fn finish(&self, _dst: *mut u8) {}
}

/// Payload shared by both reductions: `value` carries the partial fold on
/// the way up, `result` carries the apex's answer on the way down. The apex
/// step itself (take the fold as-is, or transform it first) lives with the
/// caller.
struct Fold<T, R, O> {
    value: Option<T>,
    result: Option<R>,
    reduce: O,
}

impl<T, R, O> Collective for Fold<T, R, O>
where
    T: Send,
    R: Clone + Send,
    O: Fn(T, T) -> T,
{
    unsafe fn fold(&mut self, src: *mut u8) {
        // SAFETY: `src` is another `Self` per the trait contract.
        let src = unsafe { &mut *src.cast::<Self>() };

        let lhs = self.value.take().expect("collect folds before broadcast");
        let rhs = src.value.take().expect("subordinate published its value");
        self.value = Some((self.reduce)(lhs, rhs));
    }

    unsafe fn finish(&self, dst: *mut u8) {
        // SAFETY: `dst` is another `Self` per the trait contract.
        let dst = unsafe { &mut *dst.cast::<Self>() };

        dst.result = self.result.clone();
    }
}

/// State passed to a task body running on one worker.
pub struct TaskContext<'a> {
    shared: &'a SquadShared,
    thread_index: usize,
    num_running: usize,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(shared: &'a SquadShared, thread_index: usize, num_running: usize) -> Self {
        Self {
            shared,
            thread_index,
            num_running,
        }
    }

    /// The index of the worker this task body runs on.
    #[must_use]
    #[inline]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// The number of workers concurrently running this task body.
    #[must_use]
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_running
    }

    /// Barrier across all workers running this task body: no participant
    /// returns before every participant has arrived.
    pub fn sync(&mut self) {
        let mut barrier = Barrier;
        self.collect(&mut barrier);
        self.broadcast(&barrier);
    }

    /// Folds `value` across all workers running this task body with
    /// `reduce_op` and returns the folded result on every participant.
    ///
    /// Values fold pairwise along the synchronization tree; with an
    /// associative `reduce_op` the result is the same as a sequential fold.
    /// Must be called by every running worker, like all collectives. A panic
    /// in `reduce_op` aborts the process.
    pub fn reduce<T, O>(&mut self, value: T, reduce_op: O) -> T
    where
        T: Clone + Send,
        O: Fn(T, T) -> T,
    {
        let mut collective = Fold {
            value: Some(value),
            result: None,
            reduce: reduce_op,
        };

        self.collect(&mut collective);
        if self.thread_index == 0 {
            collective.result = collective.value.take();
        }
        self.broadcast(&collective);

        collective
            .result
            .expect("broadcast delivered the folded value to every participant")
    }

    /// Like [`TaskContext::reduce`], but applies `transform` to the folded
    /// value once, on worker 0, and returns the transformed result on every
    /// participant.
    pub fn reduce_transform<T, R, O, X>(&mut self, value: T, reduce_op: O, transform: X) -> R
    where
        T: Send,
        R: Clone + Send,
        O: Fn(T, T) -> T,
        X: FnOnce(T) -> R,
    {
        let mut collective = Fold {
            value: Some(value),
            result: None,
            reduce: reduce_op,
        };

        self.collect(&mut collective);
        if self.thread_index == 0 {
            let folded = collective
                .value
                .take()
                .expect("collect left the tree-wide fold at the apex");
            collective.result = Some(transform(folded));
        }
        self.broadcast(&collective);

        collective
            .result
            .expect("broadcast delivered the transformed value to every participant")
    }

    /// Collect phase: folds every subordinate's payload into `collective`,
    /// then exposes the partial fold to the parent and parks until the
    /// parent hands the result back.
    fn collect<C: Collective>(&mut self, collective: &mut C) {
        let workers = self.shared.workers();
        let record = &workers[self.thread_index];
        let mode = self.shared.wait_mode();

        topology::for_each_child_bottom_up(
            self.thread_index,
            record.num_subthreads,
            self.num_running,
            &mut |child| {
                let payload = workers[child].await_upward(mode);

                // SAFETY: the payload is a pinned instance of `C`: every
                // participant runs the same call site of the same task body.
                unsafe { collective.fold(payload) };
            },
        );

        if self.thread_index != 0 {
            record.publish_upward((collective as *mut C).cast());
            record.await_downward(mode);
        }
    }

    /// Broadcast phase: writes the final result into every subordinate's
    /// still-pinned payload and releases them, nearest level first.
    fn broadcast<C: Collective>(&mut self, collective: &C) {
        let workers = self.shared.workers();
        let record = &workers[self.thread_index];

        topology::for_each_child_top_down(
            self.thread_index,
            record.num_subthreads,
            self.num_running,
            &mut |child| {
                // Read the payload address before releasing the child.
                let payload = workers[child].sync_payload();

                // SAFETY: the child is parked on `downward` with its payload
                // pinned; same call-site argument as in `collect`.
                unsafe { collective.finish(payload) };

                workers[child].post_downward();
            },
        );
    }
}
