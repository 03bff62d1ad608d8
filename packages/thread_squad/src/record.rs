//! Per-worker coordination records.
//!
//! Each worker owns four single-bit sense flags, grouped in two orthogonal
//! pairs. The dispatch pair (`incoming`/`outgoing`) carries task start and
//! completion; the sync pair (`upward`/`downward`) carries in-task collective
//! handshakes and can therefore fire any number of times inside one task.
//!
//! Both pairs share one invariant: the bits of a pair are equal while the
//! worker is idle at that synchronization point. The initiating party flips
//! the first bit of the pair (making them unequal), the responding party
//! flips the second (making them equal again). Each flag has exactly two
//! writers overall and at most one waiter at any time, so a single `wake_one`
//! per flip suffices.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::wait::{toggle_and_wake, wait_until_changed, WaitMode};

/// Coordination state of a single worker thread.
///
/// Records are pure data: they are indexed out of the squad's shared array
/// and carry no references back to it.
pub(crate) struct WorkerRecord {
    /// This worker's position in the squad, in `[0, num_threads)`.
    pub(crate) thread_index: usize,

    /// Nominal span of the subtree this worker heads, including itself.
    /// Clamped with `min(thread_index + span, limit)` at every use site.
    pub(crate) num_subthreads: usize,

    /// The worker's OS thread. Filled by the driver at fork time and drained
    /// bottom-up at join time; `take()` makes draining idempotent, so the
    /// parent worker and the driver can both attempt it.
    os_thread: Mutex<Option<JoinHandle<()>>>,

    /// Dispatch pair: flipped by the parent (or driver) to hand this worker
    /// a task.
    incoming: AtomicU32,

    /// Dispatch pair: flipped by this worker once its whole subtree has
    /// completed the task.
    outgoing: AtomicU32,

    /// Sync pair: flipped by this worker when its collected payload is
    /// exposed to the parent.
    upward: AtomicU32,

    /// Sync pair: flipped by the parent after it has written the broadcast
    /// result into this worker's payload.
    downward: AtomicU32,

    /// Address of this worker's collective payload. Non-null only between
    /// the worker's `upward` flip and its observation of the `downward`
    /// flip; opaque bytes to everyone but the collective that owns it.
    sync_data: AtomicPtr<u8>,
}

impl WorkerRecord {
    pub(crate) fn new(thread_index: usize, num_subthreads: usize) -> Self {
        Self {
            thread_index,
            num_subthreads,
            os_thread: Mutex::new(None),
            incoming: AtomicU32::new(0),
            outgoing: AtomicU32::new(0),
            upward: AtomicU32::new(0),
            downward: AtomicU32::new(0),
            sync_data: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn set_os_thread(&self, handle: JoinHandle<()>) {
        *self.os_thread.lock() = Some(handle);
    }

    /// Joins this worker's OS thread if it has not been joined yet.
    ///
    /// Worker bodies abort the process on panic, so an `Err` from `join`
    /// means the squad infrastructure itself failed; the payload is
    /// propagated rather than swallowed.
    pub(crate) fn join_os_thread(&self) {
        let handle = self.os_thread.lock().take();
        if let Some(handle) = handle {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
    }

    /// Driver side, before the worker's OS thread exists: flips `incoming`
    /// so the worker's very first wait already sees a pending task. No wake
    /// is needed because nothing can be waiting yet.
    pub(crate) fn pre_toggle_incoming(&self) {
        self.incoming.fetch_xor(1, Ordering::Release);
    }

    /// Parent side: dispatches the installed task to this worker.
    pub(crate) fn post_incoming(&self) {
        toggle_and_wake(&self.incoming);
    }

    /// Worker side: parks until a dispatch arrives.
    pub(crate) fn await_incoming(&self, mode: WaitMode) {
        let outgoing = self.outgoing.load(Ordering::Relaxed);
        wait_until_changed(&self.incoming, outgoing, mode);
    }

    /// Worker side: reports this worker's subtree complete.
    pub(crate) fn post_outgoing(&self) {
        toggle_and_wake(&self.outgoing);
    }

    /// Parent side: parks until this worker's subtree has completed the
    /// currently dispatched pass, i.e. until `outgoing` has rejoined
    /// `incoming`.
    pub(crate) fn await_outgoing(&self, mode: WaitMode) {
        let incoming = self.incoming.load(Ordering::Relaxed);
        wait_until_changed(&self.outgoing, incoming ^ 1, mode);
    }

    /// Worker side: exposes the collective payload to the parent. The
    /// release flip of `upward` publishes the pointer store.
    pub(crate) fn publish_upward(&self, payload: *mut u8) {
        self.sync_data.store(payload, Ordering::Relaxed);
        toggle_and_wake(&self.upward);
    }

    /// Worker side: parks until the parent has handed the broadcast result
    /// back, then retires the payload pointer.
    pub(crate) fn await_downward(&self, mode: WaitMode) {
        let upward = self.upward.load(Ordering::Relaxed);
        wait_until_changed(&self.downward, upward ^ 1, mode);
        self.sync_data.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Parent side: parks until this worker has exposed its payload and
    /// returns the payload address. The acquire exit load of `upward`
    /// synchronizes with the worker's release flip, making the pointer (and
    /// the payload behind it) visible.
    pub(crate) fn await_upward(&self, mode: WaitMode) -> *mut u8 {
        let downward = self.downward.load(Ordering::Relaxed);
        wait_until_changed(&self.upward, downward, mode);
        self.sync_data.load(Ordering::Relaxed)
    }

    /// Parent side: re-reads the payload address published by this worker.
    /// Only valid between `await_upward` and `post_downward`.
    pub(crate) fn sync_payload(&self) -> *mut u8 {
        self.sync_data.load(Ordering::Relaxed)
    }

    /// Parent side: releases this worker after writing the broadcast result
    /// into its payload.
    pub(crate) fn post_downward(&self) {
        toggle_and_wake(&self.downward);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn dispatch_pair_round_trip() {
        let record = Arc::new(WorkerRecord::new(0, 1));

        // Nothing dispatched yet: outgoing already matches incoming.
        record.await_outgoing(WaitMode::Block);

        let worker = thread::spawn({
            let record = Arc::clone(&record);
            move || {
                record.await_incoming(WaitMode::Block);
                record.post_outgoing();
            }
        });

        record.post_incoming();
        record.await_outgoing(WaitMode::Block);
        worker.join().unwrap();

        // A second round works without any reset in between.
        let worker = thread::spawn({
            let record = Arc::clone(&record);
            move || {
                record.await_incoming(WaitMode::Spin);
                record.post_outgoing();
            }
        });

        record.post_incoming();
        record.await_outgoing(WaitMode::Block);
        worker.join().unwrap();
    }

    #[test]
    fn sync_pair_carries_payload_address() {
        let record = Arc::new(WorkerRecord::new(1, 1));

        let worker = thread::spawn({
            let record = Arc::clone(&record);
            move || {
                let mut payload = 7_u8;
                record.publish_upward(&mut payload as *mut u8);
                record.await_downward(WaitMode::Block);
                payload
            }
        });

        let payload = record.await_upward(WaitMode::Block);
        assert_eq!(payload, record.sync_payload());

        // SAFETY: the worker is parked on `downward`; the payload stays
        // pinned until we flip it.
        unsafe { *payload = 9 };
        record.post_downward();

        assert_eq!(worker.join().unwrap(), 9);
        assert!(record.sync_payload().is_null());
    }
}
