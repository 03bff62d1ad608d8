//! Adaptive waiting on single-bit sense flags.
//!
//! Every synchronization point in the squad is a `u32` atomic holding 0 or 1.
//! A party signals by flipping the bit; the observing party remembers the
//! value it last saw and waits for inequality. Nothing ever waits for a
//! specific value, so no reset round-trip is needed between uses.

use std::sync::atomic::{AtomicU32, Ordering};

/// How a party waits for a sense flag to change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitMode {
    /// Burn cycles in a tiered spin (busy reads, then paced by CPU pause
    /// instructions) and only park on the OS once the spin budget runs out.
    Spin,

    /// Park on the OS immediately.
    Block,
}

/// Busy-read steps per spin round; the read count doubles after each step.
const SPIN_STEPS: u32 = 6;

/// Spin rounds, each ending in a CPU pause, before yielding kicks in.
const PAUSE_ROUNDS: u32 = 1 << 9;

/// Rounds of `yield_now` between spinning and parking. Zero: on the systems
/// this was tuned on, yielding buys nothing over parking outright.
const YIELD_ROUNDS: u32 = 0;

/// Waits until `flag` holds a value other than `old` and returns that value.
///
/// The returned value is produced by an acquire load at the exit point, so it
/// is safe to read data published before the corresponding flip.
pub(crate) fn wait_until_changed(flag: &AtomicU32, old: u32, mode: WaitMode) -> u32 {
    if mode == WaitMode::Spin {
        if let Some(new) = spin_until_changed(flag, old) {
            return new;
        }
    }

    loop {
        atomic_wait::wait(flag, old);

        // The wakeup may be spurious; only inequality means progress.
        let new = flag.load(Ordering::Acquire);
        if new != old {
            return new;
        }
    }
}

fn spin_until_changed(flag: &AtomicU32, old: u32) -> Option<u32> {
    for _ in 0..PAUSE_ROUNDS {
        let mut reads = 1_u32;

        for _ in 0..SPIN_STEPS {
            for _ in 0..reads {
                std::hint::black_box(());
            }

            if flag.load(Ordering::Relaxed) != old {
                return Some(flag.load(Ordering::Acquire));
            }

            reads *= 2;
        }

        std::hint::spin_loop();
    }

    for _ in 0..YIELD_ROUNDS {
        std::thread::yield_now();

        if flag.load(Ordering::Relaxed) != old {
            return Some(flag.load(Ordering::Acquire));
        }
    }

    None
}

/// Flips the sense flag and wakes one waiter parked on it.
///
/// The flip is a release operation: everything written before the call is
/// visible to whoever observes the new value with acquire ordering. Returns
/// the value the flag held before the flip.
pub(crate) fn toggle_and_wake(flag: &AtomicU32) -> u32 {
    let old = flag.fetch_xor(1, Ordering::Release);
    atomic_wait::wake_one(flag);
    old
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn toggle_returns_previous_value() {
        let flag = AtomicU32::new(0);

        assert_eq!(toggle_and_wake(&flag), 0);
        assert_eq!(toggle_and_wake(&flag), 1);
        assert_eq!(flag.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn returns_immediately_when_already_different() {
        let flag = AtomicU32::new(1);

        assert_eq!(wait_until_changed(&flag, 0, WaitMode::Block), 1);
        assert_eq!(wait_until_changed(&flag, 0, WaitMode::Spin), 1);
    }

    #[test]
    fn observes_flip_from_another_thread_in_block_mode() {
        let flag = Arc::new(AtomicU32::new(0));

        let toggler = thread::spawn({
            let flag = Arc::clone(&flag);
            move || {
                thread::sleep(Duration::from_millis(10));
                toggle_and_wake(&flag);
            }
        });

        assert_eq!(wait_until_changed(&flag, 0, WaitMode::Block), 1);
        toggler.join().unwrap();
    }

    #[test]
    fn observes_flip_from_another_thread_in_spin_mode() {
        let flag = Arc::new(AtomicU32::new(1));

        let toggler = thread::spawn({
            let flag = Arc::clone(&flag);
            move || {
                thread::sleep(Duration::from_millis(10));
                toggle_and_wake(&flag);
            }
        });

        assert_eq!(wait_until_changed(&flag, 1, WaitMode::Spin), 0);
        toggler.join().unwrap();
    }
}
