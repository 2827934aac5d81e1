// Copyright (c) Facebook, Inc. and its affiliates.
use crossbeam::channel::{select, Receiver};
use std::time::{Duration, Instant};

/// Time source for the scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep for `dur` or until `stop` closes. Returns false if interrupted
    /// by `stop`. A zero `dur` still gives `stop` a chance to fire.
    fn sleep(&self, dur: Duration, stop: &Receiver<()>) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration, stop: &Receiver<()>) -> bool {
        select! {
            recv(stop) -> _ => false,
            default(dur) => true,
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Clock;
    use crossbeam::channel::Receiver;
    use std::sync::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    struct MockState {
        offset: Duration,
        remaining_sleeps: u64,
        nr_parked: usize,
    }

    /// Virtual clock whose time only moves when sleeping. Sleeps can be
    /// gated so that a test observes every scheduler step.
    pub(crate) struct MockClock {
        base: Instant,
        state: Mutex<MockState>,
        waitq: Condvar,
    }

    impl MockClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                state: Mutex::new(MockState {
                    offset: Duration::ZERO,
                    remaining_sleeps: u64::MAX,
                    nr_parked: 0,
                }),
                waitq: Condvar::new(),
            }
        }

        pub(crate) fn base(&self) -> Instant {
            self.base
        }

        /// Let `n` more sleeps through and block the ones after.
        pub(crate) fn block_after_n_sleeps(&self, n: u64) {
            self.state.lock().unwrap().remaining_sleeps = n;
            self.waitq.notify_all();
        }

        pub(crate) fn stop_blocking_sleeps(&self) {
            self.block_after_n_sleeps(u64::MAX);
        }

        /// Move time forward without anyone sleeping.
        pub(crate) fn advance(&self, dur: Duration) {
            self.state.lock().unwrap().offset += dur;
        }

        /// Wait until a sleeper is parked on the gate.
        pub(crate) fn wait_for_parked_sleeper(&self) {
            while self.state.lock().unwrap().nr_parked == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            self.base + self.state.lock().unwrap().offset
        }

        fn sleep(&self, dur: Duration, _stop: &Receiver<()>) -> bool {
            let mut state = self.state.lock().unwrap();
            if state.remaining_sleeps < u64::MAX {
                state.nr_parked += 1;
                while state.remaining_sleeps == 0 {
                    state = self.waitq.wait(state).unwrap();
                }
                state.nr_parked -= 1;
                if state.remaining_sleeps < u64::MAX {
                    state.remaining_sleeps -= 1;
                }
            }
            state.offset += dur;
            true
        }
    }
}
