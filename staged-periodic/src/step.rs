// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, trace};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::recorder::Recorder;

struct StepState {
    next: Instant,
    step: u64,
}

/// Asks the recorder for a statistics snapshot every `interval`,
/// independent of stage boundaries.
pub struct StepCounter {
    interval: Duration,
    state: Mutex<StepState>,
}

impl StepCounter {
    /// The first step ends at `start + interval`.
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(StepState {
                next: start + interval,
                step: 0,
            }),
        }
    }

    /// Close the current step if `now` is past its end. At most one step is
    /// closed per call. Returns when the next step ends so that callers can
    /// skip calling in until then.
    pub fn maybe_advance(&self, now: Instant, rec: &dyn Recorder) -> Instant {
        let mut state = self.state.lock().unwrap();
        if now > state.next {
            debug!("step: gathering stats for step {}", state.step);
            rec.done_step(&format!("step={}", state.step));
            state.step += 1;
            state.next += self.interval;
        } else {
            trace!("step: {:?} left in step {}", state.next - now, state.step);
        }
        state.next
    }

    pub fn step(&self) -> u64 {
        self.state.lock().unwrap().step
    }
}
