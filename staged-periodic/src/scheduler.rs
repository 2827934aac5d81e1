// Copyright (c) Facebook, Inc. and its affiliates.

//! Central pacing for a run.
//!
//! A single scheduler thread owns the target arrival schedule of every
//! call. For each call it sleeps until the call's target offset from the
//! start of its stage and then hands a permit, the stage index, to whichever
//! worker asks first. The permit channel holds a single permit so the
//! scheduler never runs more than one call ahead of the workers.
//!
//! With a fixed stage duration, call `i` of `n` targets
//! `(i + i / (n - 1)) / qps` seconds into the stage which places the last
//! call right on the stage boundary. Otherwise call `i` targets `i / qps`.
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, trace, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use util::*;

use super::abort::is_closed;
use super::clock::Clock;
use super::hist::SleepHistogram;
use super::options::WorkloadStage;
use super::recorder::Recorder;
use super::step::StepCounter;

/// Random perturbation of up to +/-10% of `nsecs`, rounded to the nearest
/// nanosecond. Non-positive sleeps aren't perturbed.
pub fn jitter<R: Rng + ?Sized>(nsecs: i128, rng: &mut R) -> i128 {
    let bound = (nsecs as f64 / 10.0 + 0.5) as i128;
    if bound <= 0 {
        return 0;
    }
    rng.gen_range(-bound..=bound)
}

/// Cumulative planned duration through each stage.
pub fn cum_durs(stages: &[WorkloadStage]) -> Vec<Duration> {
    stages
        .iter()
        .scan(Duration::ZERO, |acc, stage| {
            *acc += stage.duration;
            Some(*acc)
        })
        .collect()
}

/// Worker side of the permit channel.
#[derive(Clone)]
pub struct Permits {
    rx: Receiver<usize>,
}

impl Permits {
    /// Block for the next permit. Returns the stage index the call belongs
    /// to or `None` once the scheduler is done and the channel is drained.
    pub fn ask(&self) -> Option<usize> {
        self.rx.recv().ok()
    }
}

pub struct QpsScheduler {
    stages: Vec<WorkloadStage>,
    num_calls: Vec<u64>,
    cum_durs: Vec<Duration>,
    sleep_hists: Vec<SleepHistogram>,
    jitter: bool,
    clock: Arc<dyn Clock>,
    tx: Sender<usize>,
    rng: SmallRng,
}

impl QpsScheduler {
    /// `num_calls[i]` is the planned call count of stage `i` if the stage is
    /// bounded, see `PeriodicRunner`'s stage planning.
    pub fn new(
        stages: &[WorkloadStage],
        num_calls: Vec<u64>,
        jitter: bool,
        resolution: f64,
        clock: Arc<dyn Clock>,
    ) -> (Self, Permits) {
        assert_eq!(stages.len(), num_calls.len());
        let (tx, rx) = channel::bounded(1);
        (
            Self {
                stages: stages.to_vec(),
                num_calls,
                cum_durs: cum_durs(stages),
                sleep_hists: stages
                    .iter()
                    .map(|_| SleepHistogram::new(resolution))
                    .collect(),
                jitter,
                clock,
                tx,
                rng: SmallRng::from_entropy(),
            },
            Permits { rx },
        )
    }

    fn target_nsecs(&self, stage: &WorkloadStage, num_calls: u64, i: u64) -> i128 {
        let i = i as f64;
        let secs = if stage.has_duration() && num_calls > 1 {
            (i + i / (num_calls - 1) as f64) / stage.qps
        } else {
            i / stage.qps
        };
        (secs * 1_000_000_000.0) as i128
    }

    /// Run all stages on the calling thread, closing the permit channel at
    /// the end. Stops early if `stop` closes or all workers went away.
    /// Returns the per-stage sleep time histograms.
    pub fn run(
        mut self,
        rec: &dyn Recorder,
        sc: &StepCounter,
        stop: &Receiver<()>,
    ) -> Vec<SleepHistogram> {
        let run_start = self.clock.now();
        let mut next_step = run_start;
        let mut ended = false;

        for idx in 0..self.stages.len() {
            let stage = self.stages[idx].clone();
            let num_calls = self.num_calls[idx];
            let use_qps = stage.use_qps();
            let use_exactly = stage.use_exactly();
            let has_duration = stage.has_duration();
            let bounded = use_exactly || has_duration;
            let stage_end = run_start + self.cum_durs[idx];

            let stage_start = self.clock.now();
            info!("sched: starting stage {} {:?}", idx, &stage);

            let mut i: u64 = 0;
            loop {
                let now = self.clock.now();
                if now > next_step {
                    next_step = sc.maybe_advance(now, rec);
                }

                if use_qps && bounded && i >= num_calls {
                    break;
                }
                if use_exactly && !use_qps && i >= num_calls {
                    break;
                }
                if !use_exactly && has_duration && now > stage_end {
                    if !use_qps {
                        break;
                    }
                    // the final call is still issued even when late
                    if i + 1 != num_calls {
                        warn!(
                            "sched: stage {} only did {} out of {} calls before reaching {}",
                            idx,
                            i,
                            num_calls,
                            format_duration(stage.duration.as_secs_f64())
                        );
                        break;
                    }
                }

                if use_qps {
                    let target = self.target_nsecs(&stage, num_calls, i);
                    let elapsed =
                        self.clock.now().saturating_duration_since(stage_start).as_nanos() as i128;
                    let mut sleep = target - elapsed;
                    if self.jitter {
                        sleep += jitter(sleep, &mut self.rng);
                    }
                    trace!("sched: call {} target {}ns sleep {}ns", i, target, sleep);
                    self.sleep_hists[idx].record(sleep as f64 / 1_000_000_000.0);
                    let dur = Duration::from_nanos(u64::try_from(sleep.max(0)).unwrap_or(u64::MAX));
                    if !self.clock.sleep(dur, stop) {
                        debug!("sched: stopped while sleeping in stage {}", idx);
                        ended = true;
                        break;
                    }
                } else if is_closed(stop) {
                    debug!("sched: stopped before call {} in stage {}", i, idx);
                    ended = true;
                    break;
                }

                if self.tx.send(idx).is_err() {
                    debug!("sched: all workers are gone");
                    ended = true;
                    break;
                }
                i += 1;

                if is_closed(stop) {
                    debug!("sched: stopped after {} calls in stage {}", i, idx);
                    ended = true;
                    break;
                }
            }

            let elapsed = self.clock.now().saturating_duration_since(stage_start);
            info!(
                "sched: stage {} ended after {}: {} calls, qps={:.5}",
                idx,
                format_duration(elapsed.as_secs_f64()),
                i,
                i as f64 / elapsed.as_secs_f64()
            );
            if use_qps && self.sleep_hists[idx].count() > 0 {
                debug!("sched: stage {} sleep time {}", idx, self.sleep_hists[idx].summary());
            }

            if ended {
                break;
            }
        }

        // dropping the sender closes the permit channel
        let Self { sleep_hists, tx, .. } = self;
        drop(tx);
        sleep_hists
    }
}
