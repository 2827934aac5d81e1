// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use chrono::prelude::*;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use util::*;

use super::abort::{Aborter, SignalBroker, Subscription};
use super::clock::{Clock, SystemClock};
use super::hist::SleepHistogram;
use super::options::{Runnable, RunnerOptions, WorkloadStage};
use super::recorder::{DiscardRecorder, Recorder};
use super::report::{RunnerResults, StageResults};
use super::scheduler::{Permits, QpsScheduler};
use super::step::StepCounter;
use super::VERSION;

/// Share of behind-schedule sleeps above which a stage is flagged.
const BEHIND_WARN_FRAC: f64 = 0.05;

struct StagePlan {
    requested_qps: String,
    requested_duration: String,
    num_calls: u64,
}

/// Per-stage bookkeeping shared by the workers.
struct StageState {
    num_rpcs: AtomicU64,
    start: Mutex<Option<(Instant, DateTime<Local>)>>,
    // nsecs since the run epoch when the last call of the stage finished
    end_ns: AtomicU64,
}

impl StageState {
    fn new() -> Self {
        Self {
            num_rpcs: AtomicU64::new(0),
            start: Mutex::new(None),
            end_ns: AtomicU64::new(0),
        }
    }

    /// The first worker to get a permit for the stage marks its start.
    fn mark_start(&self) {
        let mut start = self.start.lock().unwrap();
        if start.is_none() {
            *start = Some((Instant::now(), Local::now()));
        }
    }

    fn note_call_done(&self, epoch: Instant) {
        let ns = epoch.elapsed().as_nanos() as u64;
        self.end_ns.fetch_max(ns, Ordering::Relaxed);
        self.num_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    fn start_time(&self) -> Option<DateTime<Local>> {
        self.start.lock().unwrap().map(|(_, at)| at)
    }

    fn elapsed(&self, epoch: Instant) -> Duration {
        match *self.start.lock().unwrap() {
            Some((at, _)) => {
                let end = epoch + Duration::from_nanos(self.end_ns.load(Ordering::Relaxed));
                end.saturating_duration_since(at)
            }
            None => Duration::ZERO,
        }
    }
}

/// Aborts the run if the worker holding it unwinds.
struct AbortOnPanic<'a> {
    tid: usize,
    aborter: &'a Aborter,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("runner: T{:03} panicked, aborting the run", self.tid);
            self.aborter.abort();
        }
    }
}

/// Worker loop. Runs calls as long as the scheduler hands out permits.
fn run_one(
    tid: usize,
    runner: &dyn Runnable,
    permits: Permits,
    states: &[StageState],
    rec: &dyn Recorder,
    aborter: &Aborter,
    epoch: Instant,
) {
    let _guard = AbortOnPanic { tid, aborter };
    let mut cur = None;
    let mut nr_calls: u64 = 0;

    while let Some(stage) = permits.ask() {
        if cur != Some(stage) {
            if let Some(prev) = cur {
                debug!("runner: T{:03} moving from stage {} to {}", tid, prev, stage);
            }
            states[stage].mark_start();
            cur = Some(stage);
        }

        let started = Instant::now();
        let ret = runner.run(tid);
        rec.record_rpc(ret.byte_size, "net", started.elapsed());
        states[stage].note_call_done(epoch);
        nr_calls += 1;
    }

    debug!("runner: T{:03} done after {} calls", tid, nr_calls);
}

/// Drives `RunnerOptions::runners` at the rate of each stage in turn.
///
/// The options are moved in and normalized. Unless the options carry their
/// own aborter, the runner creates one and subscribes it to the signal
/// broker so that an interrupt stops the run. A runner-owned aborter is
/// re-armed after each run so that `run()` can be called repeatedly. A
/// caller-supplied one stays closed once the run is over.
pub struct PeriodicRunner {
    opts: RunnerOptions,
    aborter: Arc<Aborter>,
    subscription: Option<Subscription>,
    clock: Arc<dyn Clock>,
    last_error: Option<anyhow::Error>,
}

impl PeriodicRunner {
    pub fn new(mut opts: RunnerOptions) -> Self {
        opts.normalize();

        let (aborter, subscription) = match opts.stop.clone() {
            Some(aborter) => {
                debug!("runner: using caller supplied aborter");
                (aborter, None)
            }
            None => {
                let (aborter, sub) = Self::arm(&opts);
                opts.stop = Some(aborter.clone());
                (aborter, Some(sub))
            }
        };

        Self {
            opts,
            aborter,
            subscription,
            clock: Arc::new(SystemClock),
            last_error: None,
        }
    }

    fn arm(opts: &RunnerOptions) -> (Arc<Aborter>, Subscription) {
        let broker = opts
            .signal_broker
            .clone()
            .unwrap_or_else(SignalBroker::global);
        let aborter = Aborter::new();
        let sub = broker.subscribe(&aborter);
        (aborter, sub)
    }

    /// The normalized options.
    pub fn options(&self) -> &RunnerOptions {
        &self.opts
    }

    /// Changes take effect on the next `run()`. Don't replace `stop`.
    pub fn options_mut(&mut self) -> &mut RunnerOptions {
        &mut self.opts
    }

    /// The aborter of the current or next run. Can be used from other
    /// threads to stop a run in progress.
    pub fn aborter(&self) -> Arc<Aborter> {
        self.aborter.clone()
    }

    pub fn abort(&self) {
        self.aborter.abort();
    }

    /// Error reported by the recorder at the end of the last run, if any.
    pub fn last_error(&self) -> Option<&anyhow::Error> {
        self.last_error.as_ref()
    }

    fn plan_stage(idx: usize, stage: &WorkloadStage, num_threads: &mut usize) -> StagePlan {
        let mut plan = StagePlan {
            requested_qps: "max".into(),
            requested_duration: "until stop".into(),
            num_calls: 0,
        };

        if stage.has_duration() {
            plan.requested_duration = format_duration(stage.duration.as_secs_f64());
        }
        if stage.use_exactly() {
            plan.requested_duration = format!("exactly {} calls", stage.exactly);
            plan.num_calls = stage.exactly;
        }

        if !stage.use_qps() {
            info!(
                "runner: stage {} at max qps with {} thread(s) for {}",
                idx, *num_threads, &plan.requested_duration
            );
            return plan;
        }

        plan.requested_qps = format!("{}", stage.qps);
        if !stage.has_duration() && !stage.use_exactly() {
            info!(
                "runner: stage {} at {} qps with {} thread(s) until interrupted",
                idx, stage.qps, *num_threads
            );
            return plan;
        }

        if !stage.use_exactly() {
            plan.num_calls = (stage.qps * stage.duration.as_secs_f64()) as u64;
        }
        if plan.num_calls < 2 {
            if stage.use_exactly() {
                debug!("runner: stage {} has a single call, using 1 thread", idx);
            } else {
                warn!(
                    "runner: stage {} increasing the number of calls to the minimum of 2 with 1 thread, total duration will increase",
                    idx
                );
                plan.num_calls = 2;
            }
            *num_threads = 1;
        } else if 2 * *num_threads as u64 > plan.num_calls {
            let new_nr = (plan.num_calls / 2) as usize;
            warn!(
                "runner: stage {} has {} calls in total, lowering threads from {} to {}",
                idx, plan.num_calls, *num_threads, new_nr
            );
            *num_threads = new_nr;
        }
        info!(
            "runner: stage {} at {} qps with {} thread(s) for {}: {} calls",
            idx, stage.qps, *num_threads, &plan.requested_duration, plan.num_calls
        );
        plan
    }

    /// Wait for `start_time` if set. It's an error if it's already past.
    fn wait_for_start(&self) -> Result<()> {
        let at = match self.opts.start_time {
            Some(at) => at,
            None => return Ok(()),
        };
        let now = Local::now();
        if at < now {
            bail!(
                "start time {} is {} in the past",
                at.format("%Y-%m-%d %H:%M:%S%.3f"),
                format_duration((now - at).num_milliseconds() as f64 * MSEC)
            );
        }
        let wait = (at - now).to_std()?;
        info!(
            "runner: waiting {} until the start time {}",
            format_duration(wait.as_secs_f64()),
            at.format("%Y-%m-%d %H:%M:%S%.3f")
        );
        if !self.clock.sleep(wait, &self.aborter.stop_chan()) {
            info!("runner: aborted while waiting for the start time");
        }
        Ok(())
    }

    /// Run every stage and report per-stage results. Fails without issuing
    /// any call if there are no runners or the start time has passed.
    pub fn run(&mut self) -> Result<RunnerResults> {
        let stages = self.opts.stages.clone();
        let mut num_threads = self.opts.num_threads.max(1);
        let plans: Vec<StagePlan> = stages
            .iter()
            .enumerate()
            .map(|(idx, stage)| Self::plan_stage(idx, stage, &mut num_threads))
            .collect();
        self.opts.num_threads = num_threads;

        if self.opts.runners.is_empty() {
            bail!("no runners, call make_runners() first");
        }
        if self.opts.runners.len() < num_threads {
            let nr_runners = self.opts.runners.len();
            let first = self.opts.runners[0].clone();
            self.opts.make_runners(first);
            warn!(
                "runner: only {} runners for {} threads, cloned the first one",
                nr_runners, num_threads
            );
        }

        self.wait_for_start()?;

        let rec: Arc<dyn Recorder> = self
            .opts
            .recorder
            .clone()
            .unwrap_or_else(|| Arc::new(DiscardRecorder));
        rec.start_recording();

        let stop = self.aborter.stop_chan();
        let (sched, permits) = QpsScheduler::new(
            &stages,
            plans.iter().map(|p| p.num_calls).collect(),
            self.opts.jitter,
            self.opts.resolution,
            self.clock.clone(),
        );
        let epoch = Instant::now();
        let sc = StepCounter::new(epoch, self.opts.step_interval);
        let states: Vec<StageState> = stages.iter().map(|_| StageState::new()).collect();

        let runners = &self.opts.runners;
        let aborter = &self.aborter;
        let (rec_ref, states_ref, sc_ref, stop_ref) = (&*rec, &states[..], &sc, &stop);

        let hists: Vec<SleepHistogram> = thread::scope(|s| {
            let sched_jh = s.spawn(move || sched.run(rec_ref, sc_ref, stop_ref));

            if num_threads <= 1 {
                debug!("runner: running single threaded");
                run_one(0, &*runners[0], permits, states_ref, rec_ref, aborter, epoch);
            } else {
                let jhs: Vec<_> = (0..num_threads)
                    .map(|tid| {
                        let runner = &*runners[tid];
                        let permits = permits.clone();
                        s.spawn(move || {
                            run_one(tid, runner, permits, states_ref, rec_ref, aborter, epoch)
                        })
                    })
                    .collect();
                // workers own their permit receivers from here on
                drop(permits);

                // a panicking worker has already aborted the run
                let mut panicked = None;
                for jh in jhs {
                    if let Err(e) = jh.join() {
                        panicked.get_or_insert(e);
                    }
                }
                if let Some(e) = panicked {
                    std::panic::resume_unwind(e);
                }
            }

            match sched_jh.join() {
                Ok(hists) => hists,
                Err(e) => std::panic::resume_unwind(e),
            }
        });

        let mut results = RunnerResults {
            run_type: self.opts.run_type.clone(),
            labels: self.opts.labels.clone(),
            version: VERSION.to_string(),
            num_threads,
            stages: vec![],
        };

        for (idx, ((stage, plan), (state, hist))) in stages
            .iter()
            .zip(plans.iter())
            .zip(states.iter().zip(hists.iter()))
            .enumerate()
        {
            let num_rpcs = state.num_rpcs.load(Ordering::Relaxed);
            let elapsed = state.elapsed(epoch);
            let actual_qps = if elapsed > Duration::ZERO {
                num_rpcs as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            };
            info!(
                "runner: stage {} ended after {}: {} calls, qps={:.5}",
                idx,
                format_duration(elapsed.as_secs_f64()),
                num_rpcs,
                actual_qps
            );

            if stage.use_qps() && hist.count() > 0 {
                if hist.frac_negative() > BEHIND_WARN_FRAC {
                    warn!(
                        "runner: stage {} {}% of sleeps were falling behind ({})",
                        idx,
                        format_pct(hist.frac_negative()),
                        hist.summary()
                    );
                } else {
                    debug!("runner: stage {} sleep time {}", idx, hist.summary());
                }
            }

            let mut requested_duration = plan.requested_duration.clone();
            if stage.use_exactly() && num_rpcs != stage.exactly {
                requested_duration += &format!(", interrupted after {}", num_rpcs);
            }

            results.stages.push(StageResults {
                start_time: state.start_time(),
                requested_qps: plan.requested_qps.clone(),
                requested_duration,
                actual_qps,
                actual_duration: elapsed,
                num_calls: num_rpcs,
                exactly: stage.exactly,
                jitter: self.opts.jitter,
                sleep_behind_pct: hist.frac_negative() * TO_PCT,
            });
        }

        self.last_error = match rec.close() {
            Ok(()) => None,
            Err(e) => {
                error!("runner: {:#}", &e);
                Some(e)
            }
        };

        if !self.aborter.is_aborted() {
            debug!("runner: closing the stop channel");
            self.aborter.abort();
        }
        if self.subscription.is_some() {
            // the old watcher has seen the stop channel close, drop it before
            // subscribing the fresh aborter
            self.subscription = None;
            let (aborter, sub) = Self::arm(&self.opts);
            self.opts.stop = Some(aborter.clone());
            self.aborter = aborter;
            self.subscription = Some(sub);
        }

        Ok(results)
    }
}

impl Drop for PeriodicRunner {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            self.aborter.abort();
        }
    }
}
