// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use util::*;

use super::abort::{Aborter, SignalBroker};
use super::recorder::{DiscardRecorder, Recorder};

/// What a single call reports back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunRet {
    pub byte_size: usize,
}

/// The unit of work issued at the target rate. `thread_id` is the index of
/// the worker slot making the call.
pub trait Runnable: Send + Sync {
    fn run(&self, thread_id: usize) -> RunRet;
}

impl<F> Runnable for F
where
    F: Fn(usize) -> RunRet + Send + Sync,
{
    fn run(&self, thread_id: usize) -> RunRet {
        self(thread_id)
    }
}

/// One phase of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadStage {
    /// Target rate across all threads. 0 picks the default rate and a
    /// negative value means max speed.
    pub qps: f64,
    /// Stage length. 0 runs until `exactly` calls or until stopped.
    #[serde(with = "util::dur_secs")]
    pub duration: Duration,
    /// If >0, issue exactly this many calls regardless of `duration`.
    pub exactly: u64,
}

impl WorkloadStage {
    pub const DFL_QPS: f64 = 8.0;
    pub const DFL_DURATION: Duration = Duration::from_secs(5);

    pub fn new(qps: f64, duration: Duration) -> Self {
        Self {
            qps,
            duration,
            exactly: 0,
        }
    }

    pub fn exactly(qps: f64, duration: Duration, exactly: u64) -> Self {
        Self {
            qps,
            duration,
            exactly,
        }
    }

    pub fn use_qps(&self) -> bool {
        self.qps > 0.0
    }

    pub fn use_exactly(&self) -> bool {
        self.exactly > 0
    }

    pub fn has_duration(&self) -> bool {
        self.duration > Duration::ZERO
    }
}

/// Parameters of a periodic run.
///
/// The serializable part can be loaded from a commented JSON file. The
/// runtime collaborators (runners, aborter, recorder and signal broker) are
/// attached in code. `PeriodicRunner::new()` takes the options by value and
/// normalizes them, see `normalize()` for the defaults.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Free-form run type, echoed into the results.
    pub run_type: String,
    /// Free-form labels, echoed into the results and used in `id()`.
    pub labels: String,
    pub stages: Vec<WorkloadStage>,
    /// Worker thread count. 0 picks the default. May be lowered per stage
    /// so that every thread gets at least two calls.
    pub num_threads: usize,
    /// Perturb every pacing sleep by up to +/-10% to desynchronize
    /// independently started runners.
    pub jitter: bool,
    /// Bucket width of the sleep time histograms in seconds.
    pub resolution: f64,
    /// Period of the recorder's step snapshots.
    #[serde(with = "util::dur_secs")]
    pub step_interval: Duration,
    /// If set, don't issue any call before this instant. It's an error if
    /// it has already passed when the run starts.
    pub start_time: Option<DateTime<Local>>,

    #[serde(skip)]
    pub runners: Vec<Arc<dyn Runnable>>,
    #[serde(skip)]
    pub stop: Option<Arc<Aborter>>,
    #[serde(skip)]
    pub recorder: Option<Arc<dyn Recorder>>,
    #[serde(skip)]
    pub signal_broker: Option<Arc<SignalBroker>>,
}

impl RunnerOptions {
    pub const DFL_NUM_THREADS: usize = 4;
    pub const DFL_RESOLUTION: f64 = MSEC;
    pub const DFL_STEP_INTERVAL: Duration = Duration::from_secs(1);

    /// Fill in defaults and clamp. Idempotent.
    pub fn normalize(&mut self) {
        if self.stages.is_empty() {
            debug!("options: no stages, using the default one");
            self.stages.push(WorkloadStage::new(
                WorkloadStage::DFL_QPS,
                WorkloadStage::DFL_DURATION,
            ));
        }
        for stage in self.stages.iter_mut() {
            if stage.qps == 0.0 || stage.qps.is_nan() {
                stage.qps = WorkloadStage::DFL_QPS;
            } else if stage.qps < 0.0 {
                debug!(
                    "options: negative qps {} means max speed mode, no wait between calls",
                    stage.qps
                );
                stage.qps = -1.0;
            }
        }
        if self.num_threads == 0 {
            self.num_threads = Self::DFL_NUM_THREADS;
        }
        if self.resolution <= 0.0 || self.resolution.is_nan() {
            self.resolution = Self::DFL_RESOLUTION;
        }
        if self.step_interval == Duration::ZERO {
            self.step_interval = Self::DFL_STEP_INTERVAL;
        }
        if self.recorder.is_none() {
            self.recorder = Some(Arc::new(DiscardRecorder));
        }
        if self.signal_broker.is_none() {
            self.signal_broker = Some(SignalBroker::global());
        }
    }

    /// Fill every thread slot with `runnable`, for workloads which don't
    /// need per-thread state.
    pub fn make_runners(&mut self, runnable: Arc<dyn Runnable>) {
        let nr = self.num_threads.max(1);
        if self.runners.len() != nr {
            info!(
                "options: resizing runners from {} to {}",
                self.runners.len(),
                nr
            );
        }
        self.runners = (0..nr).map(|_| runnable.clone()).collect();
    }

    pub fn release_runners(&mut self) {
        self.runners.clear();
    }

    /// Abort the current or next run.
    pub fn abort(&self) {
        if let Some(stop) = self.stop.as_ref() {
            stop.abort();
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            run_type: String::new(),
            labels: String::new(),
            stages: vec![WorkloadStage::new(
                WorkloadStage::DFL_QPS,
                WorkloadStage::DFL_DURATION,
            )],
            num_threads: Self::DFL_NUM_THREADS,
            jitter: false,
            resolution: Self::DFL_RESOLUTION,
            step_interval: Self::DFL_STEP_INTERVAL,
            start_time: None,
            runners: vec![],
            stop: None,
            recorder: None,
            signal_broker: None,
        }
    }
}

impl fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("run_type", &self.run_type)
            .field("labels", &self.labels)
            .field("stages", &self.stages)
            .field("num_threads", &self.num_threads)
            .field("jitter", &self.jitter)
            .field("resolution", &self.resolution)
            .field("step_interval", &self.step_interval)
            .field("start_time", &self.start_time)
            .field("nr_runners", &self.runners.len())
            .field("has_stop", &self.stop.is_some())
            .field("has_recorder", &self.recorder.is_some())
            .finish()
    }
}

impl JsonLoad for RunnerOptions {}

impl JsonSave for RunnerOptions {
    fn preamble() -> Option<String> {
        Some(
            r#"// Periodic runner options
//
// stages[].qps: Target rate, 0 for the default (8), negative for max speed
// stages[].duration: Seconds or a duration string ("1.5M"), 0 for endless
// stages[].exactly: Issue exactly this many calls if >0
// num_threads: Worker threads, 0 for the default (4)
// jitter: Perturb pacing sleeps by up to +/-10%
// resolution: Sleep time histogram resolution in seconds
// step_interval: Statistics snapshot period
// start_time: Optional RFC 3339 start time
//
"#
            .into(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{RunRet, Runnable, RunnerOptions, WorkloadStage};
    use crate::abort::{Aborter, SignalBroker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use util::*;

    #[test]
    fn test_normalize() {
        let _ = ::env_logger::try_init();
        let mut opts = RunnerOptions {
            stages: vec![
                WorkloadStage::new(0.0, Duration::ZERO),
                WorkloadStage::new(-5.0, Duration::from_secs(3)),
                WorkloadStage::exactly(120.0, Duration::ZERO, 40),
            ],
            num_threads: 0,
            resolution: -1.0,
            step_interval: Duration::ZERO,
            signal_broker: Some(SignalBroker::new()),
            ..Default::default()
        };
        opts.normalize();

        assert_eq!(opts.stages[0].qps, 8.0);
        // endless stays endless
        assert_eq!(opts.stages[0].duration, Duration::ZERO);
        assert_eq!(opts.stages[1].qps, -1.0);
        assert!(!opts.stages[1].use_qps());
        assert_eq!(opts.stages[2].qps, 120.0);
        assert!(opts.stages[2].use_exactly());
        assert_eq!(opts.num_threads, 4);
        assert_eq!(opts.resolution, 0.001);
        assert_eq!(opts.step_interval, Duration::from_secs(1));
        assert!(opts.recorder.is_some());

        let mut empty = RunnerOptions {
            stages: vec![],
            num_threads: 7,
            signal_broker: Some(SignalBroker::new()),
            ..Default::default()
        };
        empty.normalize();
        assert_eq!(empty.stages, vec![WorkloadStage::new(8.0, Duration::from_secs(5))]);
        assert_eq!(empty.num_threads, 7);
    }

    #[test]
    fn test_make_runners() {
        let _ = ::env_logger::try_init();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let runnable: Arc<dyn Runnable> = Arc::new(move |_tid: usize| {
            c.fetch_add(1, Ordering::Relaxed);
            RunRet { byte_size: 3 }
        });

        let mut opts = RunnerOptions {
            num_threads: 3,
            ..Default::default()
        };
        opts.make_runners(runnable);
        assert_eq!(opts.runners.len(), 3);
        for (tid, r) in opts.runners.iter().enumerate() {
            assert_eq!(r.run(tid).byte_size, 3);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        opts.release_runners();
        assert!(opts.runners.is_empty());
    }

    #[test]
    fn test_abort_options() {
        let _ = ::env_logger::try_init();
        let mut opts = RunnerOptions::default();
        // no aborter yet, nothing to do
        opts.abort();

        let stop = Aborter::new();
        opts.stop = Some(stop.clone());
        opts.abort();
        opts.abort();
        assert!(stop.is_aborted());
    }

    #[test]
    fn test_load_options() {
        let _ = ::env_logger::try_init();
        let input = r#"// lopri client
{
  "run_type": "lopri",
  "stages": [
    { "qps": 1000, "duration": "1M" },
    { "qps": -1, "exactly": 500 }
  ],
  "num_threads": 16,
  "jitter": true,
  "start_time": "2021-03-04T05:06:07+00:00"
}
"#;
        let mut opts = RunnerOptions::from_json_str(input).unwrap();
        assert_eq!(opts.run_type, "lopri");
        assert_eq!(opts.stages.len(), 2);
        assert_eq!(opts.stages[0].duration, Duration::from_secs(60));
        assert_eq!(opts.stages[1].duration, Duration::ZERO);
        assert_eq!(opts.stages[1].exactly, 500);
        assert_eq!(opts.num_threads, 16);
        assert!(opts.jitter);
        assert_eq!(opts.resolution, 0.001);
        assert_eq!(opts.start_time.unwrap().timestamp(), 1614834367);

        opts.signal_broker = Some(SignalBroker::new());
        opts.normalize();
        assert_eq!(opts.stages[1].qps, -1.0);

        let out = opts.as_json().unwrap();
        assert!(out.starts_with("// Periodic runner options"));
        let reloaded = RunnerOptions::from_json_str(&out).unwrap();
        assert_eq!(reloaded.stages, opts.stages);
        assert_eq!(reloaded.start_time, opts.start_time);
    }
}
