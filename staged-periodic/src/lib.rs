// Copyright (c) Facebook, Inc. and its affiliates.

//! Staged QPS scheduler and load generation runner.
//!
//! A `PeriodicRunner` drives a pool of worker threads which issue calls to
//! caller supplied `Runnable`s at a target rate, one `WorkloadStage` after
//! another. Pacing is centralized in a single scheduler thread so that the
//! workers collectively track one arrival schedule.
pub mod abort;
pub mod clock;
pub mod hist;
pub mod options;
pub mod recorder;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod step;

pub use abort::{Aborter, SignalBroker, Subscription};
pub use clock::{Clock, SystemClock};
pub use hist::SleepHistogram;
pub use options::{RunRet, Runnable, RunnerOptions, WorkloadStage};
pub use recorder::{DiscardRecorder, LatencyPcts, Recorder, StatsRecorder, StepRecord};
pub use report::{RunnerResults, StageResults};
pub use runner::PeriodicRunner;
pub use scheduler::{Permits, QpsScheduler};
pub use step::StepCounter;

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
