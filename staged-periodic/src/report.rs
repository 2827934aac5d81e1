// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use util::*;

const RESULTS_DOC: &str = "\
//
// Periodic runner results
//
//  run_type, labels: Echoed from the run options
//  version: Version of the runner
//  num_threads: Worker threads of the last stage after thread lowering
//  stages[].start_time: When the first call of the stage was issued
//  stages[].requested_qps: Target rate or \"max\"
//  stages[].requested_duration: Target duration, exact count or \"until stop\"
//  stages[].actual_qps: Achieved rate
//  stages[].actual_duration: Seconds from the first call to the last worker finishing
//  stages[].num_calls: Calls issued
//  stages[].exactly: Requested exact call count, 0 if none
//  stages[].jitter: Whether pacing jitter was enabled
//  stages[].sleep_behind_pct: Percentage of pacing sleeps which were behind schedule
//
";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageResults {
    pub start_time: Option<DateTime<Local>>,
    pub requested_qps: String,
    pub requested_duration: String,
    pub actual_qps: f64,
    #[serde(with = "util::dur_secs")]
    pub actual_duration: Duration,
    pub num_calls: u64,
    pub exactly: u64,
    pub jitter: bool,
    pub sleep_behind_pct: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerResults {
    pub run_type: String,
    pub labels: String,
    pub version: String,
    pub num_threads: usize,
    pub stages: Vec<StageResults>,
}

impl RunnerResults {
    pub const ID_MAX_LEN: usize = 96;

    /// `YYYY-MM-DD-HHMMSS` of the first stage's start followed by the labels
    /// reduced to alphanumerics separated by single `_`s, truncated to
    /// `ID_MAX_LEN` bytes. The current time stands in if no stage started.
    pub fn id(&self) -> String {
        let start = self
            .stages
            .first()
            .and_then(|s| s.start_time)
            .unwrap_or_else(Local::now);
        let mut id = start.format("%Y-%m-%d-%H%M%S").to_string();
        if self.labels.is_empty() {
            return id;
        }

        let mut last = '_';
        id.push(last);
        for ch in self.labels.chars() {
            if ch.is_ascii_alphanumeric() {
                last = ch;
            } else if last == '_' {
                continue;
            } else {
                last = '_';
            }
            id.push(last);
        }
        if last == '_' {
            id.pop();
        }
        // everything is ascii by now
        id.truncate(Self::ID_MAX_LEN);
        id
    }

    pub fn total_calls(&self) -> u64 {
        self.stages.iter().map(|s| s.num_calls).sum()
    }
}

impl JsonLoad for RunnerResults {}

impl JsonSave for RunnerResults {
    fn preamble() -> Option<String> {
        Some(RESULTS_DOC.to_string())
    }
}

impl fmt::Display for RunnerResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} run_type={:?} labels={:?} threads={} version={}",
            self.id(),
            &self.run_type,
            &self.labels,
            self.num_threads,
            &self.version
        )?;
        for (idx, s) in self.stages.iter().enumerate() {
            writeln!(
                f,
                "[{}] qps={}/{:.2} dur={}/{} calls={} behind={}%{}",
                idx,
                &s.requested_qps,
                s.actual_qps,
                &s.requested_duration,
                format_duration(s.actual_duration.as_secs_f64()),
                s.num_calls,
                format_pct(s.sleep_behind_pct / TO_PCT),
                if s.jitter { " jitter" } else { "" }
            )?;
        }
        Ok(())
    }
}
