// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use log::{debug, error, trace};
use quantiles::ckms::CKMS;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sink for per-call statistics. Called concurrently from every worker.
pub trait Recorder: Send + Sync {
    fn start_recording(&self);
    fn record_rpc(&self, byte_size: usize, kind: &str, latency: Duration);
    /// Snapshot and reset the statistics accumulated since the last step.
    fn done_step(&self, label: &str);
    fn close(&self) -> Result<()>;
}

/// Drops everything on the floor.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardRecorder;

impl Recorder for DiscardRecorder {
    fn start_recording(&self) {}
    fn record_rpc(&self, _byte_size: usize, _kind: &str, _latency: Duration) {}
    fn done_step(&self, _label: &str) {}
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Latency percentiles of one kind of call, in nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPcts {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// One JSON line written by `StatsRecorder` per step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub label: String,
    pub timestamp: Option<DateTime<Local>>,
    pub dur: f64,
    pub num_rpcs: u64,
    pub num_bytes: u64,
    pub rps: f64,
    pub bps: f64,
    pub cum_num_rpcs: u64,
    pub latency: BTreeMap<String, LatencyPcts>,
}

struct StatsInner {
    out: Box<dyn Write + Send>,
    recording: bool,
    step_at: Instant,
    num_rpcs: u64,
    num_bytes: u64,
    cum_num_rpcs: u64,
    lats: HashMap<String, CKMS<f64>>,
    first_err: Option<anyhow::Error>,
}

/// Writes a `StepRecord` JSON line for every step. Write errors don't
/// interrupt recording. The first one is kept and returned from `close()`.
pub struct StatsRecorder {
    inner: Mutex<StatsInner>,
}

impl StatsRecorder {
    const CKMS_ERROR: f64 = 0.001;

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                out,
                recording: false,
                step_at: Instant::now(),
                num_rpcs: 0,
                num_bytes: 0,
                cum_num_rpcs: 0,
                lats: HashMap::new(),
                first_err: None,
            }),
        }
    }

    /// Total calls recorded since `start_recording()`.
    pub fn cum_num_rpcs(&self) -> u64 {
        self.inner.lock().unwrap().cum_num_rpcs
    }

    fn latency_pcts(ckms: &CKMS<f64>) -> Option<LatencyPcts> {
        let q = |p: f64| ckms.query(p).map(|(_, v)| v as u64);
        Some(LatencyPcts {
            p50: q(0.50)?,
            p90: q(0.90)?,
            p95: q(0.95)?,
            p99: q(0.99)?,
        })
    }

    fn write_line(inner: &mut StatsInner, rec: &StepRecord) -> Result<()> {
        let mut line = serde_json::to_string(rec)?;
        line += "\n";
        inner.out.write_all(line.as_bytes())?;
        inner.out.flush()?;
        Ok(())
    }
}

impl Recorder for StatsRecorder {
    fn start_recording(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug!("recorder: start recording");
        inner.recording = true;
        inner.step_at = Instant::now();
        inner.num_rpcs = 0;
        inner.num_bytes = 0;
        inner.cum_num_rpcs = 0;
        inner.lats.clear();
    }

    fn record_rpc(&self, byte_size: usize, kind: &str, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.recording {
            return;
        }
        inner.num_rpcs += 1;
        inner.num_bytes += byte_size as u64;
        inner.cum_num_rpcs += 1;
        let lat = latency.as_nanos() as f64;
        match inner.lats.get_mut(kind) {
            Some(ckms) => ckms.insert(lat),
            None => {
                let mut ckms = CKMS::<f64>::new(Self::CKMS_ERROR);
                ckms.insert(lat);
                inner.lats.insert(kind.to_string(), ckms);
            }
        };
    }

    fn done_step(&self, label: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.recording {
            return;
        }
        let now = Instant::now();
        let dur = now.duration_since(inner.step_at).as_secs_f64();
        let (rps, bps) = if dur > 0.0 {
            (
                inner.num_rpcs as f64 / dur,
                inner.num_bytes as f64 / dur,
            )
        } else {
            (0.0, 0.0)
        };

        let rec = StepRecord {
            label: label.to_string(),
            timestamp: Some(Local::now()),
            dur,
            num_rpcs: inner.num_rpcs,
            num_bytes: inner.num_bytes,
            rps,
            bps,
            cum_num_rpcs: inner.cum_num_rpcs,
            latency: inner
                .lats
                .iter()
                .filter_map(|(kind, ckms)| Some((kind.clone(), Self::latency_pcts(ckms)?)))
                .collect(),
        };
        trace!("recorder: {:?}", &rec);

        if let Err(e) = Self::write_line(&mut inner, &rec) {
            if inner.first_err.is_none() {
                error!("recorder: failed to write step {:?} ({:#})", label, &e);
                inner.first_err = Some(e);
            }
        }

        inner.step_at = now;
        inner.num_rpcs = 0;
        inner.num_bytes = 0;
        inner.lats.clear();
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.recording = false;
        if let Err(e) = inner.out.flush() {
            if inner.first_err.is_none() {
                inner.first_err = Some(e.into());
            }
        }
        match inner.first_err.take() {
            Some(e) => Err(anyhow!("recording stats failed: {:#}", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscardRecorder, Recorder, StatsRecorder, StepRecord};
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_discard_recorder() {
        let rec = DiscardRecorder;
        rec.start_recording();
        rec.record_rpc(10, "net", Duration::from_millis(1));
        rec.done_step("step=0");
        assert!(rec.close().is_ok());
    }

    #[test]
    fn test_stats_recorder_steps() {
        let _ = ::env_logger::try_init();
        let buf = SharedBuf::default();
        let rec = StatsRecorder::new(Box::new(buf.clone()));

        // ignored before recording starts
        rec.record_rpc(1, "net", Duration::from_millis(1));
        rec.done_step("early");
        assert!(buf.0.lock().unwrap().is_empty());

        rec.start_recording();
        for i in 1..=100u64 {
            rec.record_rpc(10, "net", Duration::from_micros(i));
        }
        rec.done_step("step=0");
        rec.record_rpc(5, "net", Duration::from_micros(7));
        rec.done_step("step=1");
        assert_eq!(rec.cum_num_rpcs(), 101);
        assert!(rec.close().is_ok());

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<StepRecord> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0].label, "step=0");
        assert_eq!(lines[0].num_rpcs, 100);
        assert_eq!(lines[0].num_bytes, 1000);
        let net = &lines[0].latency["net"];
        println!("{:?}", net);
        assert!(net.p50 >= 45_000 && net.p50 <= 55_000);
        assert!(net.p99 >= 95_000 && net.p99 <= 100_000);
        assert!(net.p50 <= net.p90 && net.p90 <= net.p95 && net.p95 <= net.p99);

        assert_eq!(lines[1].num_rpcs, 1);
        assert_eq!(lines[1].cum_num_rpcs, 101);
        assert_eq!(lines[1].latency["net"].p50, 7_000);
    }

    #[test]
    fn test_stats_recorder_write_error() {
        let _ = ::env_logger::try_init();
        let rec = StatsRecorder::new(Box::new(BrokenPipe));
        rec.start_recording();
        rec.record_rpc(10, "net", Duration::from_millis(1));
        rec.done_step("step=0");
        rec.done_step("step=1");
        // recording continues regardless
        rec.record_rpc(10, "net", Duration::from_millis(1));
        assert_eq!(rec.cum_num_rpcs(), 2);

        let err = rec.close().unwrap_err();
        assert!(format!("{:#}", err).contains("gone"));
        // the error is reported once
        assert!(rec.close().is_ok());
    }
}
