// Copyright (c) Facebook, Inc. and its affiliates.
use std::collections::BTreeMap;
use util::*;

/// Distribution of the scheduler's computed sleep times in seconds.
/// Negative sleeps, where the scheduler was already behind the target,
/// are kept in their own bucket. The rest are bucketed at `resolution`.
#[derive(Clone, Debug)]
pub struct SleepHistogram {
    resolution: f64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    nr_negative: u64,
    buckets: BTreeMap<u64, u64>,
}

impl SleepHistogram {
    pub fn new(resolution: f64) -> Self {
        Self {
            resolution: if resolution > 0.0 { resolution } else { MSEC },
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            nr_negative: 0,
            buckets: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, secs: f64) {
        if self.count == 0 {
            self.min = secs;
            self.max = secs;
        } else {
            self.min = self.min.min(secs);
            self.max = self.max.max(secs);
        }
        self.count += 1;
        self.sum += secs;

        if secs < 0.0 {
            self.nr_negative += 1;
        } else {
            let idx = (secs / self.resolution) as u64;
            *self.buckets.entry(idx).or_insert(0) += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn nr_negative(&self) -> u64 {
        self.nr_negative
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Share of samples which were behind schedule, [0.0, 1.0].
    pub fn frac_negative(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.nr_negative as f64 / self.count as f64
        }
    }

    /// Estimate the `pct`th percentile (0-100). Values are reported as the
    /// upper edge of the bucket they fall in, clamped to the observed range.
    /// Anything in the negative bucket is reported as the minimum.
    pub fn percentile(&self, pct: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((pct.clamp(0.0, 100.0) / 100.0) * self.count as f64).ceil() as u64;
        let target = target.max(1);

        let mut seen = self.nr_negative;
        if seen >= target {
            return self.min;
        }
        for (idx, cnt) in self.buckets.iter() {
            seen += cnt;
            if seen >= target {
                let edge = (*idx + 1) as f64 * self.resolution;
                return edge.clamp(self.min, self.max);
            }
        }
        self.max
    }

    pub fn summary(&self) -> String {
        format!(
            "n={} avg={} min={} p50={} p90={} max={} behind={}%",
            self.count,
            format_duration(self.mean()),
            format_duration(self.min),
            format_duration(self.percentile(50.0)),
            format_duration(self.percentile(90.0)),
            format_duration(self.max),
            format_pct(self.frac_negative()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SleepHistogram;

    #[test]
    fn test_sleep_histogram() {
        let _ = ::env_logger::try_init();
        let mut h = SleepHistogram::new(0.001);
        assert_eq!(h.count(), 0);
        assert_eq!(h.percentile(50.0), 0.0);
        assert_eq!(h.frac_negative(), 0.0);

        for v in &[-0.002, -0.0005, 0.0001, 0.0004, 0.0015, 0.0025, 0.0031, 0.0099] {
            h.record(*v);
        }
        println!("{}", h.summary());

        assert_eq!(h.count(), 8);
        assert_eq!(h.nr_negative(), 2);
        assert_eq!(h.frac_negative(), 0.25);
        assert_eq!(h.min(), -0.002);
        assert_eq!(h.max(), 0.0099);
        assert!((h.mean() - 0.015 / 8.0).abs() < 1e-12);

        // the two negative samples
        assert_eq!(h.percentile(10.0), -0.002);
        assert_eq!(h.percentile(25.0), -0.002);
        // third and fourth samples share the [0, 1ms) bucket
        assert!((h.percentile(50.0) - 0.001).abs() < 1e-12);
        assert!((h.percentile(75.0) - 0.003).abs() < 1e-12);
        // clamped to the observed max
        assert_eq!(h.percentile(100.0), 0.0099);
    }
}
