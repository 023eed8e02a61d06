use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Default)]
struct Event {
    started: Option<Instant>,
    samples: Vec<Duration>,
}

/// Named interval timer for benchmark stages.
///
/// `start` marks the beginning of an interval; every `accumulate` closes it,
/// records one sample and restarts the interval from that point.
#[derive(Default)]
pub struct Profiler {
    events: BTreeMap<String, Event>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, name: &str) {
        self.events.entry(name.to_string()).or_default().started = Some(Instant::now());
    }

    pub fn accumulate(&mut self, name: &str) {
        let now = Instant::now();
        let Some(event) = self.events.get_mut(name) else {
            warn!(event = name, "accumulate without matching start");
            return;
        };
        let Some(started) = event.started else {
            warn!(event = name, "accumulate without matching start");
            return;
        };
        event.samples.push(now - started);
        event.started = Some(now);
    }

    /// Adds an externally measured sample.
    pub fn record(&mut self, name: &str, elapsed: Duration) {
        self.events
            .entry(name.to_string())
            .or_default()
            .samples
            .push(elapsed);
    }

    pub fn count(&self, name: &str) -> usize {
        self.samples_ms(name).len()
    }

    pub fn total_ms(&self, name: &str) -> f64 {
        self.samples_ms(name).iter().sum()
    }

    pub fn average_ms(&self, name: &str) -> f64 {
        let samples = self.samples_ms(name);
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn median_ms(&self, name: &str) -> f64 {
        let mut samples = self.samples_ms(name);
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(f64::total_cmp);
        let n = samples.len();
        if n % 2 == 1 {
            samples[n / 2]
        } else {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        }
    }

    /// Population standard deviation.
    pub fn stddev_ms(&self, name: &str) -> f64 {
        let samples = self.samples_ms(name);
        if samples.is_empty() {
            return 0.0;
        }
        let mean = self.average_ms(name);
        let variance =
            samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / samples.len() as f64;
        variance.sqrt()
    }

    pub fn report(&self, use_median: bool, show_stddev: bool) -> String {
        let mut report = String::from("Profiling breakdown:\n");
        for name in self.events.keys() {
            if self.count(name) == 0 {
                continue;
            }
            let center = if use_median {
                self.median_ms(name)
            } else {
                self.average_ms(name)
            };
            report.push_str(&format!("  {}: {:.3}ms", name, center));
            if show_stddev {
                report.push_str(&format!(" ± {:.3}ms", self.stddev_ms(name)));
            }
            report.push('\n');
        }
        report
    }

    pub fn remove(&mut self, name: &str) {
        self.events.remove(name);
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    fn samples_ms(&self, name: &str) -> Vec<f64> {
        self.events
            .get(name)
            .map(|event| {
                event
                    .samples
                    .iter()
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler_with(samples_ms: &[u64]) -> Profiler {
        let mut profiler = Profiler::new();
        for ms in samples_ms {
            profiler.record("stage", Duration::from_millis(*ms));
        }
        profiler
    }

    #[test]
    fn statistics_over_recorded_samples() {
        let profiler = profiler_with(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert_eq!(profiler.count("stage"), 8);
        assert!((profiler.total_ms("stage") - 40.0).abs() < 1e-9);
        assert!((profiler.average_ms("stage") - 5.0).abs() < 1e-9);
        assert!((profiler.median_ms("stage") - 4.5).abs() < 1e-9);
        assert!((profiler.stddev_ms("stage") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn median_of_odd_count_is_middle_sample() {
        let profiler = profiler_with(&[9, 1, 3]);
        assert!((profiler.median_ms("stage") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_event_reports_zero() {
        let profiler = Profiler::new();
        assert_eq!(profiler.average_ms("missing"), 0.0);
        assert_eq!(profiler.median_ms("missing"), 0.0);
        assert_eq!(profiler.stddev_ms("missing"), 0.0);
    }

    #[test]
    fn accumulate_without_start_is_ignored() {
        let mut profiler = Profiler::new();
        profiler.accumulate("never_started");
        assert_eq!(profiler.count("never_started"), 0);
    }

    #[test]
    fn accumulate_restarts_interval() {
        let mut profiler = Profiler::new();
        profiler.start("loop");
        profiler.accumulate("loop");
        profiler.accumulate("loop");
        assert_eq!(profiler.count("loop"), 2);
    }

    #[test]
    fn report_lists_events_and_reset_clears_them() {
        let mut profiler = profiler_with(&[1, 3]);
        let report = profiler.report(false, true);
        assert!(report.contains("stage: 2.000ms ± 1.000ms"));

        profiler.reset();
        assert_eq!(profiler.count("stage"), 0);
        assert_eq!(profiler.report(true, false), "Profiling breakdown:\n");
    }
}
