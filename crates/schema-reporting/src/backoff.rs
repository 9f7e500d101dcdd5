//! Advice on when an agent should report again.
//!
//! Agents of a fleet that restarts at once would otherwise keep reporting in lockstep. The
//! interval gets a random spread that grows with the fleet, so the reports of a large fleet
//! drift apart after a few rounds. The advice is not enforced.

use std::time::Duration;

use rand::Rng;

/// Whether the report the advice answers was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReportOutcome {
    Success,
    Failure,
}

/// Computes the delay before the next report of an agent.
pub trait BackoffPolicy: Send + Sync {
    /// `fleet_size` is the number of active agents of the graph the reporter belongs to.
    fn next_interval_seconds(&self, fleet_size: usize, outcome: ReportOutcome) -> u32;
}

/// Shortest interval ever advised after a success.
const MIN_SUCCESS_INTERVAL: f64 = 1.0;

/// Shortest interval ever advised after a failure.
const MIN_FAILURE_INTERVAL: f64 = 5.0 * MIN_SUCCESS_INTERVAL;

/// A fixed base interval with a fleet-size dependent random spread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredBackoff {
    pub base_interval: Duration,
    /// The interval after a failure is this many base intervals.
    pub failure_multiplier: u32,
    /// Spread per natural logarithm of the fleet size, as a ratio of the base interval.
    pub jitter_ratio: f64,
    /// Upper bound of the spread, as a ratio of the base interval.
    pub max_jitter_ratio: f64,
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            failure_multiplier: 5,
            jitter_ratio: 0.1,
            max_jitter_ratio: 0.5,
        }
    }
}

impl JitteredBackoff {
    /// Half width of the random window around the base interval, in seconds.
    pub fn spread(&self, fleet_size: usize) -> f64 {
        let base = self.base_interval.as_secs_f64();
        let growing = base * self.jitter_ratio * (fleet_size as f64).ln_1p();

        growing.min(base * self.max_jitter_ratio).max(0.0)
    }

    pub fn interval_with_rng<R: Rng + ?Sized>(&self, rng: &mut R, fleet_size: usize, outcome: ReportOutcome) -> u32 {
        let base = self.base_interval.as_secs_f64();
        let spread = self.spread(fleet_size);

        let seconds = match outcome {
            ReportOutcome::Success => {
                let jitter = if spread > 0.0 { rng.gen_range(-spread..=spread) } else { 0.0 };
                (base + jitter).round().max(MIN_SUCCESS_INTERVAL)
            }
            ReportOutcome::Failure => {
                let jitter = if spread > 0.0 { rng.gen_range(0.0..=spread) } else { 0.0 };
                (base * f64::from(self.failure_multiplier) + jitter)
                    .round()
                    .max(MIN_FAILURE_INTERVAL)
            }
        };

        // float to int casts saturate
        seconds as u32
    }
}

impl BackoffPolicy for JitteredBackoff {
    fn next_interval_seconds(&self, fleet_size: usize, outcome: ReportOutcome) -> u32 {
        self.interval_with_rng(&mut rand::thread_rng(), fleet_size, outcome)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn samples(backoff: &JitteredBackoff, fleet_size: usize, outcome: ReportOutcome) -> Vec<u32> {
        let mut rng = StdRng::seed_from_u64(42);

        (0..2_000)
            .map(|_| backoff.interval_with_rng(&mut rng, fleet_size, outcome))
            .collect()
    }

    fn range(values: &[u32]) -> u32 {
        values.iter().max().unwrap() - values.iter().min().unwrap()
    }

    #[test]
    fn a_single_agent_gets_almost_the_base_interval() {
        let backoff = JitteredBackoff::default();

        // spread is 60 * 0.1 * ln(2) ~ 4.2s
        for value in samples(&backoff, 1, ReportOutcome::Success) {
            assert!((55..=65).contains(&value), "{value}");
        }
    }

    #[test]
    fn an_empty_fleet_gets_exactly_the_base_interval() {
        let backoff = JitteredBackoff::default();

        assert_eq!(backoff.next_interval_seconds(0, ReportOutcome::Success), 60);
        assert_eq!(backoff.next_interval_seconds(0, ReportOutcome::Failure), 300);
    }

    #[test]
    fn spread_grows_with_fleet_size_up_to_the_cap() {
        let backoff = JitteredBackoff::default();

        assert!(backoff.spread(10) > backoff.spread(1));
        assert!(backoff.spread(1_000) > backoff.spread(10));
        assert_eq!(backoff.spread(1_000_000), 30.0);

        let small = range(&samples(&backoff, 2, ReportOutcome::Success));
        let large = range(&samples(&backoff, 10_000, ReportOutcome::Success));
        assert!(large > small, "{large} <= {small}");

        for value in samples(&backoff, 10_000, ReportOutcome::Success) {
            assert!((30..=90).contains(&value), "{value}");
        }
    }

    #[test]
    fn failures_back_off_further() {
        let backoff = JitteredBackoff::default();

        for value in samples(&backoff, 10_000, ReportOutcome::Failure) {
            assert!((300..=330).contains(&value), "{value}");
        }
    }

    #[test]
    fn intervals_have_a_floor() {
        let backoff = JitteredBackoff {
            base_interval: Duration::from_millis(100),
            max_jitter_ratio: 10.0,
            jitter_ratio: 10.0,
            ..Default::default()
        };

        assert!(samples(&backoff, 1_000, ReportOutcome::Success).iter().all(|value| *value >= 1));
        assert!(samples(&backoff, 1_000, ReportOutcome::Failure).iter().all(|value| *value >= 5));
    }
}
