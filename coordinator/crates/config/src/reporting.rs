use std::time::Duration;

use duration_str::deserialize_duration;
use schema_reporting::{FleetSettings, JitteredBackoff};
use serde::{de::Error, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportingConfig {
    /// Interval advised to agents after an accepted report.
    #[serde(deserialize_with = "deserialize_non_zero_duration")]
    pub base_interval: Duration,
    /// The interval after a rejected report is this many base intervals.
    pub failure_multiplier: u32,
    /// Random spread added per natural logarithm of the fleet size, as a ratio of the base
    /// interval.
    #[serde(deserialize_with = "deserialize_ratio")]
    pub jitter_ratio: f64,
    /// Upper bound of the random spread, as a ratio of the base interval.
    #[serde(deserialize_with = "deserialize_ratio")]
    pub max_jitter_ratio: f64,
    /// Agents silent for this long no longer count towards the fleet.
    #[serde(deserialize_with = "deserialize_non_zero_duration")]
    pub stale_after: Duration,
    /// Agents silent for this long are forgotten.
    #[serde(deserialize_with = "deserialize_non_zero_duration")]
    pub retention: Duration,
    /// How often stale agents are swept.
    #[serde(deserialize_with = "deserialize_non_zero_duration")]
    pub sweep_interval: Duration,
    /// Compare the content of documents sent again under a known hash.
    pub verify_content: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        let backoff = JitteredBackoff::default();
        let fleet = FleetSettings::default();

        Self {
            base_interval: backoff.base_interval,
            failure_multiplier: backoff.failure_multiplier,
            jitter_ratio: backoff.jitter_ratio,
            max_jitter_ratio: backoff.max_jitter_ratio,
            stale_after: fleet.stale_after,
            retention: fleet.retention,
            sweep_interval: Duration::from_secs(60),
            verify_content: true,
        }
    }
}

impl ReportingConfig {
    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            stale_after: self.stale_after,
            // stale registrations stay visible at least until they are stale
            retention: self.retention.max(self.stale_after),
        }
    }

    pub fn backoff(&self) -> JitteredBackoff {
        JitteredBackoff {
            base_interval: self.base_interval,
            failure_multiplier: self.failure_multiplier.max(1),
            jitter_ratio: self.jitter_ratio,
            max_jitter_ratio: self.max_jitter_ratio,
        }
    }
}

fn deserialize_non_zero_duration<'de, D>(data: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = deserialize_duration(data)?;

    if duration.is_zero() {
        return Err(Error::custom("duration cannot be 0"));
    }

    Ok(duration)
}

fn deserialize_ratio<'de, D>(data: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let ratio: f64 = serde::Deserialize::deserialize(data)?;

    if !ratio.is_finite() || ratio < 0.0 {
        return Err(Error::custom("ratio must be a positive number"));
    }

    Ok(ratio)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::Config;

    use super::*;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("[reporting]").unwrap();
        let reporting = config.reporting;

        assert_eq!(reporting.base_interval, Duration::from_secs(60));
        assert_eq!(reporting.failure_multiplier, 5);
        assert_eq!(reporting.jitter_ratio, 0.1);
        assert_eq!(reporting.max_jitter_ratio, 0.5);
        assert_eq!(reporting.stale_after, Duration::from_secs(15 * 60));
        assert_eq!(reporting.retention, Duration::from_secs(60 * 60));
        assert_eq!(reporting.sweep_interval, Duration::from_secs(60));
        assert!(reporting.verify_content);

        assert_eq!(reporting.backoff(), JitteredBackoff::default());
        assert_eq!(reporting.fleet_settings(), FleetSettings::default());
    }

    #[test]
    fn custom() {
        let input = indoc! {r#"
            [reporting]
            base_interval = "30s"
            failure_multiplier = 10
            jitter_ratio = 0.2
            max_jitter_ratio = 1
            stale_after = "5m"
            retention = "2m"
            sweep_interval = "10s"
            verify_content = false
        "#};

        let config: Config = toml::from_str(input).unwrap();
        let reporting = config.reporting;

        let backoff = reporting.backoff();
        assert_eq!(backoff.base_interval, Duration::from_secs(30));
        assert_eq!(backoff.failure_multiplier, 10);
        assert_eq!(backoff.max_jitter_ratio, 1.0);

        let fleet = reporting.fleet_settings();
        assert_eq!(fleet.stale_after, Duration::from_secs(300));
        // never shorter than the stale window
        assert_eq!(fleet.retention, Duration::from_secs(300));

        assert_eq!(reporting.sweep_interval, Duration::from_secs(10));
        assert!(!reporting.verify_content);
    }

    #[test]
    fn zero_interval() {
        let input = indoc! {r#"
            [reporting]
            base_interval = "0s"
        "#};

        let error = toml::from_str::<Config>(input).unwrap_err();

        assert!(error.to_string().contains("duration cannot be 0"), "{error}");
    }

    #[test]
    fn negative_ratio() {
        let input = indoc! {r#"
            [reporting]
            jitter_ratio = -0.5
        "#};

        let error = toml::from_str::<Config>(input).unwrap_err();

        assert!(error.to_string().contains("ratio must be a positive number"), "{error}");
    }
}
