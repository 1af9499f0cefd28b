use crate::link::{link_speed_to_linerate, InterfaceType};
use crate::telemetry::AuthToken;
use serde::Serialize;
use std::time::Duration;

/// Shortest estimation/meter interval accepted from a control command.
pub const MIN_INTERVAL_SECS: f64 = 0.01;
/// Longest estimation/meter interval: one day.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    Paused,
    Exited,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Running => "running",
            Lifecycle::Paused => "paused",
            Lifecycle::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkParams {
    /// Nominal capacity in bytes/s.
    pub linerate: u64,
    /// Percentage in [0, 100].
    pub alarm_trigger: f64,
    /// Fraction in [0, 1].
    pub cutoff: f64,
}

impl LinkParams {
    pub fn new(linerate: u64, alarm_trigger_pct: f64, cutoff_pct: f64) -> Self {
        let mut link = Self {
            linerate,
            alarm_trigger: 0.0,
            cutoff: 0.0,
        };
        link.set_alarm_trigger(alarm_trigger_pct);
        link.set_cutoff(cutoff_pct);
        link
    }

    /// Rate at which overload risk is evaluated.
    pub fn threshold(&self) -> f64 {
        self.linerate as f64 * self.cutoff
    }

    /// `link_speed` in Mbit/s, clamped; returns the resulting linerate.
    pub fn set_link_speed(&mut self, link_speed: u64) -> u64 {
        self.linerate = link_speed_to_linerate(link_speed);
        self.linerate
    }

    pub fn set_alarm_trigger(&mut self, pct: f64) -> f64 {
        self.alarm_trigger = clamp_pct(pct);
        self.alarm_trigger
    }

    /// Takes a percentage, stores a fraction.
    pub fn set_cutoff(&mut self, pct: f64) -> f64 {
        self.cutoff = clamp_pct(pct) / 100.0;
        self.cutoff
    }

    pub fn alarm(&self, overload_risk: f64) -> bool {
        overload_risk > self.alarm_trigger
    }
}

fn clamp_pct(pct: f64) -> f64 {
    if pct.is_nan() {
        return 0.0;
    }
    pct.clamp(0.0, 100.0)
}

pub fn coerce_interval(secs: f64) -> f64 {
    if secs.is_nan() {
        return MIN_INTERVAL_SECS;
    }
    secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)
}

fn period(secs: f64) -> Duration {
    Duration::try_from_secs_f64(coerce_interval(secs))
        .unwrap_or(Duration::from_secs(MAX_INTERVAL_SECS as u64))
}

/// Everything the Controller mutates while serving commands.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub lifecycle: Lifecycle,
    pub interface: String,
    pub sample_rate: u32,
    pub link: LinkParams,
    pub interface_type: InterfaceType,
    /// Seconds.
    pub estimation_interval: f64,
    /// Seconds.
    pub meter_interval: f64,
    pub token: Option<AuthToken>,
}

impl MonitorState {
    pub fn estimation_period(&self) -> Duration {
        period(self.estimation_interval)
    }

    pub fn meter_period(&self) -> Duration {
        period(self.meter_interval)
    }

    pub fn wake_interval(&self) -> Duration {
        self.estimation_period().min(self.meter_period())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_params_coercion() {
        let mut link = LinkParams::new(1_250_000, 150.0, 99.0);
        assert_eq!(link.alarm_trigger, 100.0);
        assert!((link.cutoff - 0.99).abs() < 1e-12);
        assert_eq!(link.set_cutoff(-5.0), 0.0);
        assert_eq!(link.set_link_speed(100), 12_500_000);
        assert!((link.threshold() - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_alarm_is_strictly_above_trigger() {
        let link = LinkParams::new(1, 95.0, 99.0);
        assert!(!link.alarm(95.0));
        assert!(link.alarm(95.1));
    }

    #[test]
    fn test_interval_coercion() {
        assert_eq!(coerce_interval(0.0), MIN_INTERVAL_SECS);
        assert_eq!(coerce_interval(f64::NAN), MIN_INTERVAL_SECS);
        assert_eq!(coerce_interval(f64::INFINITY), MAX_INTERVAL_SECS);
        assert_eq!(coerce_interval(1e20), MAX_INTERVAL_SECS);
        assert_eq!(coerce_interval(2.5), 2.5);
    }

    #[test]
    fn test_periods_never_overflow() {
        let mut state = MonitorState {
            lifecycle: Lifecycle::Running,
            interface: "eth0".into(),
            sample_rate: 1000,
            link: LinkParams::new(1, 95.0, 99.0),
            interface_type: InterfaceType::Ethernet,
            estimation_interval: 1e20,
            meter_interval: f64::INFINITY,
            token: None,
        };
        assert_eq!(state.estimation_period(), Duration::from_secs(86_400));
        assert_eq!(state.meter_period(), Duration::from_secs(86_400));
        state.meter_interval = -1.0;
        assert_eq!(state.meter_period(), Duration::from_millis(10));
    }

    #[test]
    fn test_wake_interval_is_min() {
        let state = MonitorState {
            lifecycle: Lifecycle::Running,
            interface: "eth0".into(),
            sample_rate: 1000,
            link: LinkParams::new(1, 95.0, 99.0),
            interface_type: InterfaceType::Ethernet,
            estimation_interval: 1.0,
            meter_interval: 30.0,
            token: None,
        };
        assert_eq!(state.wake_interval(), Duration::from_secs(1));
    }
}
