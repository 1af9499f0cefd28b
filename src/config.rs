use crate::counters::{CounterSourceKind, CounterWidth};
use crate::link::MAX_LINK_SPEED;
use crate::state::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub meter: MeterConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub interface: String,
    /// Samples per second.
    pub sample_rate: u32,
    /// Seconds between estimates.
    pub estimation_interval: f64,
    /// Seconds between meter records.
    pub meter_interval: f64,
    /// Mbit/s; detected from the interface when absent.
    pub link_speed: Option<u64>,
    /// Overload risk (percent) above which an alarm is raised.
    pub alarm_trigger: f64,
    /// Percentage of the linerate at which the risk is evaluated.
    pub cutoff: f64,
    pub counter_source: CounterSourceKind,
    pub counter_width: CounterWidth,
    /// Consecutive failed reads before the sampler gives up.
    pub max_read_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            sample_rate: 1000,
            estimation_interval: 10.0,
            meter_interval: 30.0,
            link_speed: None,
            alarm_trigger: 95.0,
            cutoff: 99.0,
            counter_source: CounterSourceKind::default(),
            counter_width: CounterWidth::default(),
            max_read_failures: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
}

pub const DEFAULT_CONTROL_PORT: u16 = 54736;

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum MeterConfig {
    Ceilometer(CeilometerConfig),
    File {
        path: PathBuf,
    },
    Socket {
        addr: String,
    },
    #[default]
    Console,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CeilometerConfig {
    pub name: String,
    pub resource_id: String,
    pub project_id: String,
    pub password: String,
    #[serde(default = "default_controller")]
    pub controller: String,
    #[serde(default = "default_admin")]
    pub username: String,
    #[serde(default = "default_admin")]
    pub tenant: String,
}

impl MeterConfig {
    pub fn backend(&self) -> &'static str {
        match self {
            MeterConfig::Ceilometer(_) => "ceilometer",
            MeterConfig::File { .. } => "file",
            MeterConfig::Socket { .. } => "socket",
            MeterConfig::Console => "console",
        }
    }
}

fn default_controller() -> String {
    "10.0.0.11".to_string()
}

fn default_admin() -> String {
    "admin".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitor;
        if m.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        for (name, secs) in [
            ("estimation_interval", m.estimation_interval),
            ("meter_interval", m.meter_interval),
        ] {
            if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between {MIN_INTERVAL_SECS} and {MAX_INTERVAL_SECS} seconds, got {secs}"
                )));
            }
        }
        if let Some(speed) = m.link_speed {
            if speed == 0 || speed > MAX_LINK_SPEED {
                return Err(ConfigError::Invalid(format!(
                    "link_speed must be between 1 and {MAX_LINK_SPEED} Mbit/s, got {speed}"
                )));
            }
        }
        for (name, pct) in [("alarm_trigger", m.alarm_trigger), ("cutoff", m.cutoff)] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a percentage in [0, 100], got {pct}"
                )));
            }
        }
        if m.interface.is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".into()));
        }
        if self.control.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "control.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [monitor]
            interface = "enp3s0"
            sample_rate = 500
            estimation_interval = 1.0
            link_speed = 1000
            counter_source = "netstat"
            counter_width = 64

            [control]
            listen = "127.0.0.1:6000"

            [meter]
            backend = "ceilometer"
            name = "sdn_at_edge"
            resource_id = "res-1"
            project_id = "proj-1"
            password = "secret"
        "#;

        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.monitor.interface, "enp3s0");
        assert_eq!(cfg.monitor.sample_rate, 500);
        assert_eq!(cfg.monitor.meter_interval, 30.0);
        assert_eq!(cfg.monitor.link_speed, Some(1000));
        assert_eq!(cfg.monitor.counter_source, CounterSourceKind::Netstat);
        assert_eq!(cfg.monitor.counter_width, CounterWidth::Bits64);
        assert_eq!(cfg.control.listen.port(), 6000);
        assert_eq!(cfg.control.max_connections, 8);
        match cfg.meter {
            MeterConfig::Ceilometer(c) => {
                assert_eq!(c.name, "sdn_at_edge");
                assert_eq!(c.controller, "10.0.0.11");
                assert_eq!(c.username, "admin");
                assert_eq!(c.tenant, "admin");
            }
            other => panic!("unexpected meter config {:?}", other),
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.monitor.interface, "eth0");
        assert_eq!(cfg.monitor.sample_rate, 1000);
        assert_eq!(cfg.monitor.alarm_trigger, 95.0);
        assert_eq!(cfg.control.listen.port(), DEFAULT_CONTROL_PORT);
        assert!(matches!(cfg.meter, MeterConfig::Console));
    }

    #[test]
    fn test_file_meter_backend() {
        let cfg: Config = toml::from_str(
            r#"
            [meter]
            backend = "file"
            path = "/tmp/meter.jsonl"
        "#,
        )
        .unwrap();
        assert!(matches!(cfg.meter, MeterConfig::File { .. }));
        assert_eq!(cfg.meter.backend(), "file");
    }

    #[test]
    fn test_ceilometer_requires_credentials() {
        let res: Result<Config, _> = toml::from_str(
            r#"
            [meter]
            backend = "ceilometer"
            name = "m"
        "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_rejects_bad_counter_width() {
        let res: Result<Config, _> = toml::from_str("[monitor]\ncounter_width = 16\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut cfg = Config::default();
        cfg.monitor.cutoff = 120.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.monitor.sample_rate = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitor.meter_interval = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let mut cfg = Config::default();
        cfg.monitor.estimation_interval = 1e20;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.monitor.meter_interval = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitor.link_speed = Some(20_000_000_000_000);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitor.link_speed = Some(MAX_LINK_SPEED);
        cfg.monitor.estimation_interval = MAX_INTERVAL_SECS;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_sample_config() {
        let cfg = Config::load("linkmon.toml").unwrap();
        assert_eq!(cfg.monitor.interface, "eth0");
        assert_eq!(cfg.monitor.link_speed, None);
        assert_eq!(cfg.meter.backend(), "console");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/linkmon.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
