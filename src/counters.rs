use serde::Deserialize;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed counter value {value:?} in {path}")]
    Parse { path: String, value: String },
    #[error("interface {0} not found in netstat output")]
    InterfaceNotFound(String),
    #[error("netstat failed: {0}")]
    Netstat(String),
}

/// Raw cumulative byte counters of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterReading {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Capability to read the byte counters of a single interface.
pub trait CounterSource: Send {
    fn read(&mut self) -> Result<CounterReading, CounterError>;
    fn set_interface(&mut self, name: &str);
    fn interface(&self) -> &str;
}

/// Builds a fresh counter source for an interface each time a Sampler starts.
pub type SourceFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn CounterSource>, CounterError> + Send + Sync>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CounterSourceKind {
    Sysfs,
    Netstat,
}

impl Default for CounterSourceKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            CounterSourceKind::Netstat
        } else {
            CounterSourceKind::Sysfs
        }
    }
}

impl CounterSourceKind {
    pub fn factory(self) -> SourceFactory {
        match self {
            CounterSourceKind::Sysfs => Arc::new(|iface: &str| {
                let mut source = SysfsCounters::new(iface);
                // Fail early if the interface does not exist.
                source.read()?;
                Ok(Box::new(source) as Box<dyn CounterSource>)
            }),
            CounterSourceKind::Netstat => Arc::new(|iface: &str| {
                Ok(Box::new(NetstatCounters::new(iface)) as Box<dyn CounterSource>)
            }),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "u8")]
pub enum CounterWidth {
    #[default]
    Bits32,
    Bits64,
}

impl TryFrom<u8> for CounterWidth {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            32 => Ok(CounterWidth::Bits32),
            64 => Ok(CounterWidth::Bits64),
            other => Err(format!("unsupported counter width {other} (expected 32 or 64)")),
        }
    }
}

impl CounterWidth {
    pub fn max(self) -> u64 {
        match self {
            CounterWidth::Bits32 => u32::MAX as u64,
            CounterWidth::Bits64 => u64::MAX,
        }
    }

    /// Bytes counted between two readings, assuming at most one wrap.
    pub fn delta(self, previous: u64, current: u64) -> u64 {
        if current >= previous {
            current - previous
        } else {
            let max = self.max();
            (max - previous.min(max))
                .wrapping_add(current)
                .wrapping_add(1)
        }
    }
}

/// Linux counters under `/sys/class/net/<if>/statistics`.
pub struct SysfsCounters {
    interface: String,
    tx: Option<File>,
    rx: Option<File>,
}

impl SysfsCounters {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            tx: None,
            rx: None,
        }
    }

    fn path(&self, counter: &str) -> String {
        format!("/sys/class/net/{}/statistics/{}", self.interface, counter)
    }

    fn read_counter(slot: &mut Option<File>, path: &str) -> Result<u64, CounterError> {
        let io_err = |source| CounterError::Io {
            path: path.to_string(),
            source,
        };
        let file = match slot.take() {
            Some(mut f) => {
                f.seek(SeekFrom::Start(0)).map_err(io_err)?;
                f
            }
            None => File::open(path).map_err(io_err)?,
        };
        let file = slot.insert(file);
        let mut buf = String::with_capacity(24);
        file.read_to_string(&mut buf).map_err(io_err)?;
        let value = buf.trim();
        value.parse().map_err(|_| CounterError::Parse {
            path: path.to_string(),
            value: value.to_string(),
        })
    }
}

impl CounterSource for SysfsCounters {
    fn read(&mut self) -> Result<CounterReading, CounterError> {
        let tx_path = self.path("tx_bytes");
        let rx_path = self.path("rx_bytes");
        let tx = Self::read_counter(&mut self.tx, &tx_path);
        let rx = Self::read_counter(&mut self.rx, &rx_path);
        match (tx, rx) {
            (Ok(tx_bytes), Ok(rx_bytes)) => Ok(CounterReading { tx_bytes, rx_bytes }),
            (Err(e), _) | (_, Err(e)) => {
                // Reopen on the next attempt; the interface may have been recreated.
                self.tx = None;
                self.rx = None;
                Err(e)
            }
        }
    }

    fn set_interface(&mut self, name: &str) {
        self.interface = name.to_string();
        self.tx = None;
        self.rx = None;
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

/// BSD/macOS fallback. Spawning netstat per sample is slow; only useful at low sample rates.
pub struct NetstatCounters {
    interface: String,
}

impl NetstatCounters {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }
}

impl CounterSource for NetstatCounters {
    fn read(&mut self) -> Result<CounterReading, CounterError> {
        let output = std::process::Command::new("netstat")
            .args(["-i", "-b", "-I", &self.interface])
            .output()
            .map_err(|e| CounterError::Netstat(e.to_string()))?;
        if !output.status.success() {
            return Err(CounterError::Netstat(format!(
                "exited with status {}",
                output.status
            )));
        }
        parse_netstat(&String::from_utf8_lossy(&output.stdout), &self.interface)
    }

    fn set_interface(&mut self, name: &str) {
        self.interface = name.to_string();
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

fn parse_netstat(output: &str, interface: &str) -> Result<CounterReading, CounterError> {
    for line in output.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.first() != Some(&interface) || words.len() < 10 {
            continue;
        }
        let field = |idx: usize| -> Result<u64, CounterError> {
            words[idx].parse().map_err(|_| CounterError::Parse {
                path: "netstat".to_string(),
                value: words[idx].to_string(),
            })
        };
        return Ok(CounterReading {
            rx_bytes: field(6)?,
            tx_bytes: field(9)?,
        });
    }
    Err(CounterError::InterfaceNotFound(interface.to_string()))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::Instant;

    /// Counters that grow at a constant rate on the (possibly paused) tokio clock.
    pub struct ClockCounters {
        pub interface: String,
        pub started: Instant,
        pub tx_per_ms: u64,
        pub rx_per_ms: u64,
        pub reads: Arc<AtomicU64>,
    }

    impl CounterSource for ClockCounters {
        fn read(&mut self) -> Result<CounterReading, CounterError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let ms = self.started.elapsed().as_millis() as u64;
            Ok(CounterReading {
                tx_bytes: ms * self.tx_per_ms,
                rx_bytes: ms * self.rx_per_ms,
            })
        }

        fn set_interface(&mut self, name: &str) {
            self.interface = name.to_string();
        }

        fn interface(&self) -> &str {
            &self.interface
        }
    }

    pub fn clock_factory(tx_per_ms: u64, rx_per_ms: u64, reads: Arc<AtomicU64>) -> SourceFactory {
        Arc::new(move |iface: &str| {
            Ok(Box::new(ClockCounters {
                interface: iface.to_string(),
                started: Instant::now(),
                tx_per_ms,
                rx_per_ms,
                reads: reads.clone(),
            }) as Box<dyn CounterSource>)
        })
    }

    /// Replays a fixed script; `None` entries are read failures. Repeats the last entry when exhausted.
    pub struct ScriptedCounters {
        pub interface: String,
        pub script: VecDeque<Option<CounterReading>>,
        pub last: Option<CounterReading>,
    }

    impl ScriptedCounters {
        pub fn new(script: Vec<Option<CounterReading>>) -> Self {
            Self {
                interface: "test0".to_string(),
                script: script.into(),
                last: None,
            }
        }
    }

    impl CounterSource for ScriptedCounters {
        fn read(&mut self) -> Result<CounterReading, CounterError> {
            let next = match self.script.pop_front() {
                Some(entry) => entry,
                None => self.last,
            };
            self.last = next;
            next.ok_or_else(|| CounterError::InterfaceNotFound(self.interface.clone()))
        }

        fn set_interface(&mut self, name: &str) {
            self.interface = name.to_string();
        }

        fn interface(&self) -> &str {
            &self.interface
        }
    }

    pub fn reading(tx_bytes: u64, rx_bytes: u64) -> Option<CounterReading> {
        Some(CounterReading { tx_bytes, rx_bytes })
    }
}
