//! Link capacity as reported by the kernel or the wireless tools.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Highest link speed accepted, in Mbit/s (10 Tbit/s).
pub const MAX_LINK_SPEED: u64 = 10_000_000;

/// macOS exposes no link speed; 1 Gbit/s is assumed there.
const DARWIN_LINK_SPEED: u64 = 1000;

/// Decimal megabits (IEEE 802.3).
const BYTES_PER_MBIT: u64 = 125_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// Capacity fixed at startup or set by an operator.
    Ethernet,
    /// Capacity follows the negotiated bit rate and is re-read before each estimate.
    Wireless,
}

/// Mbit/s to bytes/s. Speeds above `MAX_LINK_SPEED` are clamped.
pub fn link_speed_to_linerate(link_speed: u64) -> u64 {
    link_speed.min(MAX_LINK_SPEED) * BYTES_PER_MBIT
}

pub fn linerate_to_link_speed(linerate: u64) -> u64 {
    linerate / BYTES_PER_MBIT
}

fn mbit_to_linerate(mbit: f64) -> Option<u64> {
    if !(mbit.is_finite() && mbit > 0.0) {
        return None;
    }
    let mbit = mbit.min(MAX_LINK_SPEED as f64);
    Some((mbit * BYTES_PER_MBIT as f64).round() as u64)
}

#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// Current linerate (bytes/s) of a wireless interface; `None` when not associated.
    async fn wireless_linerate(&self, interface: &str) -> Option<u64>;
}

/// Asks `iw`, then `iwconfig`.
pub struct WirelessTools;

#[async_trait]
impl LinkProbe for WirelessTools {
    async fn wireless_linerate(&self, interface: &str) -> Option<u64> {
        for (program, args) in [
            ("iw", vec!["dev", interface, "link"]),
            ("iwconfig", vec![interface]),
        ] {
            // iwconfig exits with 1 for some interfaces but still prints the rate
            match Command::new(program).args(&args).output().await {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    if let Some(linerate) = parse_bit_rate(&stdout).and_then(mbit_to_linerate) {
                        return Some(linerate);
                    }
                }
                Err(e) => debug!("{} unavailable: {}", program, e),
            }
        }
        None
    }
}

/// Transmit bit rate in Mbit/s from `iw dev <if> link` ("tx bitrate: 144.4 MBit/s")
/// or `iwconfig <if>` ("Bit Rate=54 Mb/s") output.
fn parse_bit_rate(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let line = line.to_ascii_lowercase();
        let at = ["tx bitrate", "bit rate"]
            .iter()
            .find_map(|key| line.find(*key).map(|i| i + key.len()))?;
        let rest = line[at..].trim_start_matches(|c: char| c == '=' || c == ':' || c.is_whitespace());
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, unit) = rest.split_at(end);
        let value: f64 = number.parse().ok()?;
        match unit.trim_start() {
            u if u.starts_with("mb") => Some(value),
            u if u.starts_with("gb") => Some(value * 1000.0),
            _ => None,
        }
    })
}

/// Speed in Mbit/s from `/sys/class/net/<if>/speed`.
fn sysfs_link_speed(interface: &str) -> Option<u64> {
    let path = format!("/sys/class/net/{}/speed", interface);
    let speed: i64 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    // Drivers report -1 when the link is down or the speed is unknown.
    u64::try_from(speed).ok().filter(|s| *s > 0)
}

fn assumed_link_speed(macos: bool) -> Option<u64> {
    macos.then_some(DARWIN_LINK_SPEED)
}

/// How the capacity of `interface` is known, and its linerate in bytes/s.
pub async fn detect_link(interface: &str, probe: &dyn LinkProbe) -> Option<(InterfaceType, u64)> {
    let fixed = assumed_link_speed(cfg!(target_os = "macos")).or_else(|| sysfs_link_speed(interface));
    if let Some(speed) = fixed {
        return Some((InterfaceType::Ethernet, link_speed_to_linerate(speed)));
    }
    probe
        .wireless_linerate(interface)
        .await
        .map(|linerate| (InterfaceType::Wireless, linerate))
}
