use crate::link::linerate_to_link_speed;
use crate::estimator::EstimationResult;
use crate::state::MonitorState;
use crossterm::{
    cursor::MoveTo,
    queue,
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};
use std::time::Duration;

/// Redraws the latest estimate in place at the top of the terminal.
pub struct StatusDisplay {
    out: io::Stdout,
}

impl Default for StatusDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusDisplay {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }

    pub fn clear(&mut self) -> io::Result<()> {
        queue!(self.out, MoveTo(0, 0), Clear(ClearType::All))?;
        self.out.flush()
    }

    pub fn render(
        &mut self,
        state: &MonitorState,
        est: &EstimationResult,
        since_last: Duration,
    ) -> io::Result<()> {
        queue!(self.out, MoveTo(0, 0))?;
        for line in status_lines(state, est, since_last) {
            queue!(self.out, Clear(ClearType::CurrentLine))?;
            writeln!(self.out, "{}", line)?;
        }
        queue!(self.out, Clear(ClearType::FromCursorDown))?;
        self.out.flush()
    }
}

pub fn status_lines(
    state: &MonitorState,
    est: &EstimationResult,
    since_last: Duration,
) -> Vec<String> {
    vec![
        format!(
            "sample_rate (/s): {}, interface: {}, linerate (bytes/s): {}, link speed (Mbit/s): {}",
            state.sample_rate,
            state.interface,
            state.link.linerate,
            linerate_to_link_speed(state.link.linerate)
        ),
        format!(
            "TX(mean: {:.2e} B/s std: {:.2e} mu: {:.2e} s2: {:.2e}, ol-risk: {:.2e})",
            est.mean_tx,
            est.var_tx.max(0.0).sqrt(),
            est.mu_tx,
            est.sigma2_tx,
            est.overload_risk_tx
        ),
        format!(
            "RX(mean: {:.2e} B/s std: {:.2e} mu: {:.2e} s2: {:.2e}, ol-risk: {:.2e})",
            est.mean_rx,
            est.var_rx.max(0.0).sqrt(),
            est.mu_rx,
            est.sigma2_rx,
            est.overload_risk_rx
        ),
        format!(
            "samples: {}, estimation timer: {:.4}",
            est.samples,
            since_last.as_secs_f64()
        ),
        format!("estimation interval: {:.2}", state.estimation_interval),
        format!("meter interval: {:.0}", state.meter_interval),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::InterfaceType;
    use crate::state::{Lifecycle, LinkParams};

    #[test]
    fn test_status_lines() {
        let state = MonitorState {
            lifecycle: Lifecycle::Running,
            interface: "eth0".into(),
            sample_rate: 1000,
            link: LinkParams::new(125_000_000, 95.0, 99.0),
            interface_type: InterfaceType::Ethernet,
            estimation_interval: 1.0,
            meter_interval: 30.0,
            token: None,
        };
        let est = EstimationResult {
            samples: 998,
            mean_tx: 1000.0,
            ..Default::default()
        };
        let lines = status_lines(&state, &est, Duration::from_millis(1500));
        assert_eq!(lines.len(), 6);
        assert!(lines[0].contains("interface: eth0"));
        assert!(lines[0].contains("link speed (Mbit/s): 1000"));
        assert!(lines[1].contains("mean: 1.00e3"));
        assert!(lines[3].contains("samples: 998"));
        assert!(lines[3].contains("1.5000"));
    }
}
