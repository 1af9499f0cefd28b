use crate::config::{Config, MeterConfig, DEFAULT_CONTROL_PORT};
use crate::control::{send_command, ControlListener};
use crate::controller::{Controller, SamplerOptions};
use crate::display::StatusDisplay;
use crate::inbox::config_inbox;
use crate::link::{detect_link, link_speed_to_linerate, InterfaceType, WirelessTools};
use crate::state::{Lifecycle, LinkParams, MonitorState};
use anyhow::{anyhow, bail, Context};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

mod channel;
mod command;
mod config;
mod control;
mod controller;
mod counters;
mod display;
mod estimator;
mod inbox;
mod link;
mod logging;
mod sampler;
mod state;
mod telemetry;

use clap::{Args, Parser, Subcommand};

/// linkmon: estimates the overload risk of a network link from sampled byte counters
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitor daemon
    Run(RunArgs),
    /// Send a command to a running monitor
    Ctl(CtlArgs),
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "linkmon.toml")]
        config: String,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Path to the configuration file; built-in defaults apply without one
    #[arg(short, long)]
    config: Option<String>,
    /// Interface to monitor
    #[arg(short, long)]
    interface: Option<String>,
    /// Samples per second
    #[arg(short, long)]
    sample_rate: Option<u32>,
    /// Seconds between estimates
    #[arg(short, long)]
    estimation_interval: Option<f64>,
    /// Seconds between meter records
    #[arg(short, long)]
    meter_interval: Option<f64>,
    /// Link speed in Mbit/s. Detected when absent: sysfs for wired links,
    /// iw/iwconfig for wireless ones (re-read before every estimate); 1000 on macOS
    #[arg(short = 'k', long)]
    link_speed: Option<u64>,
    /// Overload risk (percent) that raises an alarm
    #[arg(short, long)]
    alarm_trigger: Option<f64>,
    /// Percentage of the link speed used in the overload risk
    #[arg(short = 'o', long)]
    cutoff: Option<f64>,
    /// Port for control commands
    #[arg(short = 'q', long)]
    confport: Option<u16>,
    /// Append meter records to this file instead of the configured backend
    #[arg(short = 'f', long, conflicts_with = "meter_port")]
    meter_file: Option<PathBuf>,
    /// Send meter records to this TCP port instead of the configured backend
    #[arg(short = 'b', long)]
    meter_port: Option<u16>,
    /// Host for --meter-port
    #[arg(short = 'g', long, default_value = "127.0.0.1")]
    meter_host: String,
    /// Do not draw the status display
    #[arg(long)]
    no_display: bool,
    /// Write logs to this file instead of stderr; the status display is only
    /// drawn when logs go to a file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl RunArgs {
    /// Log lines on stderr would scroll through the display.
    fn display_enabled(&self) -> bool {
        !self.no_display && self.log_file.is_some()
    }

    fn apply(&self, config: &mut Config) {
        let m = &mut config.monitor;
        if let Some(interface) = &self.interface {
            m.interface = interface.clone();
        }
        if let Some(rate) = self.sample_rate {
            m.sample_rate = rate;
        }
        if let Some(secs) = self.estimation_interval {
            m.estimation_interval = secs;
        }
        if let Some(secs) = self.meter_interval {
            m.meter_interval = secs;
        }
        if let Some(speed) = self.link_speed {
            m.link_speed = Some(speed);
        }
        if let Some(pct) = self.alarm_trigger {
            m.alarm_trigger = pct;
        }
        if let Some(pct) = self.cutoff {
            m.cutoff = pct;
        }
        if let Some(port) = self.confport {
            config.control.listen.set_port(port);
        }
        if let Some(path) = &self.meter_file {
            config.meter = MeterConfig::File { path: path.clone() };
        } else if let Some(port) = self.meter_port {
            config.meter = MeterConfig::Socket {
                addr: format!("{}:{}", self.meter_host, port),
            };
        }
    }
}

#[derive(Args, Debug)]
struct CtlArgs {
    /// Pause the monitor
    #[arg(long)]
    pause: bool,
    /// Resume the monitor
    #[arg(long)]
    resume: bool,
    /// Show whether the monitor is running or paused
    #[arg(long)]
    status: bool,
    /// Tell the monitor to exit; every other option is ignored
    #[arg(long)]
    exit: bool,
    /// Interface to monitor
    #[arg(short, long)]
    interface: Option<String>,
    /// Samples per second
    #[arg(short, long)]
    sample_rate: Option<u32>,
    /// Seconds between estimates
    #[arg(short, long)]
    estimation_interval: Option<f64>,
    /// Seconds between meter records
    #[arg(short, long)]
    meter_interval: Option<f64>,
    /// Link speed in Mbit/s
    #[arg(short = 'k', long)]
    link_speed: Option<u64>,
    /// Overload risk (percent) that raises an alarm
    #[arg(short, long)]
    alarm_trigger: Option<f64>,
    /// Percentage of the link speed used in the overload risk
    #[arg(short = 'o', long)]
    cutoff: Option<f64>,
    /// Host running the monitor
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Control port of the monitor
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,
}

impl CtlArgs {
    fn to_command(&self) -> anyhow::Result<Value> {
        if self.exit {
            return Ok(json!({ "exit": true }));
        }
        if self.pause && self.resume {
            bail!("cannot pause and resume at the same time");
        }
        if self.status && (self.pause || self.resume) {
            bail!("status cannot be queried while pausing or resuming");
        }

        let mut command = Map::new();
        for (key, set) in [
            ("resume", self.resume),
            ("pause", self.pause),
            ("status", self.status),
        ] {
            if set {
                command.insert(key.to_string(), Value::Bool(true));
            }
        }
        if let Some(interface) = &self.interface {
            command.insert("interface".into(), json!(interface));
        }
        if let Some(rate) = self.sample_rate {
            command.insert("sample_rate".into(), json!(rate));
        }
        if let Some(secs) = self.estimation_interval {
            command.insert("estimation_interval".into(), json!(secs));
        }
        if let Some(secs) = self.meter_interval {
            command.insert("meter_interval".into(), json!(secs));
        }
        if let Some(speed) = self.link_speed {
            command.insert("link_speed".into(), json!(speed));
        }
        if let Some(pct) = self.alarm_trigger {
            command.insert("alarm_trigger".into(), json!(pct));
        }
        if let Some(pct) = self.cutoff {
            command.insert("cutoff".into(), json!(pct));
        }

        if command.is_empty() {
            bail!("no command given; see --help");
        }
        Ok(Value::Object(command))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_daemon(args).await,
        Commands::Ctl(args) => {
            let _guard = logging::init_logging(None);
            run_ctl(args).await
        }
        Commands::Validate { config } => {
            let _guard = logging::init_logging(None);
            validate_config(&config)
        }
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!(
                "Interface: {} at {} samples/s",
                cfg.monitor.interface, cfg.monitor.sample_rate
            );
            info!("Control listen: {}", cfg.control.listen);
            info!("Meter backend: {}", cfg.meter.backend());
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow!("Invalid config"))
        }
    }
}

async fn run_ctl(args: CtlArgs) -> anyhow::Result<()> {
    let command = args.to_command()?;
    let addr = format!("{}:{}", args.host, args.port);
    let reply = send_command(&addr, &command)
        .await
        .with_context(|| format!("cannot reach monitor at {}", addr))?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn run_daemon(args: RunArgs) -> anyhow::Result<()> {
    let _guard = logging::init_logging(args.log_file.as_deref());

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading '{}'", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let m = &config.monitor;
    let (interface_type, linerate) = match m.link_speed {
        Some(speed) => (InterfaceType::Ethernet, link_speed_to_linerate(speed)),
        None => detect_link(&m.interface, &WirelessTools).await.ok_or_else(|| {
            anyhow!(
                "cannot detect the link speed of {}; set link_speed",
                m.interface
            )
        })?,
    };
    let state = MonitorState {
        lifecycle: Lifecycle::Running,
        interface: m.interface.clone(),
        sample_rate: m.sample_rate,
        link: LinkParams::new(linerate, m.alarm_trigger, m.cutoff),
        interface_type,
        estimation_interval: m.estimation_interval,
        meter_interval: m.meter_interval,
        token: None,
    };
    let options = SamplerOptions {
        width: m.counter_width,
        max_read_failures: m.max_read_failures,
    };
    info!(
        "Starting linkmon on {} ({:?}, {} bytes/s, meter backend {})",
        m.interface,
        interface_type,
        linerate,
        config.meter.backend()
    );

    let (telemetry, meter) = telemetry::from_config(&config.meter)?;
    let mut controller = Controller::start(
        state,
        options,
        m.counter_source.factory(),
        telemetry,
        meter,
    )?;
    if args.display_enabled() {
        let mut display = StatusDisplay::new();
        display.clear()?;
        controller = controller.with_display(display);
    }
    controller
        .authenticate()
        .await
        .context("initial authentication failed")?;

    let listener = ControlListener::bind(config.control.listen, config.control.max_connections)
        .with_context(|| format!("binding control port {}", config.control.listen))?;
    let (inbox_handle, inbox) = config_inbox();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let listener_task = tokio::spawn(listener.serve(inbox_handle, ready_tx, stop_rx));

    let result = controller.run(inbox, ready_rx, shutdown_signal()?).await;
    if stop_tx.send(()).is_err() {
        debug!("Control listener already stopped");
    }
    if let Err(e) = listener_task.await {
        warn!("Control listener task failed: {}", e);
    }
    result?;
    Ok(())
}

fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    })
}
