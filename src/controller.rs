//! The Controller owns the monitor state and is its only mutator.
//!
//! It applies operator commands, runs the Estimator on the estimation
//! interval, emits meter records on the meter interval and drives the
//! Running / Paused / Exited lifecycle. All waiting happens in one
//! `select!` over the inbox, the sampler task, the shutdown signal and the
//! next timer deadline.

use crate::command::{Applied, ControlCommand, ControlReply};
use crate::counters::{CounterError, CounterWidth, SourceFactory};
use crate::display::StatusDisplay;
use crate::estimator::{EstimateError, EstimationResult, Estimator};
use crate::inbox::{ConfigInbox, Envelope};
use crate::link::{InterfaceType, LinkProbe, WirelessTools};
use crate::sampler::{Sampler, SamplerError, SamplerHandle};
use crate::state::{coerce_interval, Lifecycle, MonitorState};
use crate::telemetry::{AuthToken, MeterIdentity, MeterRecord, Telemetry, TelemetryError};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("cannot start sampler on {interface}: {source}")]
    SamplerStart {
        interface: String,
        #[source]
        source: CounterError,
    },
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("control listener went away before it was ready")]
    ListenerUnavailable,
}

/// How each Sampler the Controller starts is configured.
#[derive(Debug, Clone, Copy)]
pub struct SamplerOptions {
    pub width: CounterWidth,
    pub max_read_failures: u32,
}

enum Wake {
    Command(Option<Envelope>),
    SamplerExited(Result<Result<(), SamplerError>, JoinError>),
    Shutdown,
    Timer,
}

pub struct Controller {
    state: MonitorState,
    options: SamplerOptions,
    sources: SourceFactory,
    sampler: Option<SamplerHandle>,
    estimator: Estimator,
    estimation: Option<EstimationResult>,
    last_estimate: Instant,
    last_meter: Instant,
    telemetry: Arc<dyn Telemetry>,
    meter: MeterIdentity,
    display: Option<StatusDisplay>,
    probe: Arc<dyn LinkProbe>,
}

impl Controller {
    /// Starts in Running with a fresh Sampler on `state.interface`.
    pub fn start(
        mut state: MonitorState,
        options: SamplerOptions,
        sources: SourceFactory,
        telemetry: Arc<dyn Telemetry>,
        meter: MeterIdentity,
    ) -> Result<Self, MonitorError> {
        state.lifecycle = Lifecycle::Running;
        let now = Instant::now();
        let mut controller = Self {
            state,
            options,
            sources,
            sampler: None,
            estimator: Estimator::new(),
            estimation: None,
            last_estimate: now,
            last_meter: now,
            telemetry,
            meter,
            display: None,
            probe: Arc::new(WirelessTools),
        };
        controller.start_sampler()?;
        Ok(controller)
    }

    pub fn with_display(mut self, display: StatusDisplay) -> Self {
        self.display = Some(display);
        self
    }

    /// Fetches the first token; failing here is fatal at startup.
    pub async fn authenticate(&mut self) -> Result<(), MonitorError> {
        self.ensure_token().await?;
        Ok(())
    }

    pub async fn run(
        mut self,
        mut inbox: ConfigInbox,
        ready: oneshot::Receiver<()>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), MonitorError> {
        ready.await.map_err(|_| MonitorError::ListenerUnavailable)?;
        info!(
            "Monitoring {} at {} samples/s, waking at least every {:?}",
            self.state.interface,
            self.state.sample_rate,
            self.state.wake_interval()
        );
        let initialized = MeterRecord::event("initialized", Utc::now());
        if let Err(e) = self.emit(&initialized).await {
            error!("Failed to emit initialized record: {}", e);
        }

        tokio::pin!(shutdown);
        let mut inbox_open = true;

        while self.state.lifecycle != Lifecycle::Exited {
            if let Some(envelope) = inbox.try_recv() {
                self.handle(envelope).await;
                continue;
            }
            if self.state.is_running() {
                self.on_timer().await;
            }

            let running = self.state.is_running();
            let deadline = self.next_deadline();
            let wake = {
                let sampler = &mut self.sampler;
                let sampler_done = async move {
                    match sampler.as_mut() {
                        Some(handle) => (&mut handle.task).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    envelope = inbox.recv(), if inbox_open => Wake::Command(envelope),
                    _ = &mut shutdown => Wake::Shutdown,
                    res = sampler_done => Wake::SamplerExited(res),
                    _ = tokio::time::sleep_until(deadline), if running => Wake::Timer,
                }
            };

            match wake {
                Wake::Command(Some(envelope)) => self.handle(envelope).await,
                Wake::Command(None) => {
                    debug!("All control handles dropped; no more commands");
                    inbox_open = false;
                }
                Wake::Shutdown => {
                    info!("Shutdown signal received");
                    self.exit().await;
                }
                Wake::SamplerExited(res) => self.on_sampler_exit(res),
                Wake::Timer => {}
            }
        }
        Ok(())
    }

    async fn handle(&mut self, envelope: Envelope) {
        let reply = self.apply(&envelope.command).await;
        debug!("Control command {} -> {:?}", envelope.command.raw, reply);
        if envelope.reply.send(reply).is_err() {
            debug!("Control client went away before the reply");
        }
    }

    /// Applies every recognized field, always in the same order, and
    /// reports the effective values.
    pub async fn apply(&mut self, cmd: &ControlCommand) -> ControlReply {
        let mut applied = Applied::default();

        if cmd.resume == Some(true) && self.state.lifecycle == Lifecycle::Paused {
            // A failed resume is reported in place; the remaining fields still apply.
            match self.start_sampler() {
                Ok(()) => {
                    self.state.lifecycle = Lifecycle::Running;
                    info!("Resumed monitoring on {}", self.state.interface);
                    applied.resumed = Some("ok".to_string());
                }
                Err(e) => {
                    warn!("Resume failed: {}", e);
                    applied.resumed = Some(e.to_string());
                }
            }
        }
        if cmd.pause == Some(true) && self.state.is_running() {
            self.stop_sampler().await;
            self.state.lifecycle = Lifecycle::Paused;
            info!("Paused monitoring");
            applied.paused = Some("ok".to_string());
        }
        if cmd.status == Some(true) {
            applied.status = Some(self.state.lifecycle.as_str().to_string());
        }
        if cmd.exit == Some(true) && self.state.is_running() {
            self.exit().await;
            applied.exit = Some("ok".to_string());
        }
        if let Some(interface) = &cmd.interface {
            self.state.interface = interface.clone();
            if let Some(handle) = &self.sampler {
                if handle.channel.set_interface(interface).await.is_err() {
                    debug!("Sampler gone; interface applies on next resume");
                }
            }
            info!("Interface set to {}", interface);
            applied.interface = Some(interface.clone());
        }
        if let Some(rate) = cmd.sample_rate {
            let rate = rate.max(1);
            self.state.sample_rate = rate;
            if let Some(handle) = &self.sampler {
                if handle.channel.set_sample_rate(rate).await.is_err() {
                    debug!("Sampler gone; sample rate applies on next resume");
                }
            }
            applied.sample_rate = Some(rate);
        }
        if let Some(secs) = cmd.estimation_interval {
            self.state.estimation_interval = coerce_interval(secs);
            applied.estimation_interval = Some(self.state.estimation_interval);
        }
        if let Some(secs) = cmd.meter_interval {
            self.state.meter_interval = coerce_interval(secs);
            applied.meter_interval = Some(self.state.meter_interval);
        }
        if let Some(link_speed) = cmd.link_speed {
            // An operator-set speed is no longer re-read from the wireless tools.
            self.state.interface_type = InterfaceType::Ethernet;
            applied.linerate = Some(self.state.link.set_link_speed(link_speed));
        }
        if let Some(pct) = cmd.alarm_trigger {
            applied.alarm_trigger = Some(self.state.link.set_alarm_trigger(pct));
        }
        if let Some(pct) = cmd.cutoff {
            applied.cutoff = Some(self.state.link.set_cutoff(pct));
        }

        ControlReply::from_applied(applied, cmd)
    }

    /// Fresh Sampler, fresh Estimator baseline, timers restarted.
    fn start_sampler(&mut self) -> Result<(), MonitorError> {
        let interface = self.state.interface.clone();
        let source = (self.sources)(&interface).map_err(|source| MonitorError::SamplerStart {
            interface: interface.clone(),
            source,
        })?;
        let sampler = Sampler::start(
            source,
            self.state.sample_rate,
            self.options.width,
            self.options.max_read_failures,
        )
        .map_err(|source| MonitorError::SamplerStart { interface, source })?;

        self.sampler = Some(SamplerHandle::spawn(sampler));
        self.estimator = Estimator::new();
        self.estimation = None;
        let now = Instant::now();
        self.last_estimate = now;
        self.last_meter = now;
        Ok(())
    }

    /// Stops the Sampler and waits for its task to finish.
    async fn stop_sampler(&mut self) {
        let Some(handle) = self.sampler.take() else {
            return;
        };
        if handle.channel.stop().await.is_err() {
            debug!("Sampler already stopped");
        }
        match handle.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Sampler ended with error: {}", e),
            Err(e) => warn!("Sampler task failed: {}", e),
        }
    }

    fn on_sampler_exit(&mut self, res: Result<Result<(), SamplerError>, JoinError>) {
        self.sampler = None;
        match res {
            Ok(Ok(())) => warn!("Sampler stopped unexpectedly"),
            Ok(Err(e)) => error!("Sampler failed: {}", e),
            Err(e) => error!("Sampler task failed: {}", e),
        }
        if self.state.is_running() {
            self.state.lifecycle = Lifecycle::Paused;
            warn!("Monitoring paused; fix the interface and resume");
        }
    }

    pub async fn on_timer(&mut self) {
        let now = Instant::now();
        if is_due(now, self.last_estimate, self.state.estimation_period()) {
            let since_last = now - self.last_estimate;
            self.last_estimate = now;
            self.estimate(since_last).await;
        }
        if self.state.is_running() && is_due(now, self.last_meter, self.state.meter_period()) {
            self.last_meter = now;
            if let Err(e) = self.meter().await {
                error!("Failed to emit meter record: {}", e);
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let estimate_at = self.last_estimate.checked_add(self.state.estimation_period());
        let meter_at = self.last_meter.checked_add(self.state.meter_period());
        [estimate_at, meter_at]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(|| Instant::now() + self.state.wake_interval())
    }

    /// Re-reads the bit rate of a wireless link, which changes as the link renegotiates.
    async fn refresh_linerate(&mut self) {
        let reported = self.probe.wireless_linerate(&self.state.interface).await;
        match reported {
            Some(linerate) if linerate != self.state.link.linerate => {
                info!(
                    "Linerate of {} changed from {} to {} bytes/s",
                    self.state.interface, self.state.link.linerate, linerate
                );
                self.state.link.linerate = linerate;
            }
            Some(_) => {}
            None => debug!(
                "No bit rate reported for {}; keeping {} bytes/s",
                self.state.interface, self.state.link.linerate
            ),
        }
    }

    async fn estimate(&mut self, since_last: Duration) {
        if self.sampler.is_none() {
            return;
        }
        if self.state.interface_type == InterfaceType::Wireless {
            self.refresh_linerate().await;
        }
        let Some(handle) = self.sampler.as_mut() else {
            return;
        };
        let snapshot = match handle.channel.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                if let Some(handle) = self.sampler.take() {
                    let res = handle.task.await;
                    self.on_sampler_exit(res);
                }
                return;
            }
        };

        match self.estimator.estimate(snapshot, &self.state.link) {
            Ok(est) => {
                debug!(
                    "Estimate over {} samples at {:?}: tx {:.1} B/s ({:.3}%), rx {:.1} B/s ({:.3}%)",
                    est.samples,
                    snapshot.timestamp,
                    est.mean_tx,
                    est.overload_risk_tx,
                    est.mean_rx,
                    est.overload_risk_rx
                );
                let link = &self.state.link;
                if link.alarm(est.overload_risk_tx) || link.alarm(est.overload_risk_rx) {
                    warn!(
                        "Overload risk on {} above {}%: tx {:.2}%, rx {:.2}%",
                        self.state.interface,
                        link.alarm_trigger,
                        est.overload_risk_tx,
                        est.overload_risk_rx
                    );
                }
                if let Some(display) = self.display.as_mut() {
                    if let Err(e) = display.render(&self.state, &est, since_last) {
                        debug!("Status display failed: {}", e);
                    }
                }
                self.estimation = Some(est);
            }
            Err(EstimateError::NoNewSamples) => debug!("No new samples since last estimate"),
            Err(EstimateError::Domain(d)) => {
                error!(
                    "Overload risk estimation failed ({}), skipping cycle. \
                     mean tx/rx {}/{}, var tx/rx {}/{}, mean^2 tx/rx {}/{}, \
                     previous {:?}, current {:?}",
                    d.reason,
                    d.mean_tx,
                    d.mean_rx,
                    d.var_tx,
                    d.var_rx,
                    d.mean_sq_tx,
                    d.mean_sq_rx,
                    d.previous,
                    d.current
                );
            }
        }
    }

    async fn meter(&mut self) -> Result<(), MonitorError> {
        let Some(est) = self.estimation else {
            debug!("No estimate yet; skipping meter record");
            return Ok(());
        };
        let record = MeterRecord::measurement(Utc::now(), &self.state, &est);
        let ack = self.emit(&record).await?;
        debug!("Meter record accepted: {}", ack);
        Ok(())
    }

    async fn emit(&mut self, record: &MeterRecord) -> Result<Value, MonitorError> {
        let token = self.ensure_token().await?;
        Ok(self.telemetry.put_meter(&self.meter, record, &token).await?)
    }

    async fn ensure_token(&mut self) -> Result<AuthToken, TelemetryError> {
        if let Some(token) = &self.state.token {
            if !token.needs_refresh(Utc::now()) {
                return Ok(token.clone());
            }
        }
        let token = self.telemetry.issue_token().await?;
        info!("Auth token valid until {}", token.expires);
        self.state.token = Some(token.clone());
        Ok(token)
    }

    /// Stops the Sampler and emits the final record. Reaches Exited once.
    async fn exit(&mut self) {
        if self.state.lifecycle == Lifecycle::Exited {
            return;
        }
        self.stop_sampler().await;
        self.state.lifecycle = Lifecycle::Exited;
        let record = MeterRecord::event("exited", Utc::now());
        if let Err(e) = self.emit(&record).await {
            error!("Failed to emit exited record: {}", e);
        }
        info!("Monitor exited");
    }
}

/// `false` while `last + period` is still ahead, or beyond what `Instant` can hold.
fn is_due(now: Instant, last: Instant, period: Duration) -> bool {
    last.checked_add(period).is_some_and(|at| now >= at)
}

#[cfg(test)]
impl Controller {
    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn estimation(&self) -> Option<&EstimationResult> {
        self.estimation.as_ref()
    }

    pub fn sampler_running(&self) -> bool {
        self.sampler.is_some()
    }
}
