use crate::channel::{RateChannel, SamplerRequest};
use crate::counters::{CounterError, CounterSource, CounterWidth};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("counter source failed {failures} times in a row: {source}")]
    CounterSource {
        failures: u32,
        #[source]
        source: CounterError,
    },
}

/// One reading of the interface counters.
#[derive(Debug, Clone, Copy)]
pub struct CounterSample {
    pub timestamp: Instant,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Running sums of per-tick byte rates since the Sampler started.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateAccumulator {
    pub sample_count: u64,
    pub tx_sum: f64,
    pub rx_sum: f64,
    pub tx_sumsq: f64,
    pub rx_sumsq: f64,
}

/// Immutable copy of the accumulator handed to the Estimator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    /// Time since the Sampler started.
    pub timestamp: Duration,
    pub sample_count: u64,
    pub tx_sum: f64,
    pub rx_sum: f64,
    pub tx_sumsq: f64,
    pub rx_sumsq: f64,
}

pub struct Sampler {
    source: Box<dyn CounterSource>,
    width: CounterWidth,
    started: Instant,
    /// `None` until the next successful read re-establishes a baseline.
    previous: Option<CounterSample>,
    acc: RateAccumulator,
    sample_rate: u32,
    period: Duration,
    failures: u32,
    max_failures: u32,
}

impl Sampler {
    /// Takes the baseline reading; an unreadable source is reported here rather than on the first tick.
    pub fn start(
        mut source: Box<dyn CounterSource>,
        sample_rate: u32,
        width: CounterWidth,
        max_failures: u32,
    ) -> Result<Self, CounterError> {
        let reading = source.read()?;
        let now = Instant::now();
        Ok(Self {
            source,
            width,
            started: now,
            previous: Some(CounterSample {
                timestamp: now,
                tx_bytes: reading.tx_bytes,
                rx_bytes: reading.rx_bytes,
            }),
            acc: RateAccumulator::default(),
            sample_rate: sample_rate.max(1),
            period: period_for(sample_rate),
            failures: 0,
            max_failures: max_failures.max(1),
        })
    }

    pub fn interface(&self) -> &str {
        self.source.interface()
    }

    #[cfg(test)]
    pub fn accumulator(&self) -> RateAccumulator {
        self.acc
    }

    /// Takes effect from the next sleep on.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.period = period_for(self.sample_rate);
    }

    pub fn set_interface(&mut self, interface: &str) {
        self.source.set_interface(interface);
        self.previous = None;
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            timestamp: self.started.elapsed(),
            sample_count: self.acc.sample_count,
            tx_sum: self.acc.tx_sum,
            rx_sum: self.acc.rx_sum,
            tx_sumsq: self.acc.tx_sumsq,
            rx_sumsq: self.acc.rx_sumsq,
        }
    }

    /// Reads the counters once. Read failures are retried on later ticks until
    /// `max_failures` happen back to back.
    pub fn sample(&mut self) -> Result<Option<(f64, f64)>, SamplerError> {
        match self.source.read() {
            Ok(reading) => {
                if self.failures > 0 {
                    info!(
                        "Counters on {} readable again after {} failed reads",
                        self.source.interface(),
                        self.failures
                    );
                    self.failures = 0;
                }
                Ok(self.record(CounterSample {
                    timestamp: Instant::now(),
                    tx_bytes: reading.tx_bytes,
                    rx_bytes: reading.rx_bytes,
                }))
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= self.max_failures {
                    return Err(SamplerError::CounterSource {
                        failures: self.failures,
                        source: e,
                    });
                }
                if self.failures == 1 {
                    warn!("Counter read failed on {}: {}", self.source.interface(), e);
                } else {
                    debug!("Counter read failed ({} in a row): {}", self.failures, e);
                }
                Ok(None)
            }
        }
    }

    /// Accumulates the rates between the previous reading and `current`.
    /// Returns the (tx, rx) rates, or `None` if the tick only set a baseline.
    pub fn record(&mut self, current: CounterSample) -> Option<(f64, f64)> {
        let Some(previous) = self.previous else {
            self.previous = Some(current);
            return None;
        };
        let elapsed = current
            .timestamp
            .saturating_duration_since(previous.timestamp)
            .as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let tx_rate = self.width.delta(previous.tx_bytes, current.tx_bytes) as f64 / elapsed;
        let rx_rate = self.width.delta(previous.rx_bytes, current.rx_bytes) as f64 / elapsed;

        self.acc.sample_count += 1;
        self.acc.tx_sum += tx_rate;
        self.acc.rx_sum += rx_rate;
        self.acc.tx_sumsq += tx_rate * tx_rate;
        self.acc.rx_sumsq += rx_rate * rx_rate;
        self.previous = Some(current);
        Some((tx_rate, rx_rate))
    }

    /// Returns false once a stop has been requested.
    fn handle(&mut self, request: SamplerRequest) -> bool {
        match request {
            SamplerRequest::Snapshot(reply) => {
                // The requester may have given up; nothing to do then.
                let _ = reply.send(self.snapshot());
                true
            }
            SamplerRequest::Stop => false,
            SamplerRequest::SetInterface(interface) => {
                self.set_interface(&interface);
                true
            }
            SamplerRequest::SetSampleRate(rate) => {
                self.set_sample_rate(rate);
                true
            }
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SamplerRequest>,
    ) -> Result<(), SamplerError> {
        debug!(
            "Sampler started on {} at {}/s",
            self.interface(),
            self.sample_rate
        );
        let mut keep_running = true;
        let mut wake: Option<SamplerRequest> = None;

        while keep_running {
            self.sample()?;

            if let Some(request) = wake.take() {
                keep_running &= self.handle(request);
            }
            loop {
                match requests.try_recv() {
                    Ok(request) => keep_running &= self.handle(request),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        keep_running = false;
                        break;
                    }
                }
            }
            if !keep_running {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                request = requests.recv() => match request {
                    Some(request) => wake = Some(request),
                    None => keep_running = false,
                },
            }
        }

        debug!(
            "Sampler on {} stopped after {} samples",
            self.interface(),
            self.acc.sample_count
        );
        Ok(())
    }
}

fn period_for(sample_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / sample_rate.max(1) as f64)
}

/// A running Sampler task and the Controller's end of its channel.
pub struct SamplerHandle {
    pub channel: RateChannel,
    pub task: JoinHandle<Result<(), SamplerError>>,
}

impl SamplerHandle {
    pub fn spawn(sampler: Sampler) -> Self {
        let (channel, requests) = RateChannel::pair();
        let task = tokio::spawn(sampler.run(requests));
        Self { channel, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::mock::{clock_factory, reading, ScriptedCounters};
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn scripted(script: Vec<Option<crate::counters::CounterReading>>) -> Sampler {
        Sampler::start(
            Box::new(ScriptedCounters::new(script)),
            1000,
            CounterWidth::Bits32,
            3,
        )
        .unwrap()
    }

    fn at(base: Instant, ms: u64, tx: u64, rx: u64) -> CounterSample {
        CounterSample {
            timestamp: base + Duration::from_millis(ms),
            tx_bytes: tx,
            rx_bytes: rx,
        }
    }

    #[tokio::test]
    async fn test_rates_match_deltas_without_wrap() {
        let mut sampler = scripted(vec![reading(0, 0)]);
        let base = Instant::now();
        sampler.previous = Some(at(base, 0, 0, 0));

        let mut rng = rand::thread_rng();
        let (mut tx, mut rx, mut ms) = (0u64, 0u64, 0u64);
        for _ in 0..200 {
            let dt = rng.gen_range(1..50);
            let dtx = rng.gen_range(0..1_000_000);
            let drx = rng.gen_range(0..1_000_000);
            ms += dt;
            tx += dtx;
            rx += drx;
            let (tx_rate, rx_rate) = sampler.record(at(base, ms, tx, rx)).unwrap();
            let elapsed = dt as f64 / 1000.0;
            assert!(tx_rate >= 0.0 && rx_rate >= 0.0);
            assert!((tx_rate - dtx as f64 / elapsed).abs() < 1e-6 * (1.0 + tx_rate));
            assert!((rx_rate - drx as f64 / elapsed).abs() < 1e-6 * (1.0 + rx_rate));
        }
        assert_eq!(sampler.accumulator().sample_count, 200);
    }

    #[tokio::test]
    async fn test_wraparound_delta() {
        let mut sampler = scripted(vec![reading(0, 0)]);
        let base = Instant::now();
        let before_wrap = (1u64 << 32) - 10;
        sampler.previous = Some(at(base, 0, before_wrap, 0));

        // 15 bytes in one second.
        let (tx_rate, _) = sampler.record(at(base, 1000, 5, 0)).unwrap();
        assert!((tx_rate - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_elapsed_tick_is_skipped() {
        let mut sampler = scripted(vec![reading(0, 0)]);
        let base = Instant::now();
        sampler.previous = Some(at(base, 0, 0, 0));
        assert!(sampler.record(at(base, 0, 100, 100)).is_none());
        assert_eq!(sampler.accumulator().sample_count, 0);
    }

    #[tokio::test]
    async fn test_accumulator_is_monotonic() {
        let mut sampler = scripted(vec![reading(0, 0)]);
        let base = Instant::now();
        sampler.previous = Some(at(base, 0, 0, 0));
        let mut last = sampler.accumulator();
        for i in 1..50u64 {
            sampler.record(at(base, i, i * i, i * 3));
            let acc = sampler.accumulator();
            assert!(acc.sample_count > last.sample_count);
            assert!(acc.tx_sum >= last.tx_sum && acc.rx_sum >= last.rx_sum);
            assert!(acc.tx_sumsq >= last.tx_sumsq && acc.rx_sumsq >= last.rx_sumsq);
            last = acc;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mut sampler = scripted(vec![reading(0, 0), None, None, reading(10, 10)]);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(sampler.sample().unwrap().is_none());
        assert!(sampler.sample().unwrap().is_none());
        assert!(sampler.sample().unwrap().is_some());
        assert_eq!(sampler.failures, 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_fatal() {
        let mut sampler = scripted(vec![reading(0, 0), None]);
        assert!(sampler.sample().unwrap().is_none());
        assert!(sampler.sample().unwrap().is_none());
        assert!(matches!(
            sampler.sample(),
            Err(SamplerError::CounterSource { failures: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_start_fails_on_unreadable_source() {
        let result = Sampler::start(
            Box::new(ScriptedCounters::new(vec![None])),
            1000,
            CounterWidth::Bits32,
            3,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_interface_change_rebaselines() {
        let mut sampler = scripted(vec![reading(0, 0)]);
        let base = Instant::now();
        sampler.previous = Some(at(base, 0, 1_000_000, 0));
        sampler.set_interface("eth1");
        assert_eq!(sampler.interface(), "eth1");
        // Lower counters on the new interface must not be read as a wrap.
        assert!(sampler.record(at(base, 1, 10, 10)).is_none());
        let (tx_rate, _) = sampler.record(at(base, 2, 11, 10)).unwrap();
        assert!((tx_rate - 1000.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_snapshot_constant_rate() {
        let reads = Arc::new(AtomicU64::new(0));
        let source = clock_factory(1, 0, reads.clone())("eth0").unwrap();
        let sampler = Sampler::start(source, 1000, CounterWidth::Bits32, 10).unwrap();
        let mut handle = SamplerHandle::spawn(sampler);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = handle.channel.snapshot().await.unwrap();
        let n = snap.sample_count as f64;
        assert!(snap.sample_count >= 990, "only {} samples", snap.sample_count);
        assert!((snap.tx_sum / n - 1000.0).abs() < 1e-6);
        assert_eq!(snap.rx_sum, 0.0);
        assert!(reads.load(Ordering::Relaxed) > 0);

        handle.channel.stop().await.unwrap();
        handle.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_sample_rate_change() {
        let reads = Arc::new(AtomicU64::new(0));
        let source = clock_factory(1, 1, reads.clone())("eth0").unwrap();
        let sampler = Sampler::start(source, 1000, CounterWidth::Bits32, 10).unwrap();
        let mut handle = SamplerHandle::spawn(sampler);

        handle.channel.set_sample_rate(10).await.unwrap();
        let before = handle.channel.snapshot().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after = handle.channel.snapshot().await.unwrap();
        let ticks = after.sample_count - before.sample_count;
        assert!((9..=12).contains(&ticks), "{} ticks at 10/s", ticks);

        handle.channel.stop().await.unwrap();
        handle.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_ends_with_error_on_persistent_failure() {
        let source = Box::new(ScriptedCounters::new(vec![reading(0, 0), None]));
        let sampler = Sampler::start(source, 1000, CounterWidth::Bits32, 5).unwrap();
        let mut handle = SamplerHandle::spawn(sampler);

        let result = (&mut handle.task).await.unwrap();
        assert!(matches!(result, Err(SamplerError::CounterSource { .. })));
        assert!(handle.channel.snapshot().await.is_err());
    }
}
