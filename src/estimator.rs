//! Lognormal fit of the sampled byte rate and the derived overload risk.
//!
//! The Sampler only ever grows its sums; the Estimator differences two
//! consecutive snapshots to get the moments of the last estimation interval,
//! fits a lognormal by the method of moments and evaluates its survival
//! function at `linerate * cutoff`.

use crate::sampler::RateSnapshot;
use crate::state::LinkParams;
use serde::Serialize;
use std::f64::consts::SQRT_2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("no new samples since the last estimate")]
    NoNewSamples,
    #[error("estimation domain error: {}", .0.reason)]
    Domain(Box<Diagnostics>),
}

/// State dumped when a fit cannot be evaluated.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub reason: String,
    pub mean_tx: f64,
    pub mean_rx: f64,
    pub var_tx: f64,
    pub var_rx: f64,
    pub mean_sq_tx: f64,
    pub mean_sq_rx: f64,
    pub previous: RateSnapshot,
    pub current: RateSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EstimationResult {
    /// Samples that went into this estimate.
    pub samples: u64,
    pub mean_tx: f64,
    pub mean_rx: f64,
    pub var_tx: f64,
    pub var_rx: f64,
    pub mu_tx: f64,
    pub mu_rx: f64,
    pub sigma2_tx: f64,
    pub sigma2_rx: f64,
    pub overload_risk_tx: f64,
    pub overload_risk_rx: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f64,
    pub mean_sq: f64,
    pub var: f64,
}

impl Moments {
    pub fn from_sums(sum: f64, sumsq: f64, n: u64) -> Self {
        let n = n as f64;
        let mean = sum / n;
        let mean_sq = mean * mean;
        let mut var = sumsq / n - mean_sq;
        // Cancellation can leave the variance of a near-constant rate slightly
        // below zero. Rounding hides that jitter; larger negative values still
        // reach the fit and fail there.
        if var < 0.0 {
            var = round_to(var, 5);
        }
        Self { mean, mean_sq, var }
    }
}

pub fn round_to(x: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (x * scale).round() / scale
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LognormalFit {
    pub mu: f64,
    pub sigma2: f64,
}

/// Method-of-moments fit; a zero mean yields the degenerate `(0, 0)`.
pub fn fit_lognormal(m: &Moments) -> LognormalFit {
    if m.mean == 0.0 {
        return LognormalFit { mu: 0.0, sigma2: 0.0 };
    }
    let sigma2 = (1.0 + m.var / m.mean_sq).ln();
    LognormalFit {
        mu: m.mean.ln() - sigma2 / 2.0,
        sigma2,
    }
}

/// `P(X > x)` for `ln X ~ N(mu, sigma^2)`.
pub fn lognormal_sf(x: f64, mu: f64, sigma: f64) -> Result<f64, String> {
    if !(x > 0.0) || !x.is_finite() {
        return Err(format!("survival function evaluated at {x}"));
    }
    if !(sigma > 0.0) || !sigma.is_finite() || !mu.is_finite() {
        return Err(format!("invalid lognormal parameters mu={mu} sigma={sigma}"));
    }
    Ok(0.5 * libm::erfc((x.ln() - mu) / (sigma * SQRT_2)))
}

/// Overload risk in percent for one direction.
pub fn overload_risk(m: &Moments, fit: &LognormalFit, threshold: f64) -> Result<f64, String> {
    if !(threshold > 0.0) || !threshold.is_finite() {
        return Err(format!("risk threshold {threshold} is not positive"));
    }
    if m.mean == 0.0 {
        return Ok(0.0);
    }
    if !fit.sigma2.is_finite() || fit.sigma2 < 0.0 {
        return Err(format!(
            "sigma2 {} from mean {} and variance {}",
            fit.sigma2, m.mean, m.var
        ));
    }
    if fit.sigma2 == 0.0 {
        // No spread: the rate is the mean.
        return Ok(if m.mean > threshold { 100.0 } else { 0.0 });
    }
    let risk = lognormal_sf(threshold, fit.mu, fit.sigma2.sqrt())? * 100.0;
    if !risk.is_finite() {
        return Err(format!("overload risk evaluated to {risk}"));
    }
    Ok(risk)
}

/// Differences successive snapshots of one Sampler. Build a new one whenever
/// the Sampler is restarted.
#[derive(Debug, Default)]
pub struct Estimator {
    previous: RateSnapshot,
}

impl Estimator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn previous(&self) -> &RateSnapshot {
        &self.previous
    }

    pub fn estimate(
        &mut self,
        current: RateSnapshot,
        link: &LinkParams,
    ) -> Result<EstimationResult, EstimateError> {
        let n = current
            .sample_count
            .saturating_sub(self.previous.sample_count);
        if n == 0 {
            return Err(EstimateError::NoNewSamples);
        }
        let previous = std::mem::replace(&mut self.previous, current);

        let tx = Moments::from_sums(
            current.tx_sum - previous.tx_sum,
            current.tx_sumsq - previous.tx_sumsq,
            n,
        );
        let rx = Moments::from_sums(
            current.rx_sum - previous.rx_sum,
            current.rx_sumsq - previous.rx_sumsq,
            n,
        );
        let fit_tx = fit_lognormal(&tx);
        let fit_rx = fit_lognormal(&rx);

        let threshold = link.threshold();
        let risks = overload_risk(&tx, &fit_tx, threshold)
            .map_err(|e| format!("tx: {e}"))
            .and_then(|risk_tx| {
                overload_risk(&rx, &fit_rx, threshold)
                    .map(|risk_rx| (risk_tx, risk_rx))
                    .map_err(|e| format!("rx: {e}"))
            });

        match risks {
            Ok((overload_risk_tx, overload_risk_rx)) => Ok(EstimationResult {
                samples: n,
                mean_tx: tx.mean,
                mean_rx: rx.mean,
                var_tx: tx.var,
                var_rx: rx.var,
                mu_tx: fit_tx.mu,
                mu_rx: fit_rx.mu,
                sigma2_tx: fit_tx.sigma2,
                sigma2_rx: fit_rx.sigma2,
                overload_risk_tx,
                overload_risk_rx,
            }),
            Err(reason) => Err(EstimateError::Domain(Box::new(Diagnostics {
                reason,
                mean_tx: tx.mean,
                mean_rx: rx.mean,
                var_tx: tx.var,
                var_rx: rx.var,
                mean_sq_tx: tx.mean_sq,
                mean_sq_rx: rx.mean_sq,
                previous,
                current,
            }))),
        }
    }
}
