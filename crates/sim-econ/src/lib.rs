#![deny(warnings)]

//! Economic models: demand curves and pricing helpers for TierSim.
//!
//! This module provides validated utilities for:
//! - Hidden demand curve evaluation per family
//! - Multiplicative uniform noise factors
//! - The gap-driven price adjustment used by the auto controller
//! - Consumer surplus via trapezoid integration
//! - Ordinary least squares fits for the diagnostic demand survey

use rand::Rng;
use serde::Serialize;
use sim_core::DemandKind;
use thiserror::Error;

/// Fixed midpoint of the logistic demand family.
pub const LOGISTIC_MIDPOINT: f64 = 5.0;

/// Errors produced by economic helpers.
#[derive(Debug, Error, PartialEq)]
pub enum EconError {
    /// Integration bound must be finite and > 0, with at least one step.
    #[error("invalid integration bound or step count")]
    InvalidBound,
    /// An OLS fit needs at least two samples.
    #[error("survey sample too small: {0}")]
    DegenerateSample(usize),
}

/// Evaluate one consumer's hidden demand curve at a price.
///
/// Results are floored at zero; a non-finite evaluation contributes zero
/// rather than propagating NaN/Infinity into the series.
///
/// Example:
/// let q = eval_demand(DemandKind::Linear, 120.0, 6.0, 1.0);
/// assert_eq!(q, 114.0);
pub fn eval_demand(kind: DemandKind, a: f64, b: f64, price: f64) -> f64 {
    let q = match kind {
        DemandKind::Linear => a - b * price,
        DemandKind::Log => a - b * (1.0 + price.max(0.0)).ln(),
        DemandKind::Exp => a * (-b * price).exp(),
        DemandKind::Poly => {
            let c = (0.01 * b).max(0.001);
            a - b * price - c * price * price
        }
        DemandKind::Logistic => a / (1.0 + (b * (price - LOGISTIC_MIDPOINT)).exp()),
    };
    if q.is_finite() {
        q.max(0.0)
    } else {
        0.0
    }
}

/// Draw a multiplicative noise factor uniform in `[1-band, 1+band]`.
///
/// A zero or negative band yields exactly 1 without consuming a draw, so
/// noise-free configurations stay on the same random stream.
pub fn noise_factor<R: Rng + ?Sized>(rng: &mut R, band: f64) -> f64 {
    if band <= 0.0 {
        return 1.0;
    }
    1.0 + rng.gen_range(-band..=band)
}

/// Single-step multiplicative price update from the demand/served gap.
///
/// `gap = (demand - served) / max(1, demand)`; the result is floored and a
/// non-finite update collapses to the floor rather than poisoning the run.
pub fn adjust_price(price: f64, demand: f64, served: f64, gain: f64, floor: f64) -> f64 {
    let gap = (demand - served) / demand.max(1.0);
    let next = price * (1.0 + gain * gap);
    if next.is_finite() {
        next.max(floor)
    } else {
        floor
    }
}

/// Trapezoid-rule integral of a demand curve over `[0, upper]`.
///
/// Used for the consumer-surplus estimate of the welfare proxy; the curve
/// is clamped at zero pointwise.
pub fn consumer_surplus<F: Fn(f64) -> f64>(
    curve: F,
    upper: f64,
    steps: usize,
) -> Result<f64, EconError> {
    if !(upper.is_finite() && upper > 0.0) || steps == 0 {
        return Err(EconError::InvalidBound);
    }
    let h = upper / steps as f64;
    let mut acc = 0.5 * (curve(0.0).max(0.0) + curve(upper).max(0.0));
    for i in 1..steps {
        acc += curve(h * i as f64).max(0.0);
    }
    Ok(acc * h)
}

/// A fitted line `quantity = intercept + slope * price`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LineFit {
    pub intercept: f64,
    pub slope: f64,
}

/// Ordinary least squares over `(price, quantity)` samples.
///
/// A degenerate sample (all prices equal) short-circuits to a flat line at
/// the mean quantity instead of dividing by zero.
pub fn ols_fit(samples: &[(f64, f64)]) -> Result<LineFit, EconError> {
    if samples.len() < 2 {
        return Err(EconError::DegenerateSample(samples.len()));
    }
    let n = samples.len() as f64;
    let mean_p = samples.iter().map(|(p, _)| p).sum::<f64>() / n;
    let mean_q = samples.iter().map(|(_, q)| q).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (p, q) in samples {
        let dp = p - mean_p;
        sxx += dp * dp;
        sxy += dp * (q - mean_q);
    }
    if sxx <= f64::EPSILON {
        return Ok(LineFit {
            intercept: mean_q,
            slope: 0.0,
        });
    }
    let slope = sxy / sxx;
    Ok(LineFit {
        intercept: mean_q - slope * mean_p,
        slope,
    })
}
