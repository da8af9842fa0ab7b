#![deny(warnings)]

//! Core domain models and invariants for TierSim.
//!
//! This crate defines the serializable types shared across the simulation —
//! consumers, tiered firms, orders, innovations, metrics — together with
//! validation helpers that reject invalid configuration before any state is
//! created.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a consumer in the hidden population.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub u32);

/// Unique identifier for a firm, stable across the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmId(pub u32);

/// Unique identifier for a replenishment order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

/// Closed-form demand curve families.
///
/// Each consumer's hidden willingness-to-buy is one of these parametric
/// curves; evaluation is by pattern match, never by string dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemandKind {
    /// `a - b*p`
    Linear,
    /// `a - b*ln(1 + max(0, p))`
    Log,
    /// `a * e^(-b*p)`
    Exp,
    /// `a - b*p - c*p^2` with `c = max(0.001, 0.01*b)`
    Poly,
    /// `a / (1 + e^(b*(p - mid)))`
    Logistic,
}

/// One member of the hidden consumer population.
///
/// Created at initialization and never destroyed; coefficients mutate on
/// the consumer's own schedule plus a small per-tick jitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Consumer {
    pub id: ConsumerId,
    /// Active demand family.
    pub kind: DemandKind,
    /// Intercept/scale coefficient (typically >= 0).
    pub a: f64,
    /// Slope/decay coefficient; sign may flip rarely to model atypical behavior.
    pub b: f64,
    /// Next tick at which the coefficient re-randomization runs.
    pub next_update_at: u64,
    /// Next tick at which the demand family is reassigned entirely.
    pub next_regime_at: u64,
}

/// Supply chain position of a firm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmTier {
    /// Sells consumer goods directly to the hidden population.
    Final,
    /// Supplies inputs to Final-tier firms, drawing on Raw-tier firms.
    Intermediate,
    /// Base-level producer with no modeled upstream dependency.
    Raw,
}

/// A producing firm. Firm count is fixed for the run's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Firm {
    pub id: FirmId,
    pub tier: FirmTier,
    /// Productivity multiplier `A`; grows via adopted innovations.
    pub tfp: f64,
    /// Production ceiling per tick.
    pub capacity: f64,
    /// Per-unit cost; shrinks via adopted innovations.
    pub marginal_cost: f64,
    /// Tier-specific input stock, owned exclusively by the firm.
    pub inventory: f64,
    /// Illustrative running cash balance.
    pub cash: f64,
    /// This tick's production target (Final tier only, zero otherwise).
    pub planned: f64,
    /// Bounded per-tick production history as `(tick, served)`.
    pub history: Vec<(u64, f64)>,
}

/// A directed replenishment request between firms at adjacent tiers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Downstream buyer.
    pub from_firm: FirmId,
    /// Upstream supplier.
    pub to_firm: FirmId,
    /// Quantity originally requested.
    pub amount: f64,
    /// Quantity still outstanding; the order is filled once this reaches zero.
    pub remaining: f64,
    pub created_at: u64,
    /// Resolution tick; always strictly greater than `created_at`.
    pub due: u64,
    /// Whether a shortfall already spawned a child order (at most once).
    pub escalated: bool,
    /// Parent order this one is covering, for cross-tier cascades.
    pub origin: Option<OrderId>,
}

/// A scheduled, later-adopted permanent shift to a firm's cost and productivity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Innovation {
    pub firm: FirmId,
    pub tier: FirmTier,
    /// Cost multiplier, < 1 (cost-reducing).
    pub cost_mul: f64,
    /// Productivity multiplier, > 1.
    pub tfp_mul: f64,
    pub scheduled_at: u64,
    /// Adoption tick; always >= `scheduled_at`.
    pub adopt_at: u64,
    pub adopted: bool,
}

/// One recorded point of the per-tick metric series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsPoint {
    pub tick: u64,
    pub price: f64,
    pub demand: f64,
    pub served: f64,
    /// `served / max(1, demand)`.
    pub efficiency: f64,
}

/// Discrete event log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SimEvent {
    OrderPlaced {
        tick: u64,
        order: OrderId,
        from: FirmId,
        to: FirmId,
        amount: f64,
    },
    OrderFilled {
        tick: u64,
        order: OrderId,
    },
    OrderEscalated {
        tick: u64,
        parent: OrderId,
        child: OrderId,
    },
    /// An outside-market shipment scheduled for a Raw-tier firm.
    ExternalReplenishment {
        tick: u64,
        firm: FirmId,
        amount: f64,
        due: u64,
    },
    InnovationScheduled {
        tick: u64,
        firm: FirmId,
        adopt_at: u64,
    },
    InnovationAdopted {
        tick: u64,
        firm: FirmId,
    },
}

/// Inclusive continuous range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Inclusive tick-delay range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub min: u64,
    pub max: u64,
}

impl Span {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }
}

/// Inclusive firm-count range for one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: usize,
    pub max: usize,
}

impl CountRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

/// Simulation configuration. Validated once at engine creation; the engine
/// never clamps invalid values silently.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Size of the hidden consumer population.
    pub consumers: usize,
    pub initial_price: f64,
    /// Hard lower bound on market price.
    pub price_floor: f64,
    /// Gain of the auto price controller.
    pub price_gain: f64,
    pub final_firms: CountRange,
    pub intermediate_firms: CountRange,
    pub raw_firms: CountRange,
    /// Transit delay for Final -> Intermediate orders.
    pub final_order_delay: Span,
    /// Transit delay for escalated Intermediate -> Raw orders.
    pub escalation_delay: Span,
    /// Delivery delay for outside-market replenishment of Raw firms.
    pub external_delay: Span,
    /// Per-tick probability of scheduling one innovation.
    pub innovation_prob: f64,
    pub innovation_cost_mul: Band,
    pub innovation_tfp_mul: Band,
    pub innovation_adopt_delay: Span,
    /// Ticks between consumer coefficient re-randomizations.
    pub consumer_update_interval: Span,
    /// Ticks between consumer demand-family reassignments.
    pub regime_switch_interval: Span,
    /// Probability that a due consumer update fully resamples coefficients.
    pub resample_prob: f64,
    /// Probability of a large multiplicative shock to `a` on a due update.
    pub shock_prob: f64,
    pub shock_factor: Band,
    /// Multiplicative drift half-width applied on non-resample updates.
    pub drift_band: f64,
    /// Per-tick multiplicative jitter half-width on coefficients.
    pub jitter_band: f64,
    /// Multiplicative observation noise half-width on demand draws.
    pub demand_noise: f64,
    /// Band of the stochastic perceived-demand factor.
    pub perceived_band: Band,
    /// Strength of the experimental price-feedback nudge on `a`.
    pub feedback_strength: f64,
    /// Rolling window length of the metric series.
    pub metrics_window: usize,
    /// Event log cap; on overflow the log is trimmed to `event_keep`.
    pub event_cap: usize,
    pub event_keep: usize,
    /// Upper price bound of the welfare integral.
    pub welfare_price_bound: f64,
    /// Trapezoid steps of the welfare integral.
    pub welfare_steps: usize,
    pub calibration_iters: usize,
    /// Relative supply/demand mismatch tolerated after calibration.
    pub calibration_tolerance: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            consumers: 300,
            initial_price: 10.0,
            price_floor: 0.1,
            price_gain: 0.08,
            final_firms: CountRange::new(3, 6),
            intermediate_firms: CountRange::new(2, 5),
            raw_firms: CountRange::new(2, 4),
            final_order_delay: Span::new(5, 15),
            escalation_delay: Span::new(5, 20),
            external_delay: Span::new(10, 25),
            innovation_prob: 0.03,
            innovation_cost_mul: Band::new(0.92, 0.99),
            innovation_tfp_mul: Band::new(1.02, 1.25),
            innovation_adopt_delay: Span::new(10, 60),
            consumer_update_interval: Span::new(30, 90),
            regime_switch_interval: Span::new(30, 100),
            resample_prob: 0.1,
            shock_prob: 0.01,
            shock_factor: Band::new(1.5, 3.0),
            drift_band: 0.07,
            jitter_band: 0.01,
            demand_noise: 0.05,
            perceived_band: Band::new(0.8, 1.2),
            feedback_strength: 0.0,
            metrics_window: 2048,
            event_cap: 5000,
            event_keep: 2000,
            welfare_price_bound: 60.0,
            welfare_steps: 64,
            calibration_iters: 40,
            calibration_tolerance: 0.01,
        }
    }
}

/// Validation errors for configuration invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A range with max < min.
    #[error("{0}: range max < min")]
    EmptyRange(&'static str),
    /// Consumer population must be non-empty.
    #[error("consumer count must be > 0")]
    NoConsumers,
    /// A firm-count range must admit at least one firm.
    #[error("{0}: count range must be >= 1")]
    ZeroCount(&'static str),
    /// A delay range must be at least one tick so `due > created_at` holds.
    #[error("{0}: delay must be >= 1 tick")]
    ZeroDelay(&'static str),
    /// Numeric field must be finite.
    #[error("{0}: non-finite value")]
    NonFinite(&'static str),
    /// Probability outside [0, 1].
    #[error("{0}: probability must be within [0,1]")]
    InvalidProbability(&'static str),
    /// Value must be strictly positive.
    #[error("{0}: must be > 0")]
    NonPositive(&'static str),
    /// Noise half-width outside [0, 1).
    #[error("{0}: noise band must be within [0,1)")]
    InvalidNoiseBand(&'static str),
    /// Cost multipliers must reduce cost: band within (0, 1).
    #[error("innovation cost multiplier band must lie within (0,1)")]
    InvalidCostBand,
    /// Productivity multipliers must increase productivity: band above 1.
    #[error("innovation productivity multiplier band must lie above 1")]
    InvalidTfpBand,
    /// Event retention must not exceed the cap.
    #[error("event keep must not exceed event cap")]
    EventKeepExceedsCap,
}

fn check_band(b: Band, name: &'static str) -> Result<(), ConfigError> {
    if !(b.min.is_finite() && b.max.is_finite()) {
        return Err(ConfigError::NonFinite(name));
    }
    if b.max < b.min {
        return Err(ConfigError::EmptyRange(name));
    }
    Ok(())
}

fn check_span(s: Span, name: &'static str) -> Result<(), ConfigError> {
    if s.max < s.min {
        return Err(ConfigError::EmptyRange(name));
    }
    Ok(())
}

fn check_delay(s: Span, name: &'static str) -> Result<(), ConfigError> {
    check_span(s, name)?;
    if s.min == 0 {
        return Err(ConfigError::ZeroDelay(name));
    }
    Ok(())
}

fn check_counts(c: CountRange, name: &'static str) -> Result<(), ConfigError> {
    if c.max < c.min {
        return Err(ConfigError::EmptyRange(name));
    }
    if c.min == 0 {
        return Err(ConfigError::ZeroCount(name));
    }
    Ok(())
}

fn check_prob(p: f64, name: &'static str) -> Result<(), ConfigError> {
    if !p.is_finite() {
        return Err(ConfigError::NonFinite(name));
    }
    if !(0.0..=1.0).contains(&p) {
        return Err(ConfigError::InvalidProbability(name));
    }
    Ok(())
}

fn check_noise(n: f64, name: &'static str) -> Result<(), ConfigError> {
    if !n.is_finite() {
        return Err(ConfigError::NonFinite(name));
    }
    if !(0.0..1.0).contains(&n) {
        return Err(ConfigError::InvalidNoiseBand(name));
    }
    Ok(())
}

/// Validate a configuration, including cross-field constraints.
pub fn validate_config(cfg: &SimConfig) -> Result<(), ConfigError> {
    if cfg.consumers == 0 {
        return Err(ConfigError::NoConsumers);
    }
    for (v, name) in [
        (cfg.initial_price, "initial_price"),
        (cfg.price_floor, "price_floor"),
        (cfg.welfare_price_bound, "welfare_price_bound"),
    ] {
        if !v.is_finite() {
            return Err(ConfigError::NonFinite(name));
        }
        if v <= 0.0 {
            return Err(ConfigError::NonPositive(name));
        }
    }
    if !cfg.price_gain.is_finite() {
        return Err(ConfigError::NonFinite("price_gain"));
    }
    if !cfg.feedback_strength.is_finite() {
        return Err(ConfigError::NonFinite("feedback_strength"));
    }
    check_counts(cfg.final_firms, "final_firms")?;
    check_counts(cfg.intermediate_firms, "intermediate_firms")?;
    check_counts(cfg.raw_firms, "raw_firms")?;
    check_delay(cfg.final_order_delay, "final_order_delay")?;
    check_delay(cfg.escalation_delay, "escalation_delay")?;
    check_delay(cfg.external_delay, "external_delay")?;
    check_span(cfg.innovation_adopt_delay, "innovation_adopt_delay")?;
    check_delay(cfg.consumer_update_interval, "consumer_update_interval")?;
    check_delay(cfg.regime_switch_interval, "regime_switch_interval")?;
    check_prob(cfg.innovation_prob, "innovation_prob")?;
    check_prob(cfg.resample_prob, "resample_prob")?;
    check_prob(cfg.shock_prob, "shock_prob")?;
    check_band(cfg.shock_factor, "shock_factor")?;
    check_band(cfg.innovation_cost_mul, "innovation_cost_mul")?;
    check_band(cfg.innovation_tfp_mul, "innovation_tfp_mul")?;
    check_band(cfg.perceived_band, "perceived_band")?;
    if cfg.innovation_cost_mul.min <= 0.0 || cfg.innovation_cost_mul.max >= 1.0 {
        return Err(ConfigError::InvalidCostBand);
    }
    if cfg.innovation_tfp_mul.min <= 1.0 {
        return Err(ConfigError::InvalidTfpBand);
    }
    check_noise(cfg.drift_band, "drift_band")?;
    check_noise(cfg.jitter_band, "jitter_band")?;
    check_noise(cfg.demand_noise, "demand_noise")?;
    if cfg.perceived_band.min <= 0.0 {
        return Err(ConfigError::NonPositive("perceived_band"));
    }
    for (v, name) in [
        (cfg.metrics_window, "metrics_window"),
        (cfg.event_cap, "event_cap"),
        (cfg.event_keep, "event_keep"),
        (cfg.welfare_steps, "welfare_steps"),
        (cfg.calibration_iters, "calibration_iters"),
    ] {
        if v == 0 {
            return Err(ConfigError::NonPositive(name));
        }
    }
    if cfg.event_keep > cfg.event_cap {
        return Err(ConfigError::EventKeepExceedsCap);
    }
    if !cfg.calibration_tolerance.is_finite() {
        return Err(ConfigError::NonFinite("calibration_tolerance"));
    }
    if cfg.calibration_tolerance <= 0.0 {
        return Err(ConfigError::NonPositive("calibration_tolerance"));
    }
    Ok(())
}
