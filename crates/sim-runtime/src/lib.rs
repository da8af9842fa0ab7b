#![deny(warnings)]

//! Tick-driven runtime for the three-tier supply chain economy.
//!
//! The engine owns all simulation state and advances it one atomic tick at
//! a time: consumer preference updates, aggregate demand, Final-tier
//! planning and ordering, cross-tier order resolution with escalation,
//! autonomous upstream production, price control, innovation adoption, and
//! metrics recording. All randomness flows through a single seeded ChaCha
//! stream in a fixed component order, so a run is a pure function of
//! `(seed, config, external inputs)`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sim_core::{
    validate_config, Band, ConfigError, Consumer, ConsumerId, DemandKind, Firm, FirmId, FirmTier,
    Innovation, MetricsPoint, Order, OrderId, SimConfig, SimEvent, Span,
};
use sim_econ::{adjust_price, consumer_surplus, eval_demand, noise_factor, ols_fit, EconError};
use std::collections::VecDeque;
use tracing::{debug, info};

pub use sim_econ::LineFit;

/// Quantities below this threshold are treated as zero.
const QTY_EPS: f64 = 1e-9;

/// Demand families sampled at initialization.
const PRIMARY_KINDS: [DemandKind; 4] = [
    DemandKind::Linear,
    DemandKind::Log,
    DemandKind::Exp,
    DemandKind::Poly,
];

/// Demand families a regime switch may select.
const ALL_KINDS: [DemandKind; 5] = [
    DemandKind::Linear,
    DemandKind::Log,
    DemandKind::Exp,
    DemandKind::Poly,
    DemandKind::Logistic,
];

const COEFF_A: Band = Band::new(50.0, 150.0);
const NEGATIVE_B_PROB: f64 = 0.02;

const FIRM_TFP: Band = Band::new(0.8, 1.2);
const FIRM_CAPACITY: Band = Band::new(100.0, 400.0);
const FIRM_COST: Band = Band::new(0.5, 2.0);
const FIRM_INVENTORY_FRAC: Band = Band::new(0.5, 1.0);
const FIRM_HISTORY_CAP: usize = 512;

/// Internal transfer prices as fractions of the market price.
const INTERMEDIATE_GOODS_PRICE_FRAC: f64 = 0.5;
const RAW_GOODS_PRICE_FRAC: f64 = 0.25;

/// Relative price perturbation of survey observations.
const SURVEY_PRICE_SPREAD: f64 = 0.2;

const CALIBRATION_DAMPING: f64 = 0.5;

/// Price-setting policy, selected externally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriceMode {
    /// Gap-driven multiplicative update each tick.
    Auto,
    /// Price pinned to the externally supplied value (still floored).
    Manual,
}

/// Externally supplied aggregate demand estimator.
pub type PerceivedDemandFn = Box<dyn Fn(f64) -> f64 + Send>;

/// External inputs, queued and applied at the start of the next tick.
enum Command {
    SetPriceMode(PriceMode),
    SetManualPrice(f64),
    SetPerceivedDemandOverride(Option<PerceivedDemandFn>),
}

/// An outside-market shipment in transit to a Raw-tier firm.
#[derive(Clone, Copy, Debug)]
struct Arrival {
    firm: FirmId,
    amount: f64,
    due: u64,
}

/// End-of-session statistics derived from the running accumulators.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub ticks: u64,
    pub mean_price: f64,
    pub mean_demand: f64,
    pub mean_served: f64,
    pub mean_efficiency: f64,
    pub price_variance: f64,
    pub demand_variance: f64,
    /// Cumulative `|served - oracle_demand(price)|`.
    pub regret: f64,
    /// Cumulative consumer-surplus estimate minus expenditure.
    pub welfare: f64,
}

/// Bounded metric series plus running session accumulators.
struct Recorder {
    window: VecDeque<MetricsPoint>,
    window_cap: usize,
    events: Vec<SimEvent>,
    event_cap: usize,
    event_keep: usize,
    ticks: u64,
    sum_price: f64,
    sum_price_sq: f64,
    sum_demand: f64,
    sum_demand_sq: f64,
    sum_served: f64,
    sum_efficiency: f64,
    regret: f64,
    welfare: f64,
}

impl Recorder {
    fn new(cfg: &SimConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(cfg.metrics_window.min(4096)),
            window_cap: cfg.metrics_window,
            events: Vec::new(),
            event_cap: cfg.event_cap,
            event_keep: cfg.event_keep,
            ticks: 0,
            sum_price: 0.0,
            sum_price_sq: 0.0,
            sum_demand: 0.0,
            sum_demand_sq: 0.0,
            sum_served: 0.0,
            sum_efficiency: 0.0,
            regret: 0.0,
            welfare: 0.0,
        }
    }

    fn record(&mut self, p: MetricsPoint, regret_term: f64, welfare_term: f64) {
        self.window.push_back(p);
        if self.window.len() > self.window_cap {
            self.window.pop_front();
        }
        self.ticks += 1;
        self.sum_price += p.price;
        self.sum_price_sq += p.price * p.price;
        self.sum_demand += p.demand;
        self.sum_demand_sq += p.demand * p.demand;
        self.sum_served += p.served;
        self.sum_efficiency += p.efficiency;
        self.regret += regret_term;
        self.welfare += welfare_term;
    }

    fn push_event(&mut self, ev: SimEvent) {
        self.events.push(ev);
        if self.events.len() > self.event_cap {
            let excess = self.events.len() - self.event_keep;
            self.events.drain(..excess);
        }
    }

    fn summary(&self) -> SessionSummary {
        if self.ticks == 0 {
            return SessionSummary {
                ticks: 0,
                mean_price: 0.0,
                mean_demand: 0.0,
                mean_served: 0.0,
                mean_efficiency: 0.0,
                price_variance: 0.0,
                demand_variance: 0.0,
                regret: 0.0,
                welfare: 0.0,
            };
        }
        let n = self.ticks as f64;
        let mean_price = self.sum_price / n;
        let mean_demand = self.sum_demand / n;
        SessionSummary {
            ticks: self.ticks,
            mean_price,
            mean_demand,
            mean_served: self.sum_served / n,
            mean_efficiency: self.sum_efficiency / n,
            price_variance: (self.sum_price_sq / n - mean_price * mean_price).max(0.0),
            demand_variance: (self.sum_demand_sq / n - mean_demand * mean_demand).max(0.0),
            regret: self.regret,
            welfare: self.welfare,
        }
    }
}

fn draw_span<R: Rng + ?Sized>(rng: &mut R, s: Span) -> u64 {
    rng.gen_range(s.min..=s.max)
}

fn draw_band<R: Rng + ?Sized>(rng: &mut R, b: Band) -> f64 {
    rng.gen_range(b.min..=b.max)
}

fn coeff_b_band(kind: DemandKind) -> Band {
    match kind {
        DemandKind::Linear | DemandKind::Poly => Band::new(1.0, 8.0),
        DemandKind::Log => Band::new(5.0, 30.0),
        DemandKind::Exp => Band::new(0.05, 0.5),
        DemandKind::Logistic => Band::new(0.3, 1.5),
    }
}

/// Sample fresh demand coefficients, including the rare negative-slope branch.
fn sample_coefficients<R: Rng + ?Sized>(kind: DemandKind, rng: &mut R) -> (f64, f64) {
    let a = draw_band(rng, COEFF_A);
    let mut b = draw_band(rng, coeff_b_band(kind));
    if rng.gen::<f64>() < NEGATIVE_B_PROB {
        b = -b;
    }
    (a, b)
}

fn idx(id: FirmId) -> usize {
    id.0 as usize
}

/// The simulation engine. Exclusively owns the run's state; external layers
/// interact only through the command queue and read accessors.
pub struct Engine {
    cfg: SimConfig,
    rng: ChaCha8Rng,
    tick: u64,
    price: f64,
    prev_price: f64,
    consumers: Vec<Consumer>,
    firms: Vec<Firm>,
    orders: Vec<Order>,
    next_order_id: u64,
    arrivals: Vec<Arrival>,
    innovations: Vec<Innovation>,
    price_mode: PriceMode,
    manual_price: f64,
    perceived_override: Option<PerceivedDemandFn>,
    commands: VecDeque<Command>,
    recorder: Recorder,
}

impl Engine {
    /// Build and calibrate a fresh simulation from a validated configuration.
    ///
    /// Invalid configuration is the only hard failure; it is reported before
    /// any state is created.
    pub fn new(cfg: SimConfig, seed: u64) -> Result<Self, ConfigError> {
        validate_config(&cfg)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut consumers = Vec::with_capacity(cfg.consumers);
        for i in 0..cfg.consumers {
            let kind = PRIMARY_KINDS[rng.gen_range(0..PRIMARY_KINDS.len())];
            let (a, b) = sample_coefficients(kind, &mut rng);
            consumers.push(Consumer {
                id: ConsumerId(i as u32),
                kind,
                a,
                b,
                next_update_at: draw_span(&mut rng, cfg.consumer_update_interval),
                next_regime_at: draw_span(&mut rng, cfg.regime_switch_interval),
            });
        }

        let mut firms = Vec::new();
        let mut next_id = 0u32;
        for (tier, range) in [
            (FirmTier::Final, cfg.final_firms),
            (FirmTier::Intermediate, cfg.intermediate_firms),
            (FirmTier::Raw, cfg.raw_firms),
        ] {
            let count = rng.gen_range(range.min..=range.max);
            for _ in 0..count {
                let capacity = draw_band(&mut rng, FIRM_CAPACITY);
                firms.push(Firm {
                    id: FirmId(next_id),
                    tier,
                    tfp: draw_band(&mut rng, FIRM_TFP),
                    capacity,
                    marginal_cost: draw_band(&mut rng, FIRM_COST),
                    inventory: capacity * draw_band(&mut rng, FIRM_INVENTORY_FRAC),
                    cash: 0.0,
                    planned: 0.0,
                    history: Vec::new(),
                });
                next_id += 1;
            }
        }

        let recorder = Recorder::new(&cfg);
        let mut engine = Self {
            rng,
            tick: 0,
            price: cfg.initial_price,
            prev_price: cfg.initial_price,
            consumers,
            firms,
            orders: Vec::new(),
            next_order_id: 0,
            arrivals: Vec::new(),
            innovations: Vec::new(),
            price_mode: PriceMode::Auto,
            manual_price: cfg.initial_price,
            perceived_override: None,
            commands: VecDeque::new(),
            recorder,
            cfg,
        };
        engine.calibrate();
        info!(
            consumers = engine.consumers.len(),
            firms = engine.firms.len(),
            "engine initialized"
        );
        Ok(engine)
    }

    /// Damped proportional scaling of firm capacities (and inventories) until
    /// aggregate Final-tier capacity matches noise-free demand at the initial
    /// price, within the configured tolerance.
    fn calibrate(&mut self) {
        let price = self.price;
        let tol = self.cfg.calibration_tolerance;
        for iteration in 0..self.cfg.calibration_iters {
            let supply: f64 = self
                .firms
                .iter()
                .filter(|f| f.tier == FirmTier::Final)
                .map(|f| f.capacity)
                .sum();
            if supply <= QTY_EPS {
                break;
            }
            let demand = self.oracle_aggregate(price);
            if (demand - supply).abs() < tol * supply {
                debug!(iteration, supply, demand, "calibration converged");
                return;
            }
            let factor = (1.0 + CALIBRATION_DAMPING * (demand / supply - 1.0)).max(0.0);
            for f in &mut self.firms {
                f.capacity *= factor;
                f.inventory *= factor;
            }
        }
        debug!("calibration stopped at iteration cap");
    }

    // ---- external command surface -------------------------------------

    pub fn set_price_mode(&mut self, mode: PriceMode) {
        self.commands.push_back(Command::SetPriceMode(mode));
    }

    pub fn set_manual_price(&mut self, value: f64) {
        self.commands.push_back(Command::SetManualPrice(value));
    }

    /// Install or clear the planner's demand estimator. `None` reverts to the
    /// internal stochastic estimator.
    pub fn set_perceived_demand_override(&mut self, f: Option<PerceivedDemandFn>) {
        self.commands
            .push_back(Command::SetPerceivedDemandOverride(f));
    }

    fn drain_commands(&mut self) {
        while let Some(cmd) = self.commands.pop_front() {
            match cmd {
                Command::SetPriceMode(mode) => self.price_mode = mode,
                Command::SetManualPrice(v) => {
                    // a non-finite manual price is ignored rather than fatal
                    if v.is_finite() {
                        self.manual_price = v;
                    }
                }
                Command::SetPerceivedDemandOverride(f) => self.perceived_override = f,
            }
        }
    }

    // ---- demand -------------------------------------------------------

    /// True hidden aggregate demand without observation noise. This is the
    /// oracle used for calibration and the regret metric.
    pub fn oracle_aggregate(&self, price: f64) -> f64 {
        self.consumers
            .iter()
            .map(|c| eval_demand(c.kind, c.a, c.b, price))
            .sum()
    }

    fn aggregate_demand(&mut self, price: f64) -> f64 {
        let cfg = self.cfg;
        let Self { consumers, rng, .. } = self;
        consumers
            .iter()
            .map(|c| eval_demand(c.kind, c.a, c.b, price) * noise_factor(rng, cfg.demand_noise))
            .sum()
    }

    fn perceived_demand(&mut self, price: f64, true_demand: f64) -> f64 {
        if let Some(f) = &self.perceived_override {
            let v = f(price);
            // a bad override contributes zero demand instead of aborting the tick
            if v.is_finite() {
                v.max(0.0)
            } else {
                0.0
            }
        } else {
            true_demand * draw_band(&mut self.rng, self.cfg.perceived_band)
        }
    }

    fn update_consumers(&mut self) {
        let t = self.tick;
        let cfg = self.cfg;
        let price_delta = self.prev_price - self.price;
        let Self { consumers, rng, .. } = self;
        for c in consumers.iter_mut() {
            c.a *= noise_factor(rng, cfg.jitter_band);
            c.b *= noise_factor(rng, cfg.jitter_band);
            if cfg.feedback_strength != 0.0 {
                c.a = (c.a + cfg.feedback_strength * price_delta).max(0.0);
            }
            if t >= c.next_update_at {
                if rng.gen::<f64>() < cfg.resample_prob {
                    let (a, b) = sample_coefficients(c.kind, rng);
                    c.a = a;
                    c.b = b;
                } else {
                    c.a *= noise_factor(rng, cfg.drift_band);
                    c.b *= noise_factor(rng, cfg.drift_band);
                }
                if rng.gen::<f64>() < cfg.shock_prob {
                    c.a *= draw_band(rng, cfg.shock_factor);
                }
                c.next_update_at = t + draw_span(rng, cfg.consumer_update_interval);
            }
            if t >= c.next_regime_at {
                c.kind = ALL_KINDS[rng.gen_range(0..ALL_KINDS.len())];
                let (a, b) = sample_coefficients(c.kind, rng);
                c.a = a;
                c.b = b;
                c.next_regime_at = t + draw_span(rng, cfg.regime_switch_interval);
            }
        }
    }

    // ---- planning and orders -------------------------------------------

    fn tier_indices(&self, tier: FirmTier) -> Vec<usize> {
        (0..self.firms.len())
            .filter(|&i| self.firms[i].tier == tier)
            .collect()
    }

    fn push_order(
        &mut self,
        from: FirmId,
        to: FirmId,
        amount: f64,
        due: u64,
        origin: Option<OrderId>,
    ) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        self.orders.push(Order {
            id,
            from_firm: from,
            to_firm: to,
            amount,
            remaining: amount,
            created_at: self.tick,
            due,
            escalated: false,
            origin,
        });
        id
    }

    /// Final-tier firms split perceived demand in proportion to `tfp * capacity`
    /// and order the deficit beyond their inventory from a random
    /// Intermediate-tier supplier.
    fn plan_final_tier(&mut self, perceived: f64) {
        let t = self.tick;
        let finals = self.tier_indices(FirmTier::Final);
        if finals.is_empty() {
            return;
        }
        let total_weight: f64 = finals
            .iter()
            .map(|&i| {
                let f = &self.firms[i];
                f.tfp * f.capacity
            })
            .sum();
        let intermediates = self.tier_indices(FirmTier::Intermediate);
        for &i in &finals {
            let share = if total_weight > QTY_EPS {
                let f = &self.firms[i];
                f.tfp * f.capacity / total_weight
            } else {
                // degenerate zero-weight population shares equally
                1.0 / finals.len() as f64
            };
            let planned = (perceived * share).max(0.0);
            self.firms[i].planned = planned;
            let deficit = planned - self.firms[i].inventory;
            if deficit > QTY_EPS && !intermediates.is_empty() {
                let pick = intermediates[self.rng.gen_range(0..intermediates.len())];
                let supplier = self.firms[pick].id;
                let buyer = self.firms[i].id;
                let due = t + draw_span(&mut self.rng, self.cfg.final_order_delay);
                let order = self.push_order(buyer, supplier, deficit, due, None);
                self.push_event(SimEvent::OrderPlaced {
                    tick: t,
                    order,
                    from: buyer,
                    to: supplier,
                    amount: deficit,
                });
            }
        }
    }

    fn deliver_arrivals(&mut self) {
        let t = self.tick;
        let mut delivered = Vec::new();
        self.arrivals.retain(|a| {
            if a.due <= t {
                delivered.push(*a);
                false
            } else {
                true
            }
        });
        for a in delivered {
            self.firms[idx(a.firm)].inventory += a.amount;
        }
    }

    /// Move inventory from supplier to buyer, capped by availability, with the
    /// illustrative cash transfer. Returns the quantity moved.
    fn transfer(&mut self, supplier: usize, buyer: usize, amount: f64, unit_price: f64) -> f64 {
        let take = self.firms[supplier].inventory.min(amount).max(0.0);
        if take <= QTY_EPS {
            return 0.0;
        }
        self.firms[supplier].inventory -= take;
        self.firms[buyer].inventory += take;
        let paid = take * unit_price;
        self.firms[buyer].cash -= paid;
        self.firms[supplier].cash += paid;
        take
    }

    /// Resolve all due unfilled orders in `(due, id)` order, cascading
    /// shortfalls down the chain, then sweep filled orders from the ledger.
    fn resolve_orders(&mut self) {
        let t = self.tick;
        let mut due: Vec<usize> = (0..self.orders.len())
            .filter(|&i| self.orders[i].due <= t && self.orders[i].remaining > QTY_EPS)
            .collect();
        due.sort_by_key(|&i| (self.orders[i].due, self.orders[i].id.0));
        for i in due {
            if self.orders[i].remaining <= QTY_EPS {
                // already satisfied by a cascade earlier in this pass
                continue;
            }
            match self.firms[idx(self.orders[i].to_firm)].tier {
                FirmTier::Intermediate => self.fill_replenishment(i),
                FirmTier::Raw => self.fill_escalation(i),
                FirmTier::Final => {}
            }
        }
        self.orders.retain(|o| o.remaining > QTY_EPS);
    }

    /// A due Final -> Intermediate order: partial transfer, with the first
    /// shortfall spawning one Intermediate -> Raw child order.
    fn fill_replenishment(&mut self, i: usize) {
        let t = self.tick;
        let (oid, buyer, supplier, remaining) = {
            let o = &self.orders[i];
            (o.id, idx(o.from_firm), idx(o.to_firm), o.remaining)
        };
        let take = self.transfer(
            supplier,
            buyer,
            remaining,
            self.price * INTERMEDIATE_GOODS_PRICE_FRAC,
        );
        self.orders[i].remaining -= take;
        if self.orders[i].remaining <= QTY_EPS {
            self.push_event(SimEvent::OrderFilled { tick: t, order: oid });
        } else if !self.orders[i].escalated {
            self.orders[i].escalated = true;
            let shortfall = self.orders[i].remaining;
            let raws = self.tier_indices(FirmTier::Raw);
            if !raws.is_empty() {
                let pick = raws[self.rng.gen_range(0..raws.len())];
                let raw_id = self.firms[pick].id;
                let inter_id = self.orders[i].to_firm;
                let due = t + draw_span(&mut self.rng, self.cfg.escalation_delay);
                let child = self.push_order(inter_id, raw_id, shortfall, due, Some(oid));
                self.push_event(SimEvent::OrderEscalated {
                    tick: t,
                    parent: oid,
                    child,
                });
                debug!(parent = oid.0, child = child.0, shortfall, "order escalated");
            }
        }
    }

    /// A due Intermediate -> Raw order: partial transfer; a completed fill
    /// cascades into the parent immediately, while a Raw shortfall books an
    /// outside-market replenishment and defers the order to its arrival.
    fn fill_escalation(&mut self, i: usize) {
        let t = self.tick;
        let (oid, buyer, supplier, remaining, origin) = {
            let o = &self.orders[i];
            (o.id, idx(o.from_firm), idx(o.to_firm), o.remaining, o.origin)
        };
        let take = self.transfer(supplier, buyer, remaining, self.price * RAW_GOODS_PRICE_FRAC);
        self.orders[i].remaining -= take;
        if self.orders[i].remaining <= QTY_EPS {
            self.push_event(SimEvent::OrderFilled { tick: t, order: oid });
            if let Some(parent) = origin {
                self.cascade_fill(parent);
            }
        } else if !self.orders[i].escalated {
            self.orders[i].escalated = true;
            let amount = self.orders[i].remaining;
            let firm = self.orders[i].to_firm;
            let due = t + draw_span(&mut self.rng, self.cfg.external_delay);
            self.arrivals.push(Arrival { firm, amount, due });
            // re-check the order once the outside shipment lands
            self.orders[i].due = due;
            self.push_event(SimEvent::ExternalReplenishment {
                tick: t,
                firm,
                amount,
                due,
            });
            debug!(
                order = oid.0,
                firm = firm.0,
                amount,
                due,
                "external replenishment scheduled"
            );
        }
    }

    fn cascade_fill(&mut self, parent: OrderId) {
        let t = self.tick;
        if let Some(pi) = self.orders.iter().position(|o| o.id == parent) {
            if self.orders[pi].remaining > QTY_EPS {
                let (buyer, supplier, remaining) = {
                    let o = &self.orders[pi];
                    (idx(o.from_firm), idx(o.to_firm), o.remaining)
                };
                let take = self.transfer(
                    supplier,
                    buyer,
                    remaining,
                    self.price * INTERMEDIATE_GOODS_PRICE_FRAC,
                );
                self.orders[pi].remaining -= take;
                if self.orders[pi].remaining <= QTY_EPS {
                    let oid = self.orders[pi].id;
                    self.push_event(SimEvent::OrderFilled { tick: t, order: oid });
                }
            }
        }
    }

    // ---- production ------------------------------------------------------

    /// Intermediate and Raw firms produce a random fraction of capacity each
    /// tick, independent of downstream demand.
    fn autonomous_production(&mut self) {
        let Self { firms, rng, .. } = self;
        for f in firms.iter_mut() {
            if f.tier == FirmTier::Final {
                continue;
            }
            let u: f64 = rng.gen();
            let produced = f.capacity * (0.4 + 0.6 * u);
            f.inventory += produced;
            f.cash -= produced * f.marginal_cost;
        }
    }

    /// Final-tier production: `served = min(planned, inventory, capacity)`;
    /// capacity acts as a same-tick throughput bound on top of the stock bound.
    fn serve_final_tier(&mut self) -> f64 {
        let t = self.tick;
        let price = self.price;
        let mut total = 0.0;
        for f in self.firms.iter_mut() {
            if f.tier != FirmTier::Final {
                continue;
            }
            let served = f.planned.min(f.inventory).min(f.capacity).max(0.0);
            f.inventory -= served;
            f.cash += served * (price - f.marginal_cost);
            f.history.push((t, served));
            if f.history.len() > FIRM_HISTORY_CAP {
                f.history.remove(0);
            }
            total += served;
        }
        total
    }

    // ---- price and innovation ---------------------------------------------

    fn update_price(&mut self, demand: f64, served: f64) {
        self.prev_price = self.price;
        self.price = match self.price_mode {
            PriceMode::Auto => adjust_price(
                self.price,
                demand,
                served,
                self.cfg.price_gain,
                self.cfg.price_floor,
            ),
            PriceMode::Manual => self.manual_price.max(self.cfg.price_floor),
        };
    }

    /// Explicitly schedule an innovation for a firm. The stochastic scheduler
    /// uses the same path internally. An unknown firm id is ignored.
    pub fn schedule_innovation(
        &mut self,
        firm: FirmId,
        cost_mul: f64,
        tfp_mul: f64,
        adopt_at: u64,
    ) {
        let t = self.tick;
        let tier = match self.firms.get(idx(firm)) {
            Some(f) => f.tier,
            None => {
                debug!(firm = firm.0, "innovation for unknown firm ignored");
                return;
            }
        };
        self.innovations.push(Innovation {
            firm,
            tier,
            cost_mul,
            tfp_mul,
            scheduled_at: t,
            adopt_at: adopt_at.max(t),
            adopted: false,
        });
        self.push_event(SimEvent::InnovationScheduled {
            tick: t,
            firm,
            adopt_at: adopt_at.max(t),
        });
    }

    fn innovation_step(&mut self) {
        let t = self.tick;
        if self.rng.gen::<f64>() < self.cfg.innovation_prob {
            let tier = match self.rng.gen_range(0..3u8) {
                0 => FirmTier::Final,
                1 => FirmTier::Intermediate,
                _ => FirmTier::Raw,
            };
            let candidates = self.tier_indices(tier);
            if !candidates.is_empty() {
                let pick = candidates[self.rng.gen_range(0..candidates.len())];
                let firm = self.firms[pick].id;
                let cost_mul = draw_band(&mut self.rng, self.cfg.innovation_cost_mul);
                let tfp_mul = draw_band(&mut self.rng, self.cfg.innovation_tfp_mul);
                let adopt_at = t + draw_span(&mut self.rng, self.cfg.innovation_adopt_delay);
                self.schedule_innovation(firm, cost_mul, tfp_mul, adopt_at);
                debug!(firm = firm.0, cost_mul, tfp_mul, adopt_at, "innovation scheduled");
            }
        }
        // adoption sweep: each innovation applies exactly once, permanently
        let Self {
            innovations,
            firms,
            recorder,
            ..
        } = self;
        for inn in innovations.iter_mut() {
            if !inn.adopted && t >= inn.adopt_at {
                let f = &mut firms[idx(inn.firm)];
                f.marginal_cost *= inn.cost_mul;
                f.tfp *= inn.tfp_mul;
                inn.adopted = true;
                recorder.push_event(SimEvent::InnovationAdopted {
                    tick: t,
                    firm: inn.firm,
                });
                debug!(firm = inn.firm.0, "innovation adopted");
            }
        }
    }

    // ---- metrics ---------------------------------------------------------

    fn push_event(&mut self, ev: SimEvent) {
        self.recorder.push_event(ev);
    }

    fn record(&mut self, demand: f64, served: f64) -> MetricsPoint {
        let t = self.tick;
        let efficiency = served / demand.max(1.0);
        let point = MetricsPoint {
            tick: t,
            price: self.price,
            demand,
            served,
            efficiency,
        };
        let oracle = self.oracle_aggregate(self.price);
        let regret_term = if oracle > 0.0 {
            (served - oracle).abs()
        } else {
            0.0
        };
        let surplus = consumer_surplus(
            |p| self.oracle_aggregate(p),
            self.cfg.welfare_price_bound,
            self.cfg.welfare_steps,
        )
        .unwrap_or(0.0);
        let welfare_term = surplus - self.price * served;
        self.recorder.record(point, regret_term, welfare_term);
        point
    }

    // ---- stepping ----------------------------------------------------------

    /// Advance the simulation by one atomic tick and return the recorded
    /// metrics point. Randomness is consumed in a fixed component order:
    /// consumers, then firms, then orders, then innovations.
    pub fn tick(&mut self) -> MetricsPoint {
        self.drain_commands();
        self.tick += 1;
        self.update_consumers();
        let demand = self.aggregate_demand(self.price);
        let perceived = self.perceived_demand(self.price, demand);
        self.plan_final_tier(perceived);
        self.deliver_arrivals();
        self.resolve_orders();
        self.autonomous_production();
        let served = self.serve_final_tier();
        self.update_price(demand, served);
        self.innovation_step();
        self.record(demand, served)
    }

    /// Run `n` ticks, collecting the metric points.
    pub fn run(&mut self, n: u64) -> Vec<MetricsPoint> {
        (0..n).map(|_| self.tick()).collect()
    }

    /// Fit a diagnostic demand line from a noisy consumer sub-sample observed
    /// at perturbed prices. Consumes random draws but mutates nothing else.
    pub fn survey_sample(&mut self, sample_size: usize) -> Result<LineFit, EconError> {
        let cfg = self.cfg;
        let price = self.price;
        let mut samples = Vec::with_capacity(sample_size);
        let Self { consumers, rng, .. } = self;
        for _ in 0..sample_size {
            let c = &consumers[rng.gen_range(0..consumers.len())];
            let p = price * (1.0 + rng.gen_range(-SURVEY_PRICE_SPREAD..=SURVEY_PRICE_SPREAD));
            let q = eval_demand(c.kind, c.a, c.b, p) * noise_factor(rng, cfg.demand_noise);
            samples.push((p, q));
        }
        ols_fit(&samples)
    }

    // ---- read accessors ------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn price_mode(&self) -> PriceMode {
        self.price_mode
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn firms(&self) -> &[Firm] {
        &self.firms
    }

    pub fn firms_in(&self, tier: FirmTier) -> impl Iterator<Item = &Firm> {
        self.firms.iter().filter(move |f| f.tier == tier)
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn innovations(&self) -> &[Innovation] {
        &self.innovations
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.recorder.events
    }

    /// Rolling window of recorded metric points, oldest first.
    pub fn metrics(&self) -> impl Iterator<Item = &MetricsPoint> {
        self.recorder.window.iter()
    }

    pub fn summary(&self) -> SessionSummary {
        self.recorder.summary()
    }

    /// Position of the random stream, for snapshot observability.
    pub fn rng_position(&self) -> u128 {
        self.rng.get_word_pos()
    }

    /// Rolling-window tick series as structured JSON records. Runs longer
    /// than `metrics_window` export only the most recent points; size the
    /// window to the run length to keep the full series.
    pub fn metrics_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.recorder.window)
    }

    /// Tick series as flat rows `(tick, price, demand, served, efficiency)`,
    /// window-bounded like [`Engine::metrics_json`]; CSV formatting itself is
    /// the external layer's concern.
    pub fn metrics_csv(&self) -> Vec<(u64, f64, f64, f64, f64)> {
        self.recorder
            .window
            .iter()
            .map(|p| (p.tick, p.price, p.demand, p.served, p.efficiency))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sim_core::CountRange;
    use std::collections::HashSet;

    fn test_config() -> SimConfig {
        SimConfig {
            consumers: 40,
            welfare_steps: 16,
            ..SimConfig::default()
        }
    }

    fn run_scripted(seed: u64) -> Vec<MetricsPoint> {
        let mut eng = Engine::new(test_config(), seed).unwrap();
        let mut out = Vec::new();
        for i in 0..60 {
            if i == 10 {
                eng.set_price_mode(PriceMode::Manual);
                eng.set_manual_price(3.0);
            }
            if i == 20 {
                eng.set_price_mode(PriceMode::Auto);
            }
            if i == 30 {
                eng.set_perceived_demand_override(Some(Box::new(|p| 500.0 - 10.0 * p)));
            }
            if i == 40 {
                eng.set_perceived_demand_override(None);
            }
            out.push(eng.tick());
        }
        out
    }

    #[test]
    fn deterministic_replay_with_scripted_overrides() {
        assert_eq!(run_scripted(7), run_scripted(7));
    }

    #[test]
    fn different_seeds_diverge() {
        assert_ne!(run_scripted(7), run_scripted(8));
    }

    #[test]
    fn capacity_and_planning_bound_served() {
        let mut eng = Engine::new(test_config(), 11).unwrap();
        for _ in 0..100 {
            let t = eng.tick_count() + 1;
            eng.tick();
            for f in eng.firms_in(FirmTier::Final) {
                let (tick, served) = *f.history.last().unwrap();
                assert_eq!(tick, t);
                assert!(served <= f.planned + 1e-9);
                assert!(served <= f.capacity + 1e-9);
                assert!(served >= 0.0);
            }
        }
    }

    #[test]
    fn order_due_exceeds_creation_and_fills_are_unique() {
        let mut eng = Engine::new(test_config(), 13).unwrap();
        for _ in 0..120 {
            eng.tick();
            for o in eng.orders() {
                assert!(o.due > o.created_at);
                assert!(o.remaining > 0.0);
            }
        }
        let mut filled = HashSet::new();
        for ev in eng.events() {
            if let SimEvent::OrderFilled { order, .. } = ev {
                assert!(filled.insert(*order), "order filled twice: {order:?}");
            }
        }
    }

    #[test]
    fn efficiency_stays_within_perceived_band() {
        let mut eng = Engine::new(test_config(), 17).unwrap();
        let band_max = eng.config().perceived_band.max;
        for p in eng.run(150) {
            assert!(p.efficiency >= 0.0);
            assert!(p.efficiency <= band_max + 1e-9);
        }
    }

    #[test]
    fn zero_demand_is_benign() {
        let mut eng = Engine::new(test_config(), 19).unwrap();
        for c in &mut eng.consumers {
            c.a = 0.0;
            c.b = 0.0;
            c.next_update_at = u64::MAX;
            c.next_regime_at = u64::MAX;
        }
        let initial = eng.price();
        for p in eng.run(20) {
            assert_eq!(p.demand, 0.0);
            assert_eq!(p.served, 0.0);
            assert_eq!(p.efficiency, 0.0);
            assert_eq!(p.price, initial);
            assert!(p.price.is_finite());
        }
        // zero oracle demand accrues neither regret nor welfare
        let s = eng.summary();
        assert_eq!(s.regret, 0.0);
        assert_eq!(s.welfare, 0.0);
        assert_eq!(s.mean_price, initial);
        assert_eq!(s.mean_served, 0.0);
    }

    #[test]
    fn price_feedback_nudges_intercept() {
        let cfg = SimConfig {
            feedback_strength: 0.5,
            jitter_band: 0.0,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 59).unwrap();
        for c in &mut eng.consumers {
            c.next_update_at = u64::MAX;
            c.next_regime_at = u64::MAX;
        }
        eng.consumers[0].a = 100.0;
        eng.consumers[1].a = 2.0;
        eng.set_price_mode(PriceMode::Manual);
        eng.set_manual_price(4.0);

        // no price move observed yet on the first tick
        eng.tick();
        assert_eq!(eng.consumers[0].a, 100.0);
        assert_eq!(eng.consumers[1].a, 2.0);

        // the 10 -> 4 drop nudges upward: a += 0.5 * 6
        eng.tick();
        assert_eq!(eng.consumers[0].a, 103.0);
        assert_eq!(eng.consumers[1].a, 5.0);

        // a 4 -> 20 rise nudges downward, clamped at zero: a += 0.5 * -16
        eng.set_manual_price(20.0);
        eng.tick(); // new price takes effect at this tick's end
        eng.tick();
        assert_eq!(eng.consumers[0].a, 95.0);
        assert_eq!(eng.consumers[1].a, 0.0);
    }

    #[test]
    fn recorder_summary_statistics() {
        let cfg = test_config();
        let mut rec = Recorder::new(&cfg);
        let empty = rec.summary();
        assert_eq!(empty.ticks, 0);
        assert_eq!(empty.mean_price, 0.0);
        assert_eq!(empty.regret, 0.0);

        let p1 = MetricsPoint {
            tick: 1,
            price: 2.0,
            demand: 10.0,
            served: 8.0,
            efficiency: 0.8,
        };
        let p2 = MetricsPoint {
            tick: 2,
            price: 4.0,
            demand: 30.0,
            served: 24.0,
            efficiency: 0.8,
        };
        rec.record(p1, 1.5, 3.0);
        rec.record(p2, 2.5, -1.0);
        let s = rec.summary();
        assert_eq!(s.ticks, 2);
        assert_eq!(s.mean_price, 3.0);
        assert_eq!(s.price_variance, 1.0);
        assert_eq!(s.mean_demand, 20.0);
        assert_eq!(s.demand_variance, 100.0);
        assert_eq!(s.mean_served, 16.0);
        assert_eq!(s.mean_efficiency, 0.8);
        assert_eq!(s.regret, 4.0);
        assert_eq!(s.welfare, 2.0);
    }

    #[test]
    fn summary_matches_recorded_series() {
        let mut eng = Engine::new(test_config(), 61).unwrap();
        let points = eng.run(50);
        let s = eng.summary();
        assert_eq!(s.ticks, 50);
        let n = points.len() as f64;
        let mean_price = points.iter().map(|p| p.price).sum::<f64>() / n;
        let mean_demand = points.iter().map(|p| p.demand).sum::<f64>() / n;
        let mean_served = points.iter().map(|p| p.served).sum::<f64>() / n;
        assert!((s.mean_price - mean_price).abs() <= 1e-9 * mean_price.max(1.0));
        assert!((s.mean_demand - mean_demand).abs() <= 1e-9 * mean_demand.max(1.0));
        assert!((s.mean_served - mean_served).abs() <= 1e-9 * mean_served.max(1.0));
        assert!(s.price_variance >= 0.0);
        assert!(s.demand_variance >= 0.0);
        assert!(s.regret >= 0.0);
        assert!(s.welfare.is_finite());
    }

    #[test]
    fn unknown_firm_innovation_is_ignored() {
        let cfg = SimConfig {
            innovation_prob: 0.0,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 67).unwrap();
        eng.schedule_innovation(FirmId(999), 0.9, 1.1, 5);
        assert!(eng.innovations().is_empty());
        eng.run(10);
        assert!(eng
            .events()
            .iter()
            .all(|e| !matches!(e, SimEvent::InnovationScheduled { .. })));
    }

    #[test]
    fn faulty_override_contributes_zero_demand() {
        let mut eng = Engine::new(test_config(), 23).unwrap();
        eng.set_perceived_demand_override(Some(Box::new(|_| f64::NAN)));
        let p = eng.tick();
        assert!(p.demand.is_finite());
        for f in eng.firms() {
            if f.tier == FirmTier::Final {
                assert_eq!(f.planned, 0.0);
            }
        }
        assert_eq!(p.served, 0.0);
    }

    #[test]
    fn manual_price_below_floor_is_floored() {
        let mut eng = Engine::new(test_config(), 29).unwrap();
        eng.set_price_mode(PriceMode::Manual);
        eng.set_manual_price(0.01);
        let p = eng.tick();
        assert_eq!(p.price, eng.config().price_floor);
    }

    #[test]
    fn metrics_window_is_bounded_and_exportable() {
        let cfg = SimConfig {
            metrics_window: 10,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 31).unwrap();
        eng.run(25);
        let rows = eng.metrics_csv();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].0, 16);
        assert_eq!(rows[9].0, 25);
        let json = eng.metrics_json().unwrap();
        let back: Vec<MetricsPoint> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 10);
        assert_eq!(back[0].tick, 16);
    }

    #[test]
    fn event_log_is_trimmed_on_overflow() {
        let cfg = SimConfig {
            event_cap: 10,
            event_keep: 4,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 37).unwrap();
        eng.run(50);
        assert!(eng.events().len() <= 10);
    }

    #[test]
    fn survey_recovers_linear_population() {
        let cfg = SimConfig {
            demand_noise: 0.0,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 41).unwrap();
        for c in &mut eng.consumers {
            c.kind = DemandKind::Linear;
            c.a = 120.0;
            c.b = 6.0;
        }
        let fit = eng.survey_sample(50).unwrap();
        assert!((fit.slope + 6.0).abs() < 1e-6);
        assert!((fit.intercept - 120.0).abs() < 1e-6);
    }

    #[test]
    fn calibration_matches_initial_demand() {
        let cfg = SimConfig {
            consumers: 350,
            initial_price: 1.0,
            final_firms: CountRange::new(1, 1),
            intermediate_firms: CountRange::new(1, 1),
            raw_firms: CountRange::new(1, 1),
            ..SimConfig::default()
        };
        let mut eng = Engine::new(cfg, 12345).unwrap();
        for c in &mut eng.consumers {
            c.kind = DemandKind::Linear;
            c.a = 120.0;
            c.b = 6.0;
        }
        let fi = eng.tier_indices(FirmTier::Final)[0];
        eng.firms[fi].capacity = 1000.0;
        eng.price = 1.0;
        eng.calibrate();
        let supply: f64 = eng
            .firms()
            .iter()
            .filter(|f| f.tier == FirmTier::Final)
            .map(|f| f.capacity)
            .sum();
        let demand = eng.oracle_aggregate(1.0);
        assert!(
            (demand - supply).abs() < 0.01 * supply,
            "calibration residual too large: demand={demand}, supply={supply}"
        );
    }

    #[test]
    fn shortage_cascades_downstream_exactly_once() {
        let cfg = SimConfig {
            consumers: 5,
            final_firms: CountRange::new(1, 1),
            intermediate_firms: CountRange::new(1, 1),
            raw_firms: CountRange::new(1, 1),
            innovation_prob: 0.0,
            ..SimConfig::default()
        };
        let mut eng = Engine::new(cfg, 43).unwrap();
        for f in &mut eng.firms {
            f.capacity = 0.0;
            f.inventory = 0.0;
        }
        // pin demand positive so the first tick definitely places an order
        for c in &mut eng.consumers {
            c.kind = DemandKind::Linear;
            c.a = 120.0;
            c.b = 2.0;
            c.next_update_at = u64::MAX;
            c.next_regime_at = u64::MAX;
        }
        eng.tick();
        assert_eq!(eng.orders().len(), 1, "one order placed at tick 1");
        let parent = eng.orders()[0].clone();
        assert_eq!(parent.created_at, 1);
        assert!(parent.due > parent.created_at);

        // silence demand so no further orders are placed
        for c in &mut eng.consumers {
            c.a = 0.0;
            c.next_update_at = u64::MAX;
            c.next_regime_at = u64::MAX;
        }

        // at tick 1 + min(delay) the order is still unfilled
        let min_due = 1 + eng.config().final_order_delay.min;
        while eng.tick_count() < min_due {
            eng.tick();
        }
        assert!(eng
            .orders()
            .iter()
            .any(|o| o.id == parent.id && o.remaining > 0.0));

        while eng.tick_count() < 90 {
            eng.tick();
        }
        let mut escalations = Vec::new();
        let mut first_fill_tick = None;
        let mut externals = 0;
        for ev in eng.events() {
            match ev {
                SimEvent::OrderEscalated { tick, parent: p, .. } => {
                    escalations.push((*tick, *p));
                }
                SimEvent::OrderFilled { tick, .. } => {
                    if first_fill_tick.is_none() {
                        first_fill_tick = Some(*tick);
                    }
                }
                SimEvent::ExternalReplenishment { .. } => externals += 1,
                _ => {}
            }
        }
        assert_eq!(escalations.len(), 1, "exactly one escalation");
        assert_eq!(escalations[0], (parent.due, parent.id));
        let first_fill = first_fill_tick.expect("cascade eventually fills");
        assert!(first_fill > escalations[0].0, "no fill before the escalation");
        assert_eq!(externals, 1);
        assert!(eng.orders().is_empty(), "ledger swept after fills");
    }

    #[test]
    fn manual_price_pins_exactly() {
        let mut eng = Engine::new(test_config(), 47).unwrap();
        eng.run(4);
        eng.set_price_mode(PriceMode::Manual);
        eng.set_manual_price(2.5);
        for _ in 5..=20 {
            let p = eng.tick();
            assert_eq!(p.price, 2.5f64.max(eng.config().price_floor));
        }
    }

    #[test]
    fn innovation_adopts_exactly_once() {
        let cfg = SimConfig {
            innovation_prob: 0.0,
            ..test_config()
        };
        let mut eng = Engine::new(cfg, 53).unwrap();
        eng.run(3);
        let firm = eng.firms()[0].id;
        let cost0 = eng.firms()[0].marginal_cost;
        let tfp0 = eng.firms()[0].tfp;
        let t = eng.tick_count();
        eng.schedule_innovation(firm, 0.9, 1.1, t + 5);
        let inn = eng.innovations().last().unwrap();
        assert!(inn.adopt_at >= inn.scheduled_at);

        eng.run(4);
        assert_eq!(eng.firms()[0].marginal_cost, cost0);
        assert_eq!(eng.firms()[0].tfp, tfp0);

        eng.tick(); // adoption tick
        assert_eq!(eng.firms()[0].marginal_cost, cost0 * 0.9);
        assert_eq!(eng.firms()[0].tfp, tfp0 * 1.1);
        assert!(eng.innovations().last().unwrap().adopted);

        eng.tick(); // no second application
        assert_eq!(eng.firms()[0].marginal_cost, cost0 * 0.9);
        assert_eq!(eng.firms()[0].tfp, tfp0 * 1.1);
    }

    #[test]
    fn invalid_config_is_rejected_before_state_exists() {
        let cfg = SimConfig {
            final_order_delay: Span::new(15, 5),
            ..SimConfig::default()
        };
        assert!(Engine::new(cfg, 1).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn quantities_stay_non_negative(seed in 0u64..1000) {
            let mut eng = Engine::new(test_config(), seed).unwrap();
            for p in eng.run(80) {
                prop_assert!(p.price >= eng.config().price_floor);
                prop_assert!(p.demand >= 0.0);
                prop_assert!(p.served >= 0.0);
                prop_assert!(p.efficiency >= 0.0);
            }
            for f in eng.firms() {
                prop_assert!(f.inventory >= 0.0);
                prop_assert!(f.capacity >= 0.0);
            }
        }
    }
}

