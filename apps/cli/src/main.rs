#![deny(warnings)]

//! Headless CLI for running the supply chain simulation and reporting KPIs.

use anyhow::Result;
use sim_core::SimConfig;
use sim_runtime::{Engine, PriceMode};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

struct Args {
    seed: u64,
    ticks: u64,
    manual_price: Option<f64>,
    survey: Option<usize>,
    json: bool,
    csv: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        seed: 42,
        ticks: 365,
        manual_price: None,
        survey: None,
        json: false,
        csv: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--seed" => {
                if let Some(v) = it.next().and_then(|s| s.parse().ok()) {
                    args.seed = v;
                }
            }
            "--ticks" => {
                if let Some(v) = it.next().and_then(|s| s.parse().ok()) {
                    args.ticks = v;
                }
            }
            "--manual-price" => {
                args.manual_price = it.next().and_then(|s| s.parse().ok());
            }
            "--survey" => {
                args.survey = it.next().and_then(|s| s.parse().ok());
            }
            "--json" => args.json = true,
            "--csv" => args.csv = true,
            _ => {}
        }
    }
    args
}

fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args();
    info!(seed = args.seed, ticks = args.ticks, "starting CLI");

    let mut engine = Engine::new(SimConfig::default(), args.seed)?;
    if let Some(p) = args.manual_price {
        engine.set_price_mode(PriceMode::Manual);
        engine.set_manual_price(p);
    }
    for _ in 0..args.ticks {
        let _ = engine.tick();
    }

    let summary = engine.summary();
    println!(
        "Run OK | ticks: {} | firms: {} | open orders: {}",
        summary.ticks,
        engine.firms().len(),
        engine.orders().len()
    );
    println!(
        "KPI | price: {:.3} (mean {:.3}, var {:.4}) | demand: {:.1} | served: {:.1} | efficiency: {:.1}% | regret: {:.1} | welfare: {:.1}",
        engine.price(),
        summary.mean_price,
        summary.price_variance,
        summary.mean_demand,
        summary.mean_served,
        summary.mean_efficiency * 100.0,
        summary.regret,
        summary.welfare
    );

    if let Some(n) = args.survey {
        let fit = engine.survey_sample(n)?;
        println!(
            "Survey | samples: {} | intercept: {:.2} | slope: {:.3}",
            n, fit.intercept, fit.slope
        );
    }
    if args.json {
        println!("{}", engine.metrics_json()?);
    }
    if args.csv {
        println!("tick,price,demand,served,efficiency");
        for (tick, price, demand, served, efficiency) in engine.metrics_csv() {
            println!("{tick},{price},{demand},{served},{efficiency}");
        }
    }

    Ok(())
}
