//! Box Spread Scanner Service
//!
//! Repeatedly scans an equity-index options market for mispriced box
//! spreads and routes the ranked survivors to an execution sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use box_core::evaluator::EvaluatorConfig;
use box_core::pricing::FeeRates;
use box_core::risk::RiskParams;
use box_core::{
    auth::StaticCredentialProvider, execution::PaperTradingSink, http::ReqwestTransport, Config,
    CombinationEvaluator, ExecutionSink, ExpiryClassifier, InstrumentStore, QuoteFetcher,
    RateLimiter, ScanOrchestrator, WorkerPool,
};

/// Box Spread Scanner - finds mispriced box spreads in an options market
#[derive(Parser, Debug)]
#[command(name = "box-scanner")]
#[command(about = "Scans an options market for mispriced box spreads")]
struct Args {
    /// Path to the TOML config file
    #[arg(default_value = "config/default.toml")]
    config_path: String,

    /// Run a single scan cycle and exit
    #[arg(long)]
    once: bool,

    /// Raise the log level to debug
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    info!("box-scanner starting");

    let config = Arc::new(Config::load(&args.config_path).context("failed to load config file")?);
    if config.get_string("auth/access_token", "").is_empty() {
        return Err(box_core::ScanError::Fatal("no auth/access_token configured".into()).into());
    }

    let base_url = config.get_string("api/base_url", "https://api.example-broker.test");
    let transport = Arc::new(ReqwestTransport::new());
    let limiter = Arc::new(RateLimiter::new(config.get_i64("api/rate_limits/default", 10) as usize));
    for (endpoint, key) in [
        ("/instruments", "api/rate_limits/instruments"),
        ("/quote/ltp", "api/rate_limits/ltp"),
        ("/quote/ohlc", "api/rate_limits/ohlc"),
        ("/quote", "api/rate_limits/quote"),
    ] {
        let limit = config.get_i64(key, 10) as usize;
        limiter.configure(endpoint, limit).await;
    }
    let credentials = Arc::new(StaticCredentialProvider::new(Arc::clone(&config)));

    let store = Arc::new(InstrumentStore::new(
        Arc::clone(&transport) as _,
        Arc::clone(&limiter),
        Arc::clone(&credentials) as _,
        Arc::clone(&config),
        base_url.clone(),
    ));
    let quote_fetcher = Arc::new(QuoteFetcher::new(
        transport as _,
        Arc::clone(&limiter),
        credentials as _,
        Arc::clone(&config),
        base_url,
    ));
    let pool = Arc::new(WorkerPool::auto_sized());
    let classifier = Arc::new(ExpiryClassifier::new(Arc::clone(&store)));
    let evaluator = Arc::new(CombinationEvaluator::new(Arc::clone(&store), quote_fetcher, Arc::clone(&pool)));
    let orchestrator = ScanOrchestrator::new(Arc::clone(&store), Arc::clone(&classifier), evaluator);

    let sink: Box<dyn ExecutionSink> = if config.get_bool("strategy/paper_trading", true) {
        Box::new(PaperTradingSink::new(config.get_string("strategy/export_dir", "exports")))
    } else {
        Box::new(box_core::execution::NullBrokerSink)
    };

    let underlying = config.get_string("strategy/underlying", "NIFTY");
    let exchange = config.get_string("strategy/exchange", "NFO");
    let scan_interval = Duration::from_secs(config.get_i64("strategy/scan_interval_seconds", 60) as u64);

    loop {
        match run_cycle(&config, &classifier, &orchestrator, &underlying, &exchange).await {
            Ok(candidates) => {
                info!(count = candidates.len(), "scan cycle produced ranked candidates");
                if let Err(e) = sink.route(&candidates) {
                    error!(error = %e, "execution sink failed to route ranked candidates");
                }
            }
            Err(e) => error!(error = %e, "scan cycle failed"),
        }

        if args.once {
            info!("single run mode, exiting");
            break;
        }
        sleep(scan_interval).await;
    }

    Ok(())
}

async fn run_cycle(
    config: &Config,
    classifier: &ExpiryClassifier,
    orchestrator: &ScanOrchestrator,
    underlying: &str,
    exchange: &str,
) -> Result<Vec<box_core::models::BoxSpreadCandidate>> {
    let now = chrono::Utc::now();
    let (weekly, monthly) = classifier.expiries(underlying, exchange, now).await?;
    let expiries = classifier.filter(
        &weekly,
        &monthly,
        config.get_bool("expiry/include_weekly", true),
        config.get_bool("expiry/include_monthly", true),
        config.get_i64("expiry/min_days", 0),
        config.get_i64("expiry/max_days", 45),
        config.get_i64("expiry/max_count", 4) as usize,
        now,
    );

    let eval_config = EvaluatorConfig {
        quantity: Decimal::from(config.get_i64("strategy/quantity", 75)),
        min_strike_diff: Decimal::try_from(config.get_f64("strategy/min_strike_diff", 50.0)).unwrap_or_default(),
        max_strike_diff: Decimal::try_from(config.get_f64("strategy/max_strike_diff", 1000.0)).unwrap_or_default(),
        min_roi_pct: Decimal::try_from(config.get_f64("strategy/min_roi", 0.0)).unwrap_or_default(),
        min_profitability: Decimal::try_from(config.get_f64("strategy/min_profitability", 0.0)).unwrap_or_default(),
        max_slippage: Decimal::try_from(config.get_f64("strategy/max_slippage", 1_000_000.0)).unwrap_or_default(),
        worst_case_slippage_pct: Decimal::try_from(config.get_f64("strategy/worst_case_slippage_percent", 5.0) / 100.0)
            .unwrap_or_default(),
        capital: Decimal::try_from(config.get_f64("strategy/capital", 100_000.0)).unwrap_or_default(),
        fee_rates: FeeRates {
            brokerage_pct: Decimal::try_from(config.get_f64("fees/brokerage_percentage", 0.0003)).unwrap_or_default(),
            max_brokerage_per_order: Decimal::try_from(config.get_f64("fees/max_brokerage_per_order", 20.0)).unwrap_or_default(),
            stt_pct: Decimal::try_from(config.get_f64("fees/stt_percentage", 0.0005)).unwrap_or_default(),
            exchange_charges_pct: Decimal::try_from(config.get_f64("fees/exchange_charges_percentage", 0.0000053)).unwrap_or_default(),
            gst_pct: Decimal::try_from(config.get_f64("fees/gst_percentage", 0.18)).unwrap_or_default(),
            sebi_charges_per_crore: Decimal::try_from(config.get_f64("fees/sebi_charges_per_crore", 10.0)).unwrap_or_default(),
            stamp_duty_pct: Decimal::try_from(config.get_f64("fees/stamp_duty_percentage", 0.00003)).unwrap_or_default(),
        },
        risk_params: RiskParams {
            margin_buffer_pct: Decimal::try_from(config.get_f64("risk/margin_buffer_percentage", 25.0)).unwrap_or_default(),
            exposure_margin_pct: Decimal::try_from(config.get_f64("risk/exposure_margin_percentage", 3.0)).unwrap_or_default(),
            capital_safety_factor: Decimal::try_from(config.get_f64("risk/capital_safety_factor", 0.9)).unwrap_or_default(),
            min_roi_pct: Decimal::try_from(config.get_f64("strategy/min_roi", 0.0)).unwrap_or_default(),
            max_loss_pct: Decimal::try_from(config.get_f64("risk/max_loss_percentage", 100.0)).unwrap_or_default(),
        },
    };

    let strike_band_pct = Decimal::try_from(config.get_f64("option_chain/strike_range_percent", 5.0)).unwrap_or_default();
    let process_in_parallel = config.get_bool("expiry/process_in_parallel", false);
    let delay_between_expiries = Duration::from_millis(config.get_i64("option_chain/pipeline/delay_between_expiries_ms", 0) as u64);

    let (candidates, summary) = orchestrator
        .run_cycle(underlying, exchange, &expiries, strike_band_pct, &eval_config, process_in_parallel, delay_between_expiries)
        .await;
    info!(?summary.per_expiry_counts, "per-expiry candidate counts");
    Ok(candidates)
}
