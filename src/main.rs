mod clock;
mod config;
mod data;
mod database;
mod engine;
mod error;
mod features;
mod indicators;
mod ml;
mod regime;
mod scanner;
mod strategies;
mod trader;
mod types;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::system_clock;
use config::{ConfigLoader, ConfigSource};
use data::HybridDataFetcher;
use database::{Database, SharedStore};
use engine::Engine;
use trader::PaperTrader;
use types::Timeframe;

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(300);
const DB_POOL_SIZE: u32 = 10;
const DB_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "papertrader")]
#[command(version = "0.1.0")]
#[command(about = "Crypto paper-trading engine: scan, filter, simulate, record", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Emit logs as JSON (for production log shipping)
    #[arg(long)]
    log_json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine (default)
    Run,
    /// Report OHLC coverage gaps for a symbol; never writes bar data
    Backfill {
        symbol: String,
        /// Start date (YYYY-MM-DD)
        from: String,
        /// End date (YYYY-MM-DD)
        to: String,
    },
    /// Close all open positions with reason `manual`
    ResetPositions,
}

fn init_tracing(json: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct Env {
    db_url: String,
    config_source: ConfigSource,
}

impl Env {
    /// Read and validate the process environment. `live` mode is refused
    /// outright: this binary only ever simulates.
    fn load() -> Result<Self, String> {
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "paper".to_string());
        match environment.as_str() {
            "paper" => {}
            "live" => {
                return Err("ENVIRONMENT=live is not supported; this engine is paper-only".to_string())
            }
            other => return Err(format!("unknown ENVIRONMENT '{}'; expected paper or live", other)),
        }

        let db_url = std::env::var("DB_URL")
            .map_err(|_| "DB_URL is not set".to_string())?;

        if std::env::var("MARKET_DATA_API_KEY").is_err() {
            warn!("MARKET_DATA_API_KEY is not set; the external ingester owns market data anyway");
        }

        let config_source = match std::env::var("CONFIG_PATH") {
            Ok(path) => ConfigSource::File(path.into()),
            Err(_) => ConfigSource::Store,
        };

        Ok(Self { db_url, config_source })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.verbose);

    info!("papertrader v0.1.0");

    let env = match Env::load() {
        Ok(env) => env,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let store: SharedStore = match Database::connect(&env.db_url, DB_POOL_SIZE, DB_QUERY_TIMEOUT).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, "cannot reach the store");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_engine(store, env.config_source).await,
        Commands::Backfill { symbol, from, to } => report_coverage(store, &symbol, &from, &to).await,
        Commands::ResetPositions => reset_positions(store, env.config_source).await,
    }
}

async fn run_engine(store: SharedStore, config_source: ConfigSource) -> ExitCode {
    let (loader, handle) =
        match ConfigLoader::bootstrap(config_source, store.clone(), CONFIG_RELOAD_INTERVAL).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "configuration bootstrap failed");
                return ExitCode::from(e.exit_code() as u8);
            }
        };

    let engine = Engine::assemble(store, handle, loader, system_clock()).await;
    match engine.run().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!(error = %e, "engine failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Coverage report for the backfill operator. Bar writes belong to the
/// external updater; this only reads, so it can run next to a live engine.
async fn report_coverage(store: SharedStore, symbol: &str, from: &str, to: &str) -> ExitCode {
    let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d");
    let (from_date, to_date) = match (parse(from), parse(to)) {
        (Ok(f), Ok(t)) if f < t => (f, t),
        (Ok(_), Ok(_)) => {
            error!("backfill: <from> must be before <to>");
            return ExitCode::from(1);
        }
        _ => {
            error!("backfill: dates must be YYYY-MM-DD");
            return ExitCode::from(1);
        }
    };

    let from_ts = Utc.from_utc_datetime(&from_date.and_hms_opt(0, 0, 0).unwrap());
    let to_ts = Utc.from_utc_datetime(&to_date.and_hms_opt(0, 0, 0).unwrap());

    let fetcher = HybridDataFetcher::new(store, system_clock());
    let bars = match fetcher.get_slice(symbol, Timeframe::D1, from_ts, to_ts).await {
        Ok(bars) => bars,
        Err(e) => {
            error!(error = %e, "coverage query failed");
            return ExitCode::from(2);
        }
    };

    let expected = (to_date - from_date).num_days();
    println!(
        "{}: {} of {} daily bars present between {} and {}",
        symbol,
        bars.len(),
        expected,
        from_date,
        to_date
    );

    let have: std::collections::HashSet<NaiveDate> =
        bars.iter().map(|b| b.timestamp.date_naive()).collect();
    let mut gaps = Vec::new();
    let mut day = from_date;
    while day < to_date {
        if !have.contains(&day) {
            gaps.push(day);
        }
        day = day.succ_opt().unwrap();
    }
    if gaps.is_empty() {
        println!("no gaps; nothing to backfill");
    } else {
        println!("{} missing days (external updater owns the writes):", gaps.len());
        for day in gaps {
            println!("  {}", day);
        }
    }
    ExitCode::SUCCESS
}

async fn reset_positions(store: SharedStore, config_source: ConfigSource) -> ExitCode {
    let (_loader, handle) =
        match ConfigLoader::bootstrap(config_source, store.clone(), CONFIG_RELOAD_INTERVAL).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "configuration bootstrap failed");
                return ExitCode::from(e.exit_code() as u8);
            }
        };
    let config = handle.snapshot().await;

    let clock = system_clock();
    let fetcher = Arc::new(HybridDataFetcher::new(store.clone(), clock.clone()));
    let trader = PaperTrader::new(
        store,
        fetcher,
        clock,
        config.global_settings.initial_balance_usd,
    );

    match trader.recover().await {
        Ok(0) => {
            println!("no open positions");
            return ExitCode::SUCCESS;
        }
        Ok(n) => info!(open = n, "closing all open positions"),
        Err(e) => {
            error!(error = %e, "recovery failed");
            return ExitCode::from(2);
        }
    }

    let closed = trader.close_all(&config).await;
    for trade in &closed {
        println!(
            "closed {} ({}) pnl {:.2}",
            trade.symbol, trade.exit_reason, trade.pnl
        );
    }
    println!("{} positions closed", closed.len());
    let remaining = trader.status().open_positions;
    if remaining > 0 {
        error!(remaining, "some positions could not be closed");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
