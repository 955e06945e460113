//! Paper trading engine - command-line entry point
//!
//! Two subcommands:
//! - `run`: start the monitoring loop against live market data until Ctrl+C
//! - `order`: place a single order against the configured portfolio and exit

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use paper_trading_engine::{
    BinanceTickerProvider, OrderParams, OrderType, PaperTradingConfig, PaperTradingEngine, Side,
    SqliteStore, Symbol,
};

#[derive(Parser, Debug)]
#[command(name = "paper-trading-engine")]
#[command(about = "Universal paper-trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitoring loop until interrupted
    Run {
        /// Path to a PaperTradingConfig JSON file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// SQLite database path
        #[arg(long, default_value = "paper_trading.db")]
        db: String,
    },

    /// Place a single order and print the result
    Order {
        #[arg(short, long, default_value = "config.json")]
        config: String,

        #[arg(long, default_value = "paper_trading.db")]
        db: String,

        /// Trading pair, e.g. BTCUSDT
        #[arg(long)]
        symbol: String,

        /// buy or sell
        #[arg(long)]
        side: String,

        /// market, limit, stop, stop_limit, trailing_stop or iceberg
        #[arg(long, default_value = "market")]
        order_type: String,

        #[arg(long)]
        quantity: Decimal,

        /// Required for limit/stop_limit orders
        #[arg(long)]
        price: Option<Decimal>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    let console_layer = tracing_subscriber::fmt::layer().with_target(true).with_line_number(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("logging initialized, writing to {}", log_path.display());
    Ok(())
}

fn parse_side(s: &str) -> Result<Side> {
    match s.to_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => anyhow::bail!("unknown side {other:?}, expected buy or sell"),
    }
}

fn parse_order_type(s: &str) -> Result<OrderType> {
    match s.to_lowercase().as_str() {
        "market" => Ok(OrderType::Market),
        "limit" => Ok(OrderType::Limit),
        "stop" => Ok(OrderType::Stop),
        "stop_limit" => Ok(OrderType::StopLimit),
        "trailing_stop" => Ok(OrderType::TrailingStop),
        "iceberg" => Ok(OrderType::Iceberg),
        other => anyhow::bail!("unknown order type {other:?}"),
    }
}

fn load_config(path: &str) -> Result<PaperTradingConfig> {
    match PaperTradingConfig::from_file(path) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            warn!("could not load config from {path} ({e}), using defaults");
            Ok(PaperTradingConfig::default())
        }
    }
}

async fn run_monitoring_loop(config: String, db: String) -> Result<()> {
    let config = load_config(&config)?;
    let store = Arc::new(SqliteStore::new(&db).context("failed to open sqlite store")?);
    let engine = Arc::new(
        PaperTradingEngine::new(config.clone(), BinanceTickerProvider::new(), store)
            .context("failed to initialize paper trading engine")?,
    );

    info!(portfolio = %config.portfolio_name, asset_class = ?config.asset_class, "paper trading engine started");

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down");
                shutdown_flag_clone.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!("failed to install ctrl-c handler: {e}"),
        }
    });

    let mut tick = interval(Duration::from_millis(config.price_poll_interval_ms));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
                let trades = engine.monitor_tick().await;
                if !trades.is_empty() {
                    info!(count = trades.len(), "monitoring pass produced fills");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("paper trading engine stopped");
    Ok(())
}

async fn place_one_order(
    config: String,
    db: String,
    symbol: String,
    side: String,
    order_type: String,
    quantity: Decimal,
    price: Option<Decimal>,
) -> Result<()> {
    let config = load_config(&config)?;
    let store = Arc::new(SqliteStore::new(&db).context("failed to open sqlite store")?);
    let engine = PaperTradingEngine::new(config, BinanceTickerProvider::new(), store)
        .context("failed to initialize paper trading engine")?;

    let side = parse_side(&side)?;
    let order_type = parse_order_type(&order_type)?;
    let params = OrderParams { price, ..Default::default() };

    let result = engine
        .place_order(Symbol::new(symbol), side, order_type, quantity, params)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    info!(
        order_id = %result.order.id,
        status = ?result.order.status,
        fills = result.trades.len(),
        available_balance = %result.available_balance,
        "order placed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Order { .. } => "order",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run { config, db } => run_monitoring_loop(config, db).await,
        Commands::Order {
            config,
            db,
            symbol,
            side,
            order_type,
            quantity,
            price,
        } => place_one_order(config, db, symbol, side, order_type, quantity, price).await,
    }
}
