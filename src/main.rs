use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use settlement_queue::application::engine::SettlementEngine;
use settlement_queue::config::QueueConfig;
use settlement_queue::domain::ports::{BatchStoreRef, SubmissionGatewayRef, TransactionStoreRef};
use settlement_queue::infrastructure::in_memory::{InMemoryBatchStore, InMemoryTransactionStore};
#[cfg(feature = "storage-rocksdb")]
use settlement_queue::infrastructure::rocksdb::RocksDBStore;
use settlement_queue::infrastructure::simulated_gateway::SimulatedGateway;
use settlement_queue::interfaces::csv::report_writer::ReportWriter;
use settlement_queue::interfaces::csv::transaction_reader::TransactionReader;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input CSV of transaction requests
    input: PathBuf,

    /// JSON queue configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Network congestion factor applied to every fee quote
    #[arg(long, default_value = "0")]
    network_load: Decimal,

    /// Destination address the simulated ledger rejects (repeatable)
    #[arg(long = "reject-address")]
    reject_addresses: Vec<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn open_stores(db_path: Option<PathBuf>) -> Result<(TransactionStoreRef, BatchStoreRef)> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(db_path) = db_path {
        let store = RocksDBStore::open(db_path).into_diagnostic()?;
        info!("using RocksDB storage");
        return Ok((Arc::new(store.clone()), Arc::new(store)));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }

    Ok((
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemoryBatchStore::new()),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => QueueConfig::from_path(path).into_diagnostic()?,
        None => QueueConfig::default(),
    };
    let (transactions, batches) = open_stores(cli.db_path)?;
    let gateway: SubmissionGatewayRef =
        Arc::new(SimulatedGateway::new().rejecting(cli.reject_addresses));

    let engine = SettlementEngine::new(config, transactions, batches, gateway);
    engine.set_network_load(cli.network_load).await;

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = TransactionReader::new(file);
    for request in reader.requests(Utc::now()) {
        match request {
            Ok(request) => {
                if let Err(e) = engine.enqueue(request).await {
                    warn!(error = %e, "Error enqueueing transaction");
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading transaction");
            }
        }
    }

    engine.drain_until_idle().await.into_diagnostic()?;

    let stats = engine.get_stats().await.into_diagnostic()?;
    info!(
        total = stats.total_transactions,
        batches = stats.total_batches,
        fee_savings = %stats.total_fee_savings,
        average_processing_ms = ?stats.average_processing_ms,
        "queue drained"
    );

    let report = engine.all_transactions().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_transactions(&report).into_diagnostic()?;

    Ok(())
}
