//! CLI command implementations

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::realtime::{
    ChangeEvent, InMemoryTransport, NetworkStatus, SyncCallbacks, SyncConfig, SyncEngine,
};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Product row the simulation works on
const SIMULATED_PRODUCT: &str = "p1";

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let result = run_command(cli.command);
    if let Err(e) = &result {
        write_error(e)?;
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::CheckConfig { config } => check_config(&config),
        Command::Simulate { config } => simulate(config.as_deref()),
    }
}

/// Load, validate and print a config file
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = SyncConfig::load(config_path)?;
    write_response(serde_json::to_value(&config)?)
}

/// Run the in-memory scenario and print the final status and metrics
pub fn simulate(config_path: Option<&Path>) -> CliResult<()> {
    let config = match config_path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    config.severity()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(run_simulation(config))?;
    write_response(report)
}

/// Drive one engine through initialize, subscribe, optimistic write,
/// offline/online and reconnect against an in-memory backend.
pub async fn run_simulation(config: SyncConfig) -> CliResult<Value> {
    let transport = Arc::new(InMemoryTransport::new());
    transport.set_echo_writes(true);

    let table = config.products_table.clone();
    let stock_column = config.stock_column.clone();
    transport.set_row(&table, SIMULATED_PRODUCT, product_row(&config, 5));

    let engine = SyncEngine::new(transport.clone(), config.clone());

    let stock_updates = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (stock_sink, error_sink) = (Arc::clone(&stock_updates), Arc::clone(&errors));
    engine
        .initialize(
            SyncCallbacks::new()
                .on_product_stock_update(move |_| {
                    stock_sink.fetch_add(1, Ordering::Relaxed);
                })
                .on_error(move |_| {
                    error_sink.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .await?;

    let deliveries = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&deliveries);
    engine
        .subscribe_to_product_stock(SIMULATED_PRODUCT, move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        })
        .await?;

    let mut update = Map::new();
    update.insert(stock_column.clone(), json!(4));
    engine
        .optimistic_update(&table, SIMULATED_PRODUCT, update, |_| {})
        .await?;

    engine.handle_network_status(NetworkStatus::Offline).await;
    engine.handle_network_status(NetworkStatus::Online).await;
    transport.push(ChangeEvent::update(
        table.as_str(),
        SIMULATED_PRODUCT,
        product_row(&config, 4),
        product_row(&config, 3),
    ));

    engine.reconnect().await;
    transport.push(ChangeEvent::update(
        table.as_str(),
        SIMULATED_PRODUCT,
        product_row(&config, 3),
        product_row(&config, 2),
    ));

    let status = engine.get_sync_status();
    if !status.is_connected {
        return Err(CliError::Simulation(format!(
            "engine ended disconnected: {}",
            status.error.unwrap_or_default()
        )));
    }

    Ok(json!({
        "status": status,
        "metrics": engine.metrics(),
        "subscription_deliveries": deliveries.load(Ordering::Relaxed),
        "stock_updates": stock_updates.load(Ordering::Relaxed),
        "errors": errors.load(Ordering::Relaxed),
        "row": transport.row(&table, SIMULATED_PRODUCT),
    }))
}

fn product_row(config: &SyncConfig, stock: i64) -> Value {
    let mut row = Map::new();
    row.insert(config.row_id_column.clone(), json!(SIMULATED_PRODUCT));
    row.insert(config.stock_column.clone(), json!(stock));
    Value::Object(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_simulation_report() {
        let report = run_simulation(SyncConfig::default()).await.unwrap();

        assert_eq!(report["status"]["isConnected"], true);
        assert_eq!(report["status"]["isInitialized"], true);
        assert_eq!(report["errors"], 0);
        // Echo of the optimistic write plus two remote updates
        assert_eq!(report["subscription_deliveries"], 3);
        assert_eq!(report["metrics"]["reconnect_attempts"], 2);
        assert_eq!(report["metrics"]["push_confirmations"], 1);
        assert_eq!(report["row"]["stock_quantity"], 4);
    }

    #[tokio::test]
    async fn test_simulation_with_renamed_schema() {
        let config = SyncConfig {
            products_table: "catalog_items".into(),
            stock_column: "on_hand".into(),
            ..Default::default()
        };
        let report = run_simulation(config).await.unwrap();
        assert_eq!(report["status"]["isConnected"], true);
        assert_eq!(report["row"]["on_hand"], 4);
    }

    #[test]
    fn test_check_config_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"write_timeout_ms": 0}}"#).unwrap();

        let err = check_config(file.path()).unwrap_err();
        assert_eq!(err.code(), "SYNC_CLI_CONFIG_ERROR");
    }
}
