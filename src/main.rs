//! aft-sim - drive the AFT engine against simulated collaborators
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│  Store   │───▶│  Engine  │───▶│ Sim bank │
//! │  (YAML)  │    │  (file)  │    │ (startup)│    │ + wallet │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `aft-sim [--env <name>]` (reads `config/<name>.yaml`, default `dev`)

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use aft_engine::aft::types::{TransferCode, TransferData, TransferType};
use aft_engine::config::AppConfig;
use aft_engine::logging::init_logging;
use aft_engine::sim::SimRig;
use aft_engine::{AftEngine, EventBus, FileStore, TransferAmounts};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--env" || a == "-e")
        .and_then(|i| args.get(i + 1).cloned())
        .unwrap_or_else(|| "dev".to_string())
}

fn request(
    engine: &AftEngine,
    id: &str,
    transfer_type: TransferType,
    amounts: TransferAmounts,
    asset_number: u32,
) -> TransferData {
    let mut data = TransferData::new(id, transfer_type, TransferCode::PartialAllowed, amounts);
    data.asset_number = asset_number;
    engine.transfer(data)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for {env}"))?;
    let _guards = init_logging(&config);
    info!(env = %env, data_dir = %config.data_dir, "aft-sim starting");

    let store = Arc::new(
        FileStore::open(&config.data_dir)
            .with_context(|| format!("opening store at {}", config.data_dir))?,
    );
    let rig = SimRig::new(TransferAmounts::ZERO);
    let asset_number = config.aft.asset_number;
    let engine = AftEngine::new(config.aft, store, rig.collaborators(), EventBus::default())
        .context("building AFT engine")?;

    engine.startup();
    // recovery may have queued a re-delivery for an interrupted transfer
    rig.wallet.redeliver(engine.transfer_off().as_ref());
    rig.wallet.redeliver(engine.transfer_on().as_ref());

    let stamp = chrono::Utc::now().format("%H%M%S").to_string();

    let on = request(
        &engine,
        &format!("SIM-ON-{stamp}"),
        TransferType::InHouseToGamingMachine,
        TransferAmounts::new(25_000, 0, 5_000),
        asset_number,
    );
    info!(status = %on.status, "Transfer-on accepted");
    rig.wallet.process_next(engine.transfer_on().as_ref(), &rig.bank);
    let on = engine.current_transfer();
    info!(record = %serde_json::to_string(&on)?, "Transfer-on finished");
    engine.acknowledge(&on.transaction_id);

    let off = request(
        &engine,
        &format!("SIM-OFF-{stamp}"),
        TransferType::InHouseToHost,
        TransferAmounts::new(40_000, 0, 5_000),
        asset_number,
    );
    info!(status = %off.status, "Transfer-off accepted");
    rig.wallet.process_next(engine.transfer_off().as_ref(), &rig.bank);
    let off = engine.current_transfer();
    info!(record = %serde_json::to_string(&off)?, "Transfer-off finished");
    engine.acknowledge(&off.transaction_id);

    let meters = engine.meters()?;
    info!(meters = %serde_json::to_string(&meters)?, "Lifetime meters");

    for event in engine.events().drain() {
        info!(event = ?event, "Domain event");
    }
    Ok(())
}
