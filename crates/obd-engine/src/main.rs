//! OBD Diagnostics - Command Line Entry Point
//!
//! Usage: `obd-diag [config-file]`

use anyhow::Context;
use obd_engine::{
    init_logging, DiagnosticEngine, EngineConfig, SerialTransport, SimulatedTransport, Transport,
    TransportKind,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshots printed before polling stops
const POLL_CYCLES: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1);
    let config = EngineConfig::load(path.as_deref()).context("loading configuration")?;
    init_logging(&config.logging)?;

    info!("=== OBD Diagnostics v{} ===", env!("CARGO_PKG_VERSION"));

    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Simulated => Arc::new(SimulatedTransport::default()),
        TransportKind::Serial => Arc::new(SerialTransport::new(config.transport.baud_rate)),
    };
    let engine = DiagnosticEngine::new(transport, config.clone());

    if !engine.is_transport_available().await {
        anyhow::bail!("{:?} transport is not available", config.transport.kind);
    }

    let device_id = match &config.scan.device_id {
        Some(id) => id.clone(),
        None => {
            let devices = engine.scan(config.scan.duration()).await?;
            for device in &devices {
                info!("Found {} ({}) rssi {:?}", device.name(), device.id(), device.rssi());
            }
            devices
                .first()
                .map(|d| d.id().to_string())
                .context("no adapters found")?
        }
    };

    let session = engine.connect(&device_id).await?;
    println!("{}", serde_json::to_string_pretty(&session)?);

    let result = report(&engine).await;
    engine.disconnect().await;
    result
}

async fn report(engine: &DiagnosticEngine) -> anyhow::Result<()> {
    let snapshot = engine.read_snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let codes: Vec<_> = engine
        .read_trouble_codes()
        .await?
        .iter()
        .map(|c| {
            json!({
                "code": c.code,
                "description": c.description,
                "severity": c.severity(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&codes)?);

    let mut snapshots = engine.start_polling().await?;
    for _ in 0..POLL_CYCLES {
        match snapshots.recv().await {
            Some(snapshot) => println!("{}", serde_json::to_string(&snapshot)?),
            None => {
                warn!("Polling ended early");
                break;
            }
        }
    }
    engine.stop_polling().await?;

    Ok(())
}
