use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use automata_link::client::AutomataClientBuilder;
use automata_link::config::LinkConfig;
use automata_link::http_api::HttpBackend;
use automata_link::identity::{format_mac, Attribute};
use automata_link::store::FileStore;
use automata_link::transport::{HostNetwork, LogLink, NullUpdateChannel, SystemClockSync};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = LinkConfig::load_or_default();
    info!(
        "Starting connectivity layer for '{}' against {}",
        config.device_name,
        config.backend.api_base()
    );

    let store_path = FileStore::default_path()
        .ok_or_else(|| eyre!("No platform config directory available"))?;
    let kv = Arc::new(FileStore::open(store_path).map_err(|e| eyre!("Store open failed: {}", e))?);

    let api = Arc::new(
        HttpBackend::new(config.backend.api_base(), config.timing.http_timeout())
            .map_err(|e| eyre!("HTTP client setup failed: {}", e))?,
    );

    // Demo wiring: OS-managed network, log-only pub/sub link. Real devices
    // plug their radio and broker transport in here.
    let network = Arc::new(HostNetwork::new(format_mac(&[0x02, 0, 0, 0, 0, 0x01])));
    let link = Arc::new(LogLink::new());
    let (_event_tx, event_rx) = mpsc::channel(100);

    let (interval_tx, mut interval_rx) = mpsc::channel(8);
    let mut client = AutomataClientBuilder::new(
        config,
        network,
        link,
        event_rx,
        api,
        kv,
        Arc::new(SystemClockSync),
        Arc::new(NullUpdateChannel),
    )
    .add_attribute(Attribute::new("temp", "Temperature", "°C", "INFO"))
    .add_attribute(Attribute::new("hum", "Humidity", "%", "INFO"))
    .on_action(Arc::new(|action| {
        info!("Action received: {}", action.raw);
    }))
    .on_interval(Arc::new(move || {
        let _ = interval_tx.try_send(());
    }))
    .build()
    .await;

    let telemetry = client.telemetry();
    let restart = client.restart_handle();

    loop {
        tokio::select! {
            _ = restart.triggered() => {
                warn!("Restart requested, shutting down");
                break;
            }
            Some(()) = interval_rx.recv() => {
                // demo readings; a real integration samples its sensors here
                telemetry
                    .send_live(&json!({"temp": 21.5, "hum": 48.0}))
                    .await;
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                client.tick().await;
            }
        }
    }

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
