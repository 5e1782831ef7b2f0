use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use gattlink::bluez::BluezGateway;
use gattlink::{Device, DeviceManager, ManagerConfig, ManagerObserver};
use tracing::info;
use tracing::metadata::LevelFilter;

struct Scanner;

impl ManagerObserver for Scanner {
    fn device_discovered(&mut self, device: &mut Device) {
        info!(
            "discovered {} name={:?} rssi={:?} services={:?}",
            device,
            device.name(),
            device.rssi(),
            device.advertised_uuids()
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let adapter_name = std::env::args().nth(1).unwrap_or_else(|| "hci0".to_string());
    let gateway = Arc::new(BluezGateway::new(&adapter_name).await?);
    let mut manager = DeviceManager::new(gateway, ManagerConfig::new(adapter_name), Scanner).await?;

    manager.start_discovery(&[]).await?;
    let dispatcher = manager.dispatcher().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        dispatcher.stop();
    });
    manager.run().await?;

    info!("{} devices known", manager.devices().len());
    manager.close().await?;
    Ok(())
}
