use std::error::Error;
use std::sync::Arc;

use gattlink::bluez::BluezGateway;
use gattlink::btuuid::{characteristics, services};
use gattlink::{Characteristic, Device, DeviceManager, DeviceObserver, MacAddress, ManagerConfig};
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};

const MAX_CONNECT_ATTEMPTS: u32 = 3;

struct FirmwareReader {
    attempts: u32,
}

impl FirmwareReader {
    fn finish(device: &mut Device) {
        if device.disconnect().is_err() {
            device.dispatcher().stop();
        }
    }
}

impl DeviceObserver for FirmwareReader {
    fn connect_succeeded(&mut self, device: &mut Device) {
        info!("connected to {}, waiting for services", device);
    }

    fn connect_failed(&mut self, device: &mut Device, error: gattlink::Error) {
        if error.is_transient() && self.attempts < MAX_CONNECT_ATTEMPTS {
            self.attempts += 1;
            warn!("{}, retrying ({}/{})", error, self.attempts, MAX_CONNECT_ATTEMPTS);
            if device.connect().is_ok() {
                return;
            }
        }
        error!("could not connect to {}: {}", device, error);
        device.dispatcher().stop();
    }

    fn services_resolved(&mut self, device: &mut Device) {
        let firmware = device
            .characteristic(services::DEVICE_INFORMATION, characteristics::FIRMWARE_REVISION_STRING)
            .cloned();
        match firmware {
            Some(firmware) => {
                if let Err(err) = firmware.read_value() {
                    error!("reading firmware revision: {}", err);
                    Self::finish(device);
                }
            }
            None => {
                warn!("{} has no firmware revision characteristic", device);
                Self::finish(device);
            }
        }
    }

    fn services_resolution_failed(&mut self, device: &mut Device, error: gattlink::Error) {
        error!("{}: {}", device, error);
    }

    fn characteristic_value_updated(&mut self, device: &mut Device, characteristic: &Characteristic, value: &[u8]) {
        if characteristic.uuid() == characteristics::FIRMWARE_REVISION_STRING {
            info!("firmware revision of {}: {}", device, String::from_utf8_lossy(value));
            Self::finish(device);
        }
    }

    fn characteristic_read_value_failed(
        &mut self,
        device: &mut Device,
        _characteristic: &Characteristic,
        error: gattlink::Error,
    ) {
        error!("reading firmware revision: {}", error);
        Self::finish(device);
    }

    fn disconnect_succeeded(&mut self, device: &mut Device) {
        info!("disconnected from {}", device);
        device.dispatcher().stop();
    }

    fn disconnect_failed(&mut self, device: &mut Device, error: gattlink::Error) {
        warn!("disconnecting from {}: {}", device, error);
        device.dispatcher().stop();
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

    let address: MacAddress = std::env::args()
        .nth(1)
        .ok_or("usage: read_firmware_version <MAC address> [adapter]")?
        .parse()?;
    let adapter_name = std::env::args().nth(2).unwrap_or_else(|| "hci0".to_string());

    let gateway = Arc::new(BluezGateway::new(&adapter_name).await?);
    let mut manager = DeviceManager::new(gateway, ManagerConfig::new(adapter_name), ()).await?;

    let dispatcher = manager.dispatcher().clone();
    dispatcher.invoke(move |manager| {
        let device = manager.add_device(address, FirmwareReader { attempts: 0 });
        if let Err(err) = device.connect() {
            error!("connecting to {}: {}", address, err);
            device.dispatcher().stop();
        }
    });
    manager.run().await?;
    manager.close().await?;
    Ok(())
}
