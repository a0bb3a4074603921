//! BlueZ transport backend
//!
//! Implements the [`crate::transport`] traits with `bluer`. Device selection
//! scans until a device advertising one of the requested services appears,
//! or until the device with a given address is seen.

use crate::registry::ScanFilter;
use crate::transport::{
    BleCentral, GattCharacteristic, GattDevice, GattService, NotificationStream,
};
use crate::types::{Result, TrainerError};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// How many times to poll for resolved GATT services after connecting
const SERVICE_RESOLVE_ATTEMPTS: u32 = 20;

impl From<bluer::Error> for TrainerError {
    fn from(e: bluer::Error) -> Self {
        TrainerError::Transport(e.to_string())
    }
}

/// Central backed by the default BlueZ adapter
pub struct BluezCentral {
    _session: Session,
    adapter: Adapter,
    scan_timeout: Duration,
    target: Option<Address>,
}

impl BluezCentral {
    /// Open the default adapter, powering it on if needed
    ///
    /// With `target` set, selection waits for that address instead of
    /// matching advertised services.
    pub async fn new(scan_timeout: Duration, target: Option<&str>) -> Result<Self> {
        let target = target
            .map(|mac| {
                mac.parse::<Address>().map_err(|_| {
                    TrainerError::Transport(format!("Invalid MAC address: {}", mac))
                })
            })
            .transpose()?;

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        debug!("Using adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Bluetooth adapter is off, powering it on");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            _session: session,
            adapter,
            scan_timeout,
            target,
        })
    }

    async fn find_device(&self, wanted: &[String]) -> Result<Device> {
        let mut events = Box::pin(self.adapter.discover_devices().await?);

        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };

            if let Some(target) = self.target {
                if address == target {
                    return Ok(self.adapter.device(address)?);
                }
                continue;
            }

            let device = self.adapter.device(address)?;
            let uuids = device.uuids().await?.unwrap_or_default();
            if uuids.iter().any(|uuid| wanted.contains(&uuid.to_string())) {
                return Ok(device);
            }
            debug!("Ignoring {} (no matching services)", address);
        }

        Err(TrainerError::DeviceNotSelected)
    }
}

#[async_trait::async_trait]
impl BleCentral for BluezCentral {
    async fn request_device(&self, filters: &[ScanFilter]) -> Result<Arc<dyn GattDevice>> {
        let wanted: Vec<String> = filters.iter().flat_map(ScanFilter::full_ids).collect();
        info!("Scanning for up to {:?}", self.scan_timeout);

        let device = match tokio::time::timeout(self.scan_timeout, self.find_device(&wanted)).await
        {
            Ok(device) => device?,
            Err(_) => {
                warn!("No matching device found within {:?}", self.scan_timeout);
                return Err(TrainerError::DeviceNotSelected);
            }
        };

        let name = device.name().await?.unwrap_or_default();
        Ok(Arc::new(BluezDevice {
            id: device.address().to_string(),
            name,
            device,
        }))
    }
}

struct BluezDevice {
    id: String,
    name: String,
    device: Device,
}

#[async_trait::async_trait]
impl GattDevice for BluezDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        if !self.device.is_connected().await? {
            info!("Connecting to {}", self.id);
            self.device.connect().await?;
        }

        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            if self.device.is_services_resolved().await? {
                return Ok(());
            }
            sleep(Duration::from_millis(500)).await;
        }
        Err(TrainerError::Transport(format!(
            "{}: timed out waiting for GATT services",
            self.id
        )))
    }

    async fn primary_services(&self) -> Result<Vec<Arc<dyn GattService>>> {
        let mut services: Vec<Arc<dyn GattService>> = Vec::new();
        for service in self.device.services().await? {
            if !service.primary().await? {
                continue;
            }
            let uuid = service.uuid().await?.to_string();
            services.push(Arc::new(BluezService { uuid, service }));
        }
        Ok(services)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.device.is_connected().await? {
            info!("Disconnecting from {}", self.id);
            self.device.disconnect().await?;
        }
        Ok(())
    }
}

struct BluezService {
    uuid: String,
    service: Service,
}

#[async_trait::async_trait]
impl GattService for BluezService {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>> {
        let mut characteristics: Vec<Arc<dyn GattCharacteristic>> = Vec::new();
        for characteristic in self.service.characteristics().await? {
            let uuid = characteristic.uuid().await?.to_string();
            characteristics.push(Arc::new(BluezCharacteristic {
                uuid,
                characteristic,
            }));
        }
        Ok(characteristics)
    }
}

struct BluezCharacteristic {
    uuid: String,
    characteristic: Characteristic,
}

#[async_trait::async_trait]
impl GattCharacteristic for BluezCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.characteristic.read().await?)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut request = CharacteristicWriteRequest::default();
        request.op_type = WriteOp::Request;
        self.characteristic.write_ext(data, &request).await?;
        Ok(())
    }

    async fn notify(&self) -> Result<NotificationStream> {
        let stream = self.characteristic.notify().await?;
        Ok(Box::pin(stream))
    }
}
