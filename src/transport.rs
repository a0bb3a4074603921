//! GATT transport abstraction
//!
//! The session layer only talks to these traits. The BlueZ backend in
//! [`crate::bluez`] implements them on top of `bluer`; tests use in-memory
//! fakes.

use crate::registry::ScanFilter;
use crate::types::Result;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of raw notification payloads
///
/// Dropping the stream disables notifications on the characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Entry point for device selection
#[async_trait::async_trait]
pub trait BleCentral: Send + Sync {
    /// Let the user (or the backend) pick a device matching any filter.
    ///
    /// Fails with `DeviceNotSelected` if no device is chosen.
    async fn request_device(&self, filters: &[ScanFilter]) -> Result<Arc<dyn GattDevice>>;
}

/// A selected peripheral
#[async_trait::async_trait]
pub trait GattDevice: Send + Sync {
    /// Stable identifier, e.g. the Bluetooth address
    fn id(&self) -> String;

    /// Advertised name
    fn name(&self) -> String;

    async fn connect(&self) -> Result<()>;

    async fn primary_services(&self) -> Result<Vec<Arc<dyn GattService>>>;

    async fn disconnect(&self) -> Result<()>;
}

/// A primary service exposed by a connected device
#[async_trait::async_trait]
pub trait GattService: Send + Sync {
    /// Full 128-bit UUID in lowercase hyphenated form
    fn uuid(&self) -> String;

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>>;
}

/// A characteristic of a primary service
#[async_trait::async_trait]
pub trait GattCharacteristic: Send + Sync {
    /// Full 128-bit UUID in lowercase hyphenated form
    fn uuid(&self) -> String;

    async fn read(&self) -> Result<Vec<u8>>;

    /// Write with response
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Enable notifications and return the stream of payloads
    async fn notify(&self) -> Result<NotificationStream>;
}
