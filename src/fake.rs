//! In-memory GATT transport used by the unit tests

use crate::registry::{short_id_to_full_id, ScanFilter};
use crate::transport::{
    BleCentral, GattCharacteristic, GattDevice, GattService, NotificationStream,
};
use crate::types::{Result, TrainerError};
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted characteristic
#[derive(Default)]
pub struct FakeCharacteristic {
    uuid: String,
    read_value: Mutex<Option<Vec<u8>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    active: Arc<AtomicUsize>,
    notify_calls: AtomicUsize,
    auto_respond: AtomicBool,
    fail_read: AtomicBool,
    fail_write: AtomicBool,
    fail_notify: AtomicBool,
}

impl FakeCharacteristic {
    pub fn with_uuid(uuid: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            ..Default::default()
        })
    }

    pub fn notifying(short_id: u16) -> Arc<Self> {
        Self::with_uuid(short_id_to_full_id(short_id))
    }

    pub fn readable(short_id: u16, value: Vec<u8>) -> Arc<Self> {
        let characteristic = Self::notifying(short_id);
        *characteristic.read_value.lock().unwrap() = Some(value);
        characteristic
    }

    /// Control point that acknowledges every write with success
    pub fn control_point(short_id: u16) -> Arc<Self> {
        let characteristic = Self::notifying(short_id);
        characteristic.auto_respond.store(true, Ordering::SeqCst);
        characteristic
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.auto_respond.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_read(&self) {
        self.fail_read.store(true, Ordering::SeqCst);
    }

    pub fn fail_write(&self) {
        self.fail_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_notify(&self) {
        self.fail_notify.store(true, Ordering::SeqCst);
    }

    /// Deliver a notification to every enabled stream
    pub fn push(&self, value: Vec<u8>) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.unbounded_send(value.clone()).is_ok());
    }

    /// End every notification stream, as a disconnect would
    pub fn end_notifications(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet dropped
    pub fn active_notifications(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GattCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(TrainerError::Transport("read failed".into()));
        }
        self.read_value
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TrainerError::Transport("read not permitted".into()))
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(TrainerError::Transport("write failed".into()));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        if self.auto_respond.load(Ordering::SeqCst) {
            if let Some(op_code) = data.first() {
                self.push(vec![0x80, *op_code, 0x01]);
            }
        }
        Ok(())
    }

    async fn notify(&self) -> Result<NotificationStream> {
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(TrainerError::Transport("notify not permitted".into()));
        }
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);

        Ok(Box::pin(rx.map(move |value| {
            let _guard = &guard;
            value
        })))
    }
}

pub struct FakeService {
    uuid: String,
    characteristics: Vec<Arc<FakeCharacteristic>>,
}

impl FakeService {
    pub fn new(short_id: u16, characteristics: Vec<Arc<FakeCharacteristic>>) -> Arc<Self> {
        Self::with_uuid(short_id_to_full_id(short_id), characteristics)
    }

    pub fn with_uuid(
        uuid: impl Into<String>,
        characteristics: Vec<Arc<FakeCharacteristic>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            characteristics,
        })
    }
}

#[async_trait::async_trait]
impl GattService for FakeService {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>> {
        Ok(self
            .characteristics
            .iter()
            .map(|characteristic| Arc::clone(characteristic) as Arc<dyn GattCharacteristic>)
            .collect())
    }
}

pub struct FakeDevice {
    id: String,
    name: String,
    services: Vec<Arc<FakeService>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
}

impl FakeDevice {
    pub fn new(id: &str, name: &str, services: Vec<Arc<FakeService>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            name: name.to_string(),
            services,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
        })
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GattDevice for FakeDevice {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TrainerError::Transport("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn primary_services(&self) -> Result<Vec<Arc<dyn GattService>>> {
        Ok(self
            .services
            .iter()
            .map(|service| Arc::clone(service) as Arc<dyn GattService>)
            .collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Central that hands out queued devices in order
#[derive(Default)]
pub struct FakeCentral {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    filters: Mutex<Vec<ScanFilter>>,
}

impl FakeCentral {
    pub fn new(devices: Vec<Arc<FakeDevice>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            filters: Mutex::new(Vec::new()),
        })
    }

    pub fn last_filters(&self) -> Vec<ScanFilter> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl BleCentral for FakeCentral {
    async fn request_device(&self, filters: &[ScanFilter]) -> Result<Arc<dyn GattDevice>> {
        *self.filters.lock().unwrap() = filters.to_vec();
        let mut devices = self.devices.lock().unwrap();
        if devices.is_empty() {
            return Err(TrainerError::DeviceNotSelected);
        }
        Ok(devices.remove(0) as Arc<dyn GattDevice>)
    }
}
