//! Device session
//!
//! Drives one device from selection to an active session:
//!
//! 1. `Discovering`: ask the central for a device matching the registry's
//!    scan filters, then connect.
//! 2. `ClassifyingServices`: enumerate primary services and register the
//!    device. Unknown services are kept in the service list but not used.
//! 3. `ClassifyingCharacteristics`: look up every characteristic of every
//!    known service concurrently and attach it by role. Reads are decoded
//!    once, notifications are decoded as they arrive and writable
//!    characteristics get a [`CommandChannel`]. A failing characteristic is
//!    logged and skipped without affecting its siblings.
//! 4. `Active`: telemetry flows to the event sink until [`disconnect`] or drop.
//!
//! [`disconnect`]: DeviceSession::disconnect

use crate::codec::{decode_record, CommandInput};
use crate::command::CommandChannel;
use crate::config::SessionConfig;
use crate::notify::NotificationMux;
use crate::profiles::{FITNESS_MACHINE_CONTROL_POINT, SERVICES};
use crate::registry::{
    build_scan_filters, full_id_to_short_id, lookup_characteristic, lookup_service,
    CharacteristicDescriptor, CharacteristicRole, FieldLayout, ServiceDescriptor,
};
use crate::telemetry::{DeviceRecord, EventSink, FeatureDirectory, SessionEvent};
use crate::transport::{BleCentral, GattCharacteristic, GattDevice, GattService};
use crate::types::{Result, TrainerError};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Discovering,
    ClassifyingServices,
    ClassifyingCharacteristics,
    Active,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Discovering => write!(f, "Discovering"),
            SessionState::ClassifyingServices => write!(f, "Classifying Services"),
            SessionState::ClassifyingCharacteristics => write!(f, "Classifying Characteristics"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// A primary service found on the device
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub uuid: String,
    /// Registry entry, `None` for services this crate does not understand
    pub descriptor: Option<&'static ServiceDescriptor>,
}

/// State shared with the notification tasks
struct SessionShared {
    device_id: String,
    record: Mutex<DeviceRecord>,
    sink: Arc<dyn EventSink>,
    directory: Arc<FeatureDirectory>,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    ended: AtomicBool,
    live_streams: AtomicUsize,
}

impl SessionShared {
    /// Mark the session as over. Returns false if it already was.
    ///
    /// A retiring session hands its device id to a newer session, so its
    /// feature claims are kept and no `Disconnected` event is emitted.
    fn end(&self, retiring: bool) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("{}: ending session", self.device_id);
        // Waiting commands resolve as cancelled before their streams close
        self.shutdown.send_replace(true);
        transition(&self.state, &self.device_id, SessionState::Disconnected);
        if !retiring {
            self.directory.release(&self.device_id);
            self.sink.emit(SessionEvent::Disconnected {
                device_id: self.device_id.clone(),
            });
        }
        true
    }

    /// Called by a notification task whose stream has ended
    fn stream_ended(&self) {
        if self.live_streams.fetch_sub(1, Ordering::SeqCst) == 1
            && !self.ended.load(Ordering::SeqCst)
        {
            warn!("{}: every notification stream ended, link lost", self.device_id);
            self.end(false);
        }
    }

    /// Decode one payload and merge it into the device record
    async fn absorb(
        &self,
        descriptor: &CharacteristicDescriptor,
        layout: &[FieldLayout],
        payload: &[u8],
    ) {
        let decoded = match decode_record(layout, payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{}: {}: {}", self.device_id, descriptor.name, e);
                return;
            }
        };

        if decoded.is_empty() {
            return;
        }

        let mut record = self.record.lock().await;
        let outcome = record.merge(&decoded);

        for reading in outcome.readings {
            self.directory.claim(reading.feature, &self.device_id);
            self.sink.emit(SessionEvent::Telemetry {
                device_id: self.device_id.clone(),
                feature: reading.feature,
                value: reading.value,
                unit: reading.unit,
            });
        }

        if outcome.capabilities_changed {
            debug!(
                "{}: capabilities now {:?}",
                self.device_id, record.capabilities
            );
            self.sink.emit(SessionEvent::CapabilitiesChanged {
                device_id: self.device_id.clone(),
                capabilities: record.capabilities.clone(),
            });
        }
    }
}

/// How a characteristic ended up attached to the session
enum Attached {
    Read,
    Notify {
        mux: Arc<NotificationMux>,
        task: JoinHandle<()>,
    },
    Write {
        mux: Arc<NotificationMux>,
        channel: Arc<CommandChannel>,
    },
    Skipped,
}

/// An established connection to one device
pub struct DeviceSession {
    device: Arc<dyn GattDevice>,
    shared: Arc<SessionShared>,
    services: Vec<DiscoveredService>,
    channels: BTreeMap<u16, Arc<CommandChannel>>,
    muxes: Vec<Arc<NotificationMux>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceSession {
    /// Select, connect and classify a device
    ///
    /// Fails with `DeviceNotSelected` when no device is chosen, or with the
    /// transport error when connecting or enumerating services fails.
    /// Problems with individual characteristics never fail the session.
    pub async fn establish(
        central: &dyn BleCentral,
        config: &SessionConfig,
        sink: Arc<dyn EventSink>,
        directory: Arc<FeatureDirectory>,
    ) -> Result<Self> {
        let (state, _) = watch::channel(SessionState::Discovering);
        info!("Session state: {}", SessionState::Discovering);

        let filters = build_scan_filters(&SERVICES);
        let device = central.request_device(&filters).await?;
        let device_id = device.id();
        info!("Selected device {} ({})", device.name(), device_id);

        device.connect().await?;

        transition(&state, &device_id, SessionState::ClassifyingServices);
        let gatt_services = match device.primary_services().await {
            Ok(services) => services,
            Err(e) => {
                error!("{}: failed to enumerate services: {}", device_id, e);
                transition(&state, &device_id, SessionState::Disconnected);
                if let Err(e) = device.disconnect().await {
                    debug!("{}: disconnect after failure: {}", device_id, e);
                }
                return Err(e);
            }
        };

        let services: Vec<DiscoveredService> = gatt_services
            .iter()
            .map(|service| {
                let uuid = service.uuid();
                let descriptor = lookup_service(&uuid);
                if descriptor.is_none() {
                    debug!("{}: ignoring unknown service {}", device_id, uuid);
                }
                DiscoveredService { uuid, descriptor }
            })
            .collect();

        let equipment_type = SERVICES
            .iter()
            .find(|known| {
                services
                    .iter()
                    .any(|service| service.uuid.eq_ignore_ascii_case(known.full_id))
            })
            .map(|known| known.name)
            .unwrap_or("");

        let record = DeviceRecord::new(device_id.clone(), device.name(), equipment_type);
        sink.emit(SessionEvent::Discovered {
            device_id: record.id.clone(),
            name: record.name.clone(),
            equipment_type: record.equipment_type.clone(),
            capabilities: record.capabilities.clone(),
        });

        transition(&state, &device_id, SessionState::ClassifyingCharacteristics);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            device_id: device_id.clone(),
            record: Mutex::new(record),
            sink,
            directory,
            state,
            shutdown,
            ended: AtomicBool::new(false),
            live_streams: AtomicUsize::new(0),
        });

        let known_services = gatt_services
            .iter()
            .zip(&services)
            .filter(|(_, discovered)| discovered.descriptor.is_some())
            .map(|(service, _)| service);

        let attached = join_all(
            known_services.map(|service| attach_service(&shared, service, config, &shutdown_rx)),
        )
        .await;

        let mut session = Self {
            device,
            shared,
            services,
            channels: BTreeMap::new(),
            muxes: Vec::new(),
            tasks: Vec::new(),
        };

        for attachment in attached.into_iter().flatten() {
            match attachment {
                Attached::Read | Attached::Skipped => {}
                Attached::Notify { mux, task } => {
                    session.muxes.push(mux);
                    session.tasks.push(task);
                }
                Attached::Write { mux, channel } => {
                    session.muxes.push(mux);
                    session.channels.insert(channel.short_id(), channel);
                }
            }
        }

        if config.request_control_on_connect
            && session.channels.contains_key(&FITNESS_MACHINE_CONTROL_POINT)
        {
            session.take_control().await;
        }

        if !session.shared.ended.load(Ordering::SeqCst) {
            transition(&session.shared.state, &device_id, SessionState::Active);
        }
        Ok(session)
    }

    /// Take control of the fitness machine and reset it
    async fn take_control(&self) {
        for command in ["requestControl", "reset"] {
            if let Err(e) = self
                .issue_command(FITNESS_MACHINE_CONTROL_POINT, command, &CommandInput::new())
                .await
            {
                warn!("{}: {} failed: {}", self.shared.device_id, command, e);
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn services(&self) -> &[DiscoveredService] {
        &self.services
    }

    /// Short ids of the characteristics that accept commands
    pub fn writable_characteristics(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// Snapshot of the device record
    pub async fn record(&self) -> DeviceRecord {
        self.shared.record.lock().await.clone()
    }

    /// Send `command` to the writable characteristic `short_id`
    ///
    /// Outcomes other than supersession are also reported to the event sink.
    pub async fn issue_command(
        &self,
        short_id: u16,
        command: &str,
        input: &CommandInput,
    ) -> Result<()> {
        let channel = self
            .channels
            .get(&short_id)
            .ok_or(TrainerError::UnknownCharacteristic(short_id))?;

        let result = channel.issue(command, input).await;
        let device_id = self.shared.device_id.clone();
        match &result {
            Ok(()) => self.shared.sink.emit(SessionEvent::CommandSucceeded {
                device_id,
                command: command.to_string(),
            }),
            Err(TrainerError::CommandSuperseded { .. }) => {}
            Err(TrainerError::CommandFailed { reason, .. }) => {
                self.shared.sink.emit(SessionEvent::CommandFailed {
                    device_id,
                    command: command.to_string(),
                    reason: reason.clone(),
                })
            }
            Err(e) => self.shared.sink.emit(SessionEvent::CommandFailed {
                device_id,
                command: command.to_string(),
                reason: e.to_string(),
            }),
        }
        result
    }

    /// Stop every subscription and command, then disconnect the device
    pub async fn disconnect(&self) -> Result<()> {
        if !self.teardown(false) {
            return Ok(());
        }
        self.device.disconnect().await
    }

    /// Tear the session down but leave the connection to a newer session
    pub(crate) fn retire(&self) {
        self.teardown(true);
    }

    /// Returns false if the session had already ended
    fn teardown(&self, retiring: bool) -> bool {
        let ended = self.shared.end(retiring);
        for mux in &self.muxes {
            mux.close();
        }
        for task in &self.tasks {
            task.abort();
        }
        ended
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if !self.teardown(false) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let device = Arc::clone(&self.device);
            runtime.spawn(async move {
                if let Err(e) = device.disconnect().await {
                    debug!("{}: disconnect on drop failed: {}", device.id(), e);
                }
            });
        }
    }
}

fn transition(state: &watch::Sender<SessionState>, device_id: &str, next: SessionState) {
    let previous = state.send_replace(next);
    if previous != next {
        info!("{}: {} -> {}", device_id, previous, next);
    }
}

async fn attach_service(
    shared: &Arc<SessionShared>,
    service: &Arc<dyn GattService>,
    config: &SessionConfig,
    shutdown: &watch::Receiver<bool>,
) -> Vec<Attached> {
    let characteristics = match service.characteristics().await {
        Ok(characteristics) => characteristics,
        Err(e) => {
            warn!(
                "{}: failed to enumerate characteristics of {}: {}",
                shared.device_id,
                service.uuid(),
                e
            );
            return Vec::new();
        }
    };

    join_all(characteristics.into_iter().map(|characteristic| async move {
        let uuid = characteristic.uuid();
        match attach_characteristic(shared, characteristic, config, shutdown).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!("{}: characteristic {}: {}", shared.device_id, uuid, e);
                Attached::Skipped
            }
        }
    }))
    .await
}

async fn attach_characteristic(
    shared: &Arc<SessionShared>,
    characteristic: Arc<dyn GattCharacteristic>,
    config: &SessionConfig,
    shutdown: &watch::Receiver<bool>,
) -> Result<Attached> {
    let uuid = characteristic.uuid();
    let Some(descriptor) = full_id_to_short_id(&uuid)
        .ok()
        .and_then(lookup_characteristic)
    else {
        debug!("{}: skipping unknown characteristic {}", shared.device_id, uuid);
        return Ok(Attached::Skipped);
    };

    debug!(
        "{}: attaching {} ({})",
        shared.device_id,
        descriptor.name,
        descriptor.role.kind()
    );

    match descriptor.role {
        CharacteristicRole::Read(layout) => {
            let payload = characteristic.read().await?;
            shared.absorb(descriptor, layout, &payload).await;
            Ok(Attached::Read)
        }
        CharacteristicRole::Notify(layout) => {
            let label = format!("{} {}", shared.device_id, descriptor.name);
            let mux = Arc::new(NotificationMux::new(characteristic, label));
            let mut subscription = mux.subscribe().await?;

            let shared = Arc::clone(shared);
            shared.live_streams.fetch_add(1, Ordering::SeqCst);
            let task = tokio::spawn(async move {
                while let Some(payload) = subscription.recv().await {
                    shared.absorb(descriptor, layout, &payload).await;
                }
                debug!("{}: {} notifications ended", shared.device_id, descriptor.name);
                shared.stream_ended();
            });

            Ok(Attached::Notify { mux, task })
        }
        CharacteristicRole::Write(_) => {
            let label = format!("{} {}", shared.device_id, descriptor.name);
            let mux = Arc::new(NotificationMux::new(Arc::clone(&characteristic), label));
            let channel = Arc::new(CommandChannel::new(
                descriptor,
                characteristic,
                Arc::clone(&mux),
                config.command_timeout,
                shutdown.clone(),
            ));
            Ok(Attached::Write { mux, channel })
        }
    }
}
