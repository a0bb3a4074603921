//! Multi-device manager
//!
//! Owns every active [`DeviceSession`], routes commands by device id and
//! shares one [`FeatureDirectory`] so the first device to report a feature
//! stays its source.

use crate::codec::{CommandInput, InputValue};
use crate::config::SessionConfig;
use crate::profiles::FITNESS_MACHINE_CONTROL_POINT;
use crate::session::{DeviceSession, SessionState};
use crate::telemetry::{DeviceRecord, EventSink, Feature, FeatureDirectory, SessionEvent};
use crate::transport::BleCentral;
use crate::types::{Result, TrainerError};
use futures::future::join_all;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct DeviceManager {
    central: Arc<dyn BleCentral>,
    config: SessionConfig,
    sink: Arc<dyn EventSink>,
    directory: Arc<FeatureDirectory>,
    sessions: Mutex<BTreeMap<String, Arc<DeviceSession>>>,
}

impl DeviceManager {
    pub fn new(central: Arc<dyn BleCentral>, config: SessionConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            central,
            config,
            sink,
            directory: Arc::new(FeatureDirectory::new()),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Select and connect one more device, returning its id
    ///
    /// Failures are also reported to the event sink as `SearchFailed`.
    pub async fn search(&self) -> Result<String> {
        let session = match DeviceSession::establish(
            self.central.as_ref(),
            &self.config,
            Arc::clone(&self.sink),
            Arc::clone(&self.directory),
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("Search failed: {}", e);
                self.sink.emit(SessionEvent::SearchFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let device_id = session.id().to_string();
        let previous = self
            .sessions
            .lock()
            .await
            .insert(device_id.clone(), session);
        if let Some(previous) = previous {
            info!("{}: replacing previous session", device_id);
            previous.retire();
        }

        Ok(device_id)
    }

    /// Send a command to one characteristic of one device
    pub async fn issue_command(
        &self,
        device_id: &str,
        short_id: u16,
        command: &str,
        input: &CommandInput,
    ) -> Result<()> {
        let session = self.session(device_id).await?;
        session.issue_command(short_id, command, input).await
    }

    /// Set the target power of every connected fitness machine
    pub async fn update_resistance(&self, watts: f64) -> Result<()> {
        let trainers: Vec<Arc<DeviceSession>> = self
            .live_sessions()
            .await
            .into_iter()
            .filter(|session| {
                session
                    .writable_characteristics()
                    .contains(&FITNESS_MACHINE_CONTROL_POINT)
            })
            .collect();

        if trainers.is_empty() {
            return Err(TrainerError::UnknownCharacteristic(
                FITNESS_MACHINE_CONTROL_POINT,
            ));
        }

        let input = CommandInput::from([("resistance".to_string(), InputValue::Number(watts))]);
        let results = join_all(trainers.iter().map(|session| {
            session.issue_command(FITNESS_MACHINE_CONTROL_POINT, "updateResistance", &input)
        }))
        .await;

        results.into_iter().collect()
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| TrainerError::UnknownDevice(device_id.to_string()))?;
        session.disconnect().await
    }

    /// Disconnect every device
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = std::mem::take(&mut *self.sessions.lock().await)
            .into_values()
            .collect();
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                warn!("{}: disconnect failed: {}", session.id(), e);
            }
        }
    }

    /// Snapshot of every connected device
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let sessions = self.live_sessions().await;
        join_all(sessions.iter().map(|session| session.record())).await
    }

    /// Device currently designated as the source of `feature`
    pub fn source_of(&self, feature: Feature) -> Option<String> {
        self.directory.source_of(feature)
    }

    /// Forget sessions whose link was lost, returning the rest
    async fn live_sessions(&self) -> Vec<Arc<DeviceSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|device_id, session| {
            let live = session.state() != SessionState::Disconnected;
            if !live {
                info!("{}: link lost, forgetting session", device_id);
            }
            live
        });
        sessions.values().cloned().collect()
    }

    async fn session(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        self.sessions
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| TrainerError::UnknownDevice(device_id.to_string()))
    }
}
