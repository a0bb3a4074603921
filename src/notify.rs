//! Notification multiplexer
//!
//! Shares one characteristic's notification stream between any number of
//! consumers. The first subscriber enables notifications on the device and
//! starts a pump task; every payload is copied into each consumer's FIFO
//! queue. Dropping the last [`Subscription`] stops the pump, which drops the
//! transport stream and disables notifications again.

use crate::transport::{GattCharacteristic, NotificationStream};
use crate::types::{Result, TrainerError};
use futures::StreamExt;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MuxState {
    next_id: u64,
    consumers: BTreeMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl MuxState {
    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Reference-counted notification fan-out for one characteristic
pub struct NotificationMux {
    characteristic: Arc<dyn GattCharacteristic>,
    label: String,
    state: Arc<Mutex<MuxState>>,
    // Serializes enabling so two first subscribers cannot both call notify()
    enabling: tokio::sync::Mutex<()>,
}

impl NotificationMux {
    pub fn new(characteristic: Arc<dyn GattCharacteristic>, label: impl Into<String>) -> Self {
        Self {
            characteristic,
            label: label.into(),
            state: Arc::new(Mutex::new(MuxState::default())),
            enabling: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a consumer, enabling notifications if it is the first one
    pub async fn subscribe(&self) -> Result<Subscription> {
        let _enabling = self.enabling.lock().await;

        {
            let mut state = self.lock_state()?;
            if state.closed {
                return Err(TrainerError::Cancelled);
            }
            if state.pump.is_some() {
                return Ok(self.register(&mut state));
            }
        }

        debug!("Enabling notifications on {}", self.label);
        let stream = self.characteristic.notify().await?;

        let mut state = self.lock_state()?;
        if state.closed {
            return Err(TrainerError::Cancelled);
        }
        state.pump = Some(tokio::spawn(pump(
            stream,
            Arc::downgrade(&self.state),
            self.label.clone(),
        )));
        Ok(self.register(&mut state))
    }

    /// Number of live consumers
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.consumers.len())
            .unwrap_or(0)
    }

    /// Whether notifications are currently enabled on the device
    pub fn is_enabled(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pump.is_some())
            .unwrap_or(false)
    }

    /// End every consumer and disable notifications; later subscribes fail
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                debug!("Closing notifications on {}", self.label);
            }
            state.closed = true;
            state.consumers.clear();
            state.stop_pump();
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, MuxState>> {
        self.state
            .lock()
            .map_err(|_| TrainerError::Transport(format!("{}: state lock poisoned", self.label)))
    }

    fn register(&self, state: &mut MuxState) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.consumers.insert(id, tx);
        debug!(
            "{}: consumer {} subscribed ({} active)",
            self.label,
            id,
            state.consumers.len()
        );

        Subscription {
            id,
            receiver: rx,
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for NotificationMux {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(mut stream: NotificationStream, state: Weak<Mutex<MuxState>>, label: String) {
    while let Some(value) = stream.next().await {
        let Some(state) = state.upgrade() else {
            return;
        };
        let Ok(mut state) = state.lock() else {
            warn!("{}: state lock poisoned, stopping notifications", label);
            return;
        };
        state
            .consumers
            .retain(|_, consumer| consumer.send(value.clone()).is_ok());
    }

    // The device ended the stream (usually a disconnect)
    debug!("{}: notification stream ended", label);
    if let Some(state) = state.upgrade() {
        if let Ok(mut state) = state.lock() {
            state.consumers.clear();
            state.pump = None;
        }
    }
}

/// One consumer's view of a characteristic's notifications
///
/// Payloads arrive in transport order. Dropping the subscription unregisters
/// the consumer.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<Mutex<MuxState>>,
}

impl Subscription {
    /// Next payload, or `None` once the multiplexer is closed or the stream ends
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Discard payloads that are already queued
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.consumers.remove(&self.id);
            if state.consumers.is_empty() {
                state.stop_pump();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCharacteristic;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_shared_enablement() {
        let characteristic = FakeCharacteristic::notifying(0x2a37);
        let mux = NotificationMux::new(characteristic.clone(), "heart rate");

        let first = mux.subscribe().await.unwrap();
        let second = mux.subscribe().await.unwrap();

        assert_eq!(characteristic.notify_calls(), 1);
        assert_eq!(characteristic.active_notifications(), 1);
        assert_eq!(mux.subscriber_count(), 2);

        drop(first);
        settle().await;
        assert_eq!(characteristic.active_notifications(), 1);
        assert!(mux.is_enabled());

        drop(second);
        settle().await;
        assert_eq!(characteristic.active_notifications(), 0);
        assert!(!mux.is_enabled());
    }

    #[tokio::test]
    async fn test_fifo_to_every_consumer() {
        let characteristic = FakeCharacteristic::notifying(0x2ad2);
        let mux = NotificationMux::new(characteristic.clone(), "indoor bike");

        let mut first = mux.subscribe().await.unwrap();
        let mut second = mux.subscribe().await.unwrap();

        for n in 0..5u8 {
            characteristic.push(vec![n]);
        }

        for n in 0..5u8 {
            assert_eq!(first.recv().await, Some(vec![n]));
            assert_eq!(second.recv().await, Some(vec![n]));
        }
    }

    #[tokio::test]
    async fn test_resubscribe_after_release() {
        let characteristic = FakeCharacteristic::notifying(0x2a63);
        let mux = NotificationMux::new(characteristic.clone(), "power");

        drop(mux.subscribe().await.unwrap());
        settle().await;

        let mut subscription = mux.subscribe().await.unwrap();
        assert_eq!(characteristic.notify_calls(), 2);

        characteristic.push(vec![0xAA]);
        assert_eq!(subscription.recv().await, Some(vec![0xAA]));
    }

    #[tokio::test]
    async fn test_close_ends_consumers() {
        let characteristic = FakeCharacteristic::notifying(0x2a5b);
        let mux = NotificationMux::new(characteristic.clone(), "csc");

        let mut subscription = mux.subscribe().await.unwrap();
        mux.close();
        settle().await;

        assert_eq!(subscription.recv().await, None);
        assert_eq!(characteristic.active_notifications(), 0);
        assert!(matches!(
            mux.subscribe().await,
            Err(TrainerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_stream_end_ends_consumers() {
        let characteristic = FakeCharacteristic::notifying(0x2a37);
        let mux = NotificationMux::new(characteristic.clone(), "heart rate");

        let mut subscription = mux.subscribe().await.unwrap();
        characteristic.end_notifications();

        assert_eq!(subscription.recv().await, None);
        assert!(!mux.is_enabled());
    }

    #[tokio::test]
    async fn test_enable_failure_is_reported() {
        let characteristic = FakeCharacteristic::notifying(0x2a37);
        characteristic.fail_notify();
        let mux = NotificationMux::new(characteristic.clone(), "heart rate");

        assert!(matches!(
            mux.subscribe().await,
            Err(TrainerError::Transport(_))
        ));
        assert_eq!(mux.subscriber_count(), 0);
    }
}
