//! Command channel
//!
//! One channel per writable characteristic of a connected device. Commands
//! are encoded from the registry, written with response, and acknowledged by
//! the next notification on the same characteristic.
//!
//! Only one command is in flight at a time and the latest request wins: a
//! newer command makes every older one that is still queued or waiting
//! return [`TrainerError::CommandSuperseded`]. Writes are remembered in a
//! FIFO so that a superseded or timed-out command's late response is matched
//! to its own write and discarded instead of being taken as the newer
//! command's answer. Unanswered writes leave the FIFO after twice the
//! response timeout.

use crate::codec::{encode_command, validate_response, CommandInput, ResponseVerdict};
use crate::notify::{NotificationMux, Subscription};
use crate::registry::{CharacteristicDescriptor, CommandDefinition};
use crate::transport::GattCharacteristic;
use crate::types::{Result, TrainerError};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// How many timeouts an unanswered write keeps its place in the FIFO
const RESPONSE_GRACE_FACTOR: u32 = 2;

struct PendingWrite {
    token: u64,
    written_at: Instant,
}

#[derive(Default)]
struct ResponseState {
    subscription: Option<Subscription>,
    pending: VecDeque<PendingWrite>,
}

enum Outcome {
    Response(Vec<u8>),
    Superseded,
    TimedOut,
    Cancelled,
    StreamEnded,
}

/// Latest-wins command sender for one write characteristic
pub struct CommandChannel {
    descriptor: &'static CharacteristicDescriptor,
    characteristic: Arc<dyn GattCharacteristic>,
    responses: Arc<NotificationMux>,
    timeout: Duration,
    latest: watch::Sender<u64>,
    in_flight: Mutex<ResponseState>,
    shutdown: watch::Receiver<bool>,
}

impl CommandChannel {
    pub fn new(
        descriptor: &'static CharacteristicDescriptor,
        characteristic: Arc<dyn GattCharacteristic>,
        responses: Arc<NotificationMux>,
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            descriptor,
            characteristic,
            responses,
            timeout,
            latest,
            in_flight: Mutex::new(ResponseState::default()),
            shutdown,
        }
    }

    pub fn short_id(&self) -> u16 {
        self.descriptor.short_id
    }

    /// Encode, write and confirm `command`
    pub async fn issue(&self, command: &str, input: &CommandInput) -> Result<()> {
        let definition =
            self.descriptor
                .command(command)
                .ok_or_else(|| TrainerError::UnknownCommand {
                    characteristic: self.descriptor.short_id,
                    command: command.to_string(),
                })?;

        let buffer = encode_command(definition, input)?;

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(TrainerError::Cancelled);
        }

        let mut token = 0;
        self.latest.send_modify(|generation| {
            *generation += 1;
            token = *generation;
        });
        let mut latest = self.latest.subscribe();

        debug!(
            "{}: queueing {} (request {})",
            self.descriptor.name, command, token
        );

        // Wait for the previous command to finish unless something newer
        // arrives first
        let mut state = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Err(TrainerError::Cancelled),
            _ = superseded(&mut latest, token) => return Err(self.superseded(command, token)),
            state = self.in_flight.lock() => state,
        };

        if *self.latest.borrow() != token {
            return Err(self.superseded(command, token));
        }

        if state.subscription.is_none() {
            state.subscription = Some(self.responses.subscribe().await?);
        }

        let timeout = self.timeout;
        let ResponseState {
            subscription,
            pending,
        } = &mut *state;

        // Unanswered writes older than the grace window will never be answered
        pending.retain(|write| write.written_at.elapsed() < timeout * RESPONSE_GRACE_FACTOR);

        let Some(responses) = subscription.as_mut() else {
            return Err(TrainerError::Transport(format!(
                "{}: no response subscription",
                self.descriptor.name
            )));
        };
        // Responses that queued up while nobody was waiting belong to the
        // oldest outstanding writes
        let stale = responses.drain();
        for _ in 0..stale {
            if pending.pop_front().is_none() {
                break;
            }
        }
        if stale > 0 {
            debug!("{}: dropped {} stale responses", self.descriptor.name, stale);
        }

        debug!(
            "{}: writing {} ({} bytes)",
            self.descriptor.name,
            command,
            buffer.len()
        );
        self.characteristic.write(&buffer).await?;
        pending.push_back(PendingWrite {
            token,
            written_at: Instant::now(),
        });

        let deadline = Instant::now() + timeout;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => Outcome::Cancelled,
                value = responses.recv() => match value {
                    Some(value) => Outcome::Response(value),
                    None => Outcome::StreamEnded,
                },
                _ = superseded(&mut latest, token) => Outcome::Superseded,
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            };

            match outcome {
                Outcome::Response(value) => match pending.pop_front() {
                    Some(write) if write.token == token => {
                        return self.check_response(command, definition, &value);
                    }
                    Some(write) => {
                        debug!(
                            "{}: discarding response to superseded request {}",
                            self.descriptor.name, write.token
                        );
                    }
                    None => {
                        debug!("{}: discarding unsolicited response", self.descriptor.name);
                    }
                },
                // The pending write stays queued so its response is discarded
                Outcome::Superseded => return Err(self.superseded(command, token)),
                // The write stays queued so a late answer is matched to it
                Outcome::TimedOut => {
                    warn!(
                        "{}: no response to {} after {:?}",
                        self.descriptor.name, command, timeout
                    );
                    return Err(TrainerError::CommandTimedOut {
                        command: command.to_string(),
                        after: timeout,
                    });
                }
                Outcome::Cancelled => return Err(TrainerError::Cancelled),
                Outcome::StreamEnded => {
                    pending.clear();
                    *subscription = None;
                    return Err(TrainerError::Transport(format!(
                        "{}: response stream ended",
                        self.descriptor.name
                    )));
                }
            }
        }
    }

    fn check_response(
        &self,
        command: &str,
        definition: &CommandDefinition,
        value: &[u8],
    ) -> Result<()> {
        match validate_response(definition, value) {
            ResponseVerdict::Accepted => {
                info!("{}: {} succeeded", self.descriptor.name, command);
                Ok(())
            }
            ResponseVerdict::Rejected { field, reason } => {
                warn!(
                    "{}: {} rejected at {}: {}",
                    self.descriptor.name, command, field, reason
                );
                Err(TrainerError::CommandFailed {
                    command: command.to_string(),
                    reason,
                })
            }
        }
    }

    fn superseded(&self, command: &str, token: u64) -> TrainerError {
        debug!(
            "{}: {} (request {}) superseded",
            self.descriptor.name, command, token
        );
        TrainerError::CommandSuperseded {
            command: command.to_string(),
        }
    }
}

/// Resolves once a request newer than `token` has been issued
async fn superseded(latest: &mut watch::Receiver<u64>, token: u64) {
    loop {
        if *latest.borrow_and_update() != token {
            return;
        }
        if latest.changed().await.is_err() {
            return futures::future::pending().await;
        }
    }
}

/// Resolves once the session starts shutting down or is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::InputValue;
    use crate::fake::FakeCharacteristic;
    use crate::profiles::FITNESS_MACHINE_CONTROL_POINT;
    use crate::registry::lookup_characteristic;

    fn channel(characteristic: &Arc<FakeCharacteristic>) -> (Arc<CommandChannel>, watch::Sender<bool>) {
        let descriptor = lookup_characteristic(FITNESS_MACHINE_CONTROL_POINT).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mux = Arc::new(NotificationMux::new(characteristic.clone(), "control point"));
        let channel = CommandChannel::new(
            descriptor,
            characteristic.clone(),
            mux,
            Duration::from_secs(3),
            shutdown_rx,
        );
        (Arc::new(channel), shutdown_tx)
    }

    fn input(key: &str, value: f64) -> CommandInput {
        CommandInput::from([(key.to_string(), InputValue::Number(value))])
    }

    async fn wait_for_writes(characteristic: &FakeCharacteristic, count: usize) {
        for _ in 0..200 {
            if characteristic.writes().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} writes, saw {:?}", count, characteristic.writes());
    }

    #[tokio::test]
    async fn test_command_succeeds() {
        let characteristic = FakeCharacteristic::control_point(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        channel
            .issue("updateResistance", &input("resistance", 50.0))
            .await
            .unwrap();

        let writes = characteristic.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 18);
        assert_eq!(&writes[0][..3], &[0x05, 50, 0]);
    }

    #[tokio::test]
    async fn test_unknown_command_writes_nothing() {
        let characteristic = FakeCharacteristic::control_point(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        let err = channel
            .issue("launchRocket", &CommandInput::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TrainerError::UnknownCommand {
                characteristic: FITNESS_MACHINE_CONTROL_POINT,
                command: "launchRocket".to_string(),
            }
        );
        assert!(characteristic.writes().is_empty());
    }

    #[tokio::test]
    async fn test_encoding_error_writes_nothing() {
        let characteristic = FakeCharacteristic::control_point(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        let err = channel
            .issue("updateResistance", &input("resistance", f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, TrainerError::Encoding(_)));
        assert!(characteristic.writes().is_empty());
        assert_eq!(characteristic.notify_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_response() {
        let characteristic = FakeCharacteristic::notifying(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.issue("reset", &CommandInput::new()).await }
        });
        wait_for_writes(&characteristic, 1).await;
        characteristic.push(vec![0x80, 0x01, 0x05]);

        assert_eq!(
            task.await.unwrap(),
            Err(TrainerError::CommandFailed {
                command: "reset".to_string(),
                reason: "Control is not allowed.".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_latest_command_wins() {
        let characteristic = FakeCharacteristic::notifying(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        let first = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .issue("setTargetResistanceLevel", &input("targetResistanceLevel", 8.0))
                    .await
            }
        });
        wait_for_writes(&characteristic, 1).await;

        let second = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .issue("updateResistance", &input("resistance", 200.0))
                    .await
            }
        });

        assert_eq!(
            first.await.unwrap(),
            Err(TrainerError::CommandSuperseded {
                command: "setTargetResistanceLevel".to_string(),
            })
        );
        wait_for_writes(&characteristic, 2).await;

        // The first command's late answer must not resolve the second
        characteristic.push(vec![0x80, 0x04, 0x01]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        characteristic.push(vec![0x80, 0x05, 0x01]);
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_times_out() {
        let characteristic = FakeCharacteristic::notifying(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        let err = channel
            .issue("startOrResume", &CommandInput::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TrainerError::CommandTimedOut {
                command: "startOrResume".to_string(),
                after: Duration::from_secs(3),
            }
        );

        // A late answer to the timed-out write is not mistaken for the next one
        characteristic.push(vec![0x80, 0x07, 0x04]);
        characteristic.set_auto_respond(true);
        channel.issue("startOrResume", &CommandInput::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_write_expires() {
        let characteristic = FakeCharacteristic::notifying(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, _shutdown) = channel(&characteristic);

        assert!(matches!(
            channel.issue("reset", &CommandInput::new()).await,
            Err(TrainerError::CommandTimedOut { .. })
        ));

        // Past the grace window the answer to the next write is its own
        tokio::time::sleep(Duration::from_secs(4)).await;
        characteristic.set_auto_respond(true);
        channel.issue("reset", &CommandInput::new()).await.unwrap();
        assert_eq!(characteristic.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiter() {
        let characteristic = FakeCharacteristic::notifying(FITNESS_MACHINE_CONTROL_POINT);
        let (channel, shutdown) = channel(&characteristic);

        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.issue("requestControl", &CommandInput::new()).await }
        });
        wait_for_writes(&characteristic, 1).await;

        shutdown.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Err(TrainerError::Cancelled));

        assert_eq!(
            channel.issue("requestControl", &CommandInput::new()).await,
            Err(TrainerError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let characteristic = FakeCharacteristic::control_point(FITNESS_MACHINE_CONTROL_POINT);
        characteristic.fail_write();
        let (channel, _shutdown) = channel(&characteristic);

        assert!(matches!(
            channel.issue("reset", &CommandInput::new()).await,
            Err(TrainerError::Transport(_))
        ));
    }
}
