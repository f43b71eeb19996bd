//! Repeater lifecycle: registration, status heartbeat, request handling.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use repeater_bus::MessageBus;
use repeater_protocol::version::is_newer;
use repeater_protocol::{
    Command, Event, RegisterRepeaterCommand, RepeaterStatus, RepeaterStatusEvent,
    RequestExecutingEvent,
};
use repeater_runner::RequestRunnerRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::RepeaterConfig;
use crate::error::RepeaterError;
use crate::handler::RequestExecutingHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterState {
    Off,
    Starting,
    Running,
}

/// A repeater agent bound to one message bus.
///
/// `start` and `stop` are serialized by a lifecycle lock; only an `Off`
/// repeater can be started.
pub struct Repeater {
    bus: Arc<MessageBus>,
    runners: RequestRunnerRegistry,
    config: RepeaterConfig,
    state: Mutex<RepeaterState>,
    /// Heartbeat task while running.
    lifecycle: tokio::sync::Mutex<Option<Heartbeat>>,
}

struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Cancels the task and waits for it so no beat follows `disconnected`.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}

impl Repeater {
    pub fn new(bus: Arc<MessageBus>, runners: RequestRunnerRegistry, config: RepeaterConfig) -> Self {
        Self {
            bus,
            runners,
            config,
            state: Mutex::new(RepeaterState::Off),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn repeater_id(&self) -> &str {
        &self.config.repeater_id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn state(&self) -> RepeaterState {
        *self.lock_state()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    fn lock_state(&self) -> MutexGuard<'_, RepeaterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RepeaterState) {
        *self.lock_state() = state;
    }

    /// Registers with the backend, subscribes to request execution,
    /// announces `connected` and starts the heartbeat.
    ///
    /// Fails with [`RepeaterError::AlreadyActive`] unless the repeater is
    /// `Off`. Any other failure leaves it `Off`.
    pub async fn start(&self) -> Result<(), RepeaterError> {
        let mut heartbeat = self.lifecycle.lock().await;
        if self.state() != RepeaterState::Off {
            return Err(RepeaterError::AlreadyActive);
        }
        self.set_state(RepeaterState::Starting);
        info!(repeater_id = %self.repeater_id(), version = %self.version(), "starting repeater");

        match self.run_start().await {
            Ok(beat) => {
                *heartbeat = Some(beat);
                self.set_state(RepeaterState::Running);
                info!(repeater_id = %self.repeater_id(), "repeater running");
                Ok(())
            }
            Err(e) => {
                self.set_state(RepeaterState::Off);
                error!(repeater_id = %self.repeater_id(), error = %e, "repeater failed to start");
                Err(e)
            }
        }
    }

    async fn run_start(&self) -> Result<Heartbeat, RepeaterError> {
        self.bus.init().await?;
        self.register().await?;
        self.bus
            .register_with_reply::<RequestExecutingEvent, _>(RequestExecutingHandler::new(
                self.runners.clone(),
            ))
            .await?;
        publish_status(&self.bus, self.repeater_id(), RepeaterStatus::Connected).await?;
        Ok(self.spawn_heartbeat())
    }

    async fn register(&self) -> Result<(), RepeaterError> {
        let command = Command::new(RegisterRepeaterCommand {
            version: self.config.version.clone(),
            repeater_id: self.config.repeater_id.clone(),
        });
        let reply = self
            .bus
            .execute(&command)
            .await?
            .ok_or(RepeaterError::EmptyReply)?;

        if let Some(err) = reply.payload.error {
            return Err(err.into());
        }
        if let Some(latest) = reply.payload.version.as_deref() {
            if is_newer(latest, &self.config.version) {
                warn!(
                    current = %self.config.version,
                    latest,
                    "a newer repeater version is available, consider upgrading"
                );
            }
        }
        debug!(repeater_id = %self.repeater_id(), "repeater registered");
        Ok(())
    }

    fn spawn_heartbeat(&self) -> Heartbeat {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let bus = Arc::clone(&self.bus);
        let repeater_id = self.config.repeater_id.clone();
        let period = self.config.heartbeat_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; `connected` was just sent.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match publish_status(&bus, &repeater_id, RepeaterStatus::Connected).await {
                            Ok(()) => trace!(%repeater_id, "heartbeat sent"),
                            Err(e) => warn!(%repeater_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
            debug!(%repeater_id, "heartbeat stopped");
        });

        debug!(repeater_id = %self.repeater_id(), ?period, "heartbeat started");
        Heartbeat { cancel, task }
    }

    /// Stops the heartbeat and announces `disconnected`. A no-op when the
    /// repeater is already `Off`.
    ///
    /// The request handler stays registered; a later `start` reuses it.
    pub async fn stop(&self) -> Result<(), RepeaterError> {
        let mut heartbeat = self.lifecycle.lock().await;
        if self.state() == RepeaterState::Off {
            return Ok(());
        }
        if let Some(beat) = heartbeat.take() {
            beat.stop().await;
        }
        let published =
            publish_status(&self.bus, self.repeater_id(), RepeaterStatus::Disconnected).await;
        self.set_state(RepeaterState::Off);
        info!(repeater_id = %self.repeater_id(), "repeater stopped");
        published
    }

    /// Stops the repeater and disposes its bus.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!(repeater_id = %self.repeater_id(), error = %e, "stop during shutdown failed");
        }
        self.bus.dispose().await;
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        if let Some(beat) = self.lifecycle.get_mut().take() {
            beat.cancel.cancel();
        }
    }
}

async fn publish_status(
    bus: &MessageBus,
    repeater_id: &str,
    status: RepeaterStatus,
) -> Result<(), RepeaterError> {
    let event = Event::new(RepeaterStatusEvent {
        repeater_id: repeater_id.to_string(),
        status,
    });
    bus.publish(&event).await?;
    Ok(())
}
