//! Broker connection supervision.
//!
//! [`ConnectionSupervisor`] owns the single broker connection. Callers never
//! hold the connection itself; they ask the supervisor for channels, so a
//! reconnect transparently redirects every later call. Transport faults are
//! funneled through one channel into a single reconnect loop, and every
//! successful connect bumps a generation counter observers can watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::BusError;
use crate::options::BusOptions;
use crate::retry::{ExponentialBackoff, RetryStrategy, retry};
use crate::transport::{
    Channel, ConnectParams, Connection, ConnectionFault, Delivery, FaultNotifier, QueueSpec,
    Transport,
};

type FaultReceiver = mpsc::UnboundedReceiver<(u64, ConnectionFault)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A consuming channel together with the queue it consumes.
pub struct Consumer {
    pub channel: Arc<dyn Channel>,
    pub queue: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    params: ConnectParams,
    connect_timeout: Duration,
    strategy: Arc<dyn RetryStrategy>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    /// Serializes connects so concurrent triggers collapse into one.
    connect_lock: tokio::sync::Mutex<()>,
    generation: watch::Sender<u64>,
    faults_tx: mpsc::UnboundedSender<(u64, ConnectionFault)>,
    faults_rx: Mutex<Option<FaultReceiver>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, options: &BusOptions) -> Arc<Self> {
        let strategy = Arc::new(ExponentialBackoff::new(options.reconnect.clone()));
        Self::with_strategy(transport, options, strategy)
    }

    pub fn with_strategy(
        transport: Arc<dyn Transport>,
        options: &BusOptions,
        strategy: Arc<dyn RetryStrategy>,
    ) -> Arc<Self> {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);
        let connect_timeout = if options.connect_timeout.is_zero() {
            BusOptions::default().connect_timeout
        } else {
            options.connect_timeout
        };
        Arc::new(Self {
            transport,
            params: options.connect_params(),
            connect_timeout,
            strategy,
            connection: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            generation,
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }

    fn current(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, connection: Option<Arc<dyn Connection>>) -> Option<Arc<dyn Connection>> {
        let mut guard = self.connection.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, connection)
    }

    /// Connects to the broker, retrying through the configured strategy.
    ///
    /// Returns immediately when a live connection already exists.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BusError> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(self: &Arc<Self>) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.start_reconnect_loop();
        if self.is_connected() {
            return Ok(());
        }

        let generation = *self.generation.borrow() + 1;
        let connection = retry(self.strategy.as_ref(), &self.cancel, |attempt| {
            let notifier = FaultNotifier::new(generation, self.faults_tx.clone());
            async move {
                debug!(attempt, url = %self.params.url, "connecting to broker");
                match tokio::time::timeout(
                    self.connect_timeout,
                    self.transport.connect(&self.params, notifier),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BusError::Transport(format!(
                        "connect timed out after {:?}",
                        self.connect_timeout
                    ))),
                }
            }
        })
        .await?;

        if self.cancel.is_cancelled() {
            let _ = connection.close().await;
            return Err(BusError::Closed);
        }

        self.replace(Some(connection));
        self.generation.send_replace(generation);
        info!(generation, url = %self.params.url, "connected to broker");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_open())
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Connects unless a live connection already exists.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>, BusError> {
        let connection = self
            .current()
            .filter(|c| c.is_open())
            .ok_or(BusError::NotConnected)?;
        connection.create_channel().await
    }

    /// Opens a channel, declares `spec` on it, and starts consuming.
    pub async fn create_consumer(&self, spec: &QueueSpec) -> Result<Consumer, BusError> {
        let channel = self.create_channel().await?;
        let queue = channel.declare_queue(spec).await?;
        let deliveries = channel.consume(&queue).await?;
        Ok(Consumer {
            channel,
            queue,
            deliveries,
        })
    }

    /// Generation of the current connection; bumped on every successful
    /// connect.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn start_reconnect_loop(self: &Arc<Self>) {
        let Some(mut faults) = self
            .faults_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let (generation, fault) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = faults.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else { break };
                this.handle_fault(generation, fault).await;
            }
            debug!("reconnect loop stopped");
        });
    }

    async fn handle_fault(self: &Arc<Self>, generation: u64, fault: ConnectionFault) {
        let _guard = self.connect_lock.lock().await;
        if self.cancel.is_cancelled() || generation != self.generation() {
            trace!(generation, %fault, "ignoring fault from a replaced connection");
            return;
        }

        warn!(generation, %fault, "broker connection lost, reconnecting");
        if let Some(old) = self.replace(None) {
            if let Err(e) = old.close().await {
                debug!(error = %e, "closing faulted connection failed");
            }
        }

        if let Err(e) = self.connect_locked().await {
            error!(error = %e, "reconnect failed");
        }
    }

    /// Stops reconnecting, then closes the connection. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(connection) = self.replace(None) {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "closing broker connection failed");
            }
        }
        info!("broker connection closed");
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
