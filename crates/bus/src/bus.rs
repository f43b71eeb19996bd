//! The event/command bus.
//!
//! Events are published on a direct exchange under their wire type. Commands
//! go through the default exchange to a named queue, carrying this client's
//! reply address; their replies are matched back by correlation id. Inbound
//! messages on the client queue are dispatched to every handler registered
//! for their type.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use repeater_protocol::constants::{CONTENT_TYPE_JSON, DIRECT_EXCHANGE};
use repeater_protocol::{Command, CommandPayload, Event, MessageMeta, Payload, codec};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::BusError;
use crate::handler::{EventHandler, ReplyHandler};
use crate::options::BusOptions;
use crate::registry::{Added, HandlerEntry, HandlerRegistry, Removed};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{Channel, Delivery, MessageProperties, OutboundMessage, QueueSpec};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Delivery>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its pending-reply entry when the waiting `execute` call ends,
/// whether by reply, timeout, or the caller dropping the future.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.correlation_id);
    }
}

/// The consuming channel of the current connection generation.
struct ConsumerState {
    channel: Arc<dyn Channel>,
    queue: String,
    generation: u64,
    loops: CancellationToken,
}

pub struct MessageBus {
    supervisor: Arc<ConnectionSupervisor>,
    options: BusOptions,
    registry: Mutex<HandlerRegistry>,
    pending: PendingMap,
    consumer: RwLock<Option<ConsumerState>>,
    /// Serializes consumer setup with bind/unbind so a rebuild after
    /// reconnect never races a registration.
    setup_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    cancel: CancellationToken,
}

impl MessageBus {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, options: BusOptions) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            options,
            registry: Mutex::new(HandlerRegistry::default()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            consumer: RwLock::new(None),
            setup_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Connects, sets up the client queue and its consumers, and keeps
    /// restoring them after every reconnect. Calling it again only re-checks
    /// the consumer.
    pub async fn init(self: &Arc<Self>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.supervisor.ensure_connected().await?;
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.spawn_watcher();
        }
        self.setup_consumer().await
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn registry(&self) -> MutexGuard<'_, HandlerRegistry> {
        lock(&self.registry)
    }

    async fn setup_consumer(self: &Arc<Self>) -> Result<(), BusError> {
        let _guard = self.setup_lock.lock().await;
        let generation = self.supervisor.generation();
        if self
            .consumer
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.generation == generation)
        {
            return Ok(());
        }

        let spec = QueueSpec::new(self.options.client_queue.clone())
            .durable()
            .exclusive()
            .auto_delete();
        let consumer = self.supervisor.create_consumer(&spec).await?;
        let channel = consumer.channel;
        channel.declare_exchange(&self.options.exchange).await?;
        let types = self.registry().types();
        for message_type in &types {
            channel
                .bind_queue(&consumer.queue, &self.options.exchange, message_type)
                .await?;
        }
        let replies = channel.consume_replies().await?;

        let loops = self.cancel.child_token();
        tokio::spawn(consume_loop(
            Arc::downgrade(self),
            consumer.deliveries,
            loops.clone(),
        ));
        tokio::spawn(reply_loop(self.pending.clone(), replies, loops.clone()));

        let previous = self.consumer.write().await.replace(ConsumerState {
            channel,
            queue: consumer.queue.clone(),
            generation,
            loops,
        });
        if let Some(previous) = previous {
            previous.loops.cancel();
            if let Err(e) = previous.channel.close().await {
                trace!(error = %e, "closing previous consumer channel failed");
            }
        }

        info!(
            queue = %consumer.queue,
            generation,
            bindings = types.len(),
            "consumer ready"
        );
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut generations = self.supervisor.subscribe();
        generations.borrow_and_update();
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = generations.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let generation = *generations.borrow_and_update();
                let Some(this) = weak.upgrade() else { break };
                info!(generation, "broker reconnected, restoring consumer");
                if let Err(e) = this.setup_consumer().await {
                    error!(generation, error = %e, "failed to restore consumer");
                }
            }
        });
    }

    /// Publishes an event under its wire type. No reply is awaited.
    pub async fn publish<T: Payload>(&self, event: &Event<T>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.supervisor.ensure_connected().await?;
        let message = OutboundMessage {
            properties: properties(event.meta(), None),
            body: codec::encode(event.payload())?,
        };

        let channel = self.supervisor.create_channel().await?;
        let result = channel
            .publish(&self.options.exchange, event.message_type(), message)
            .await;
        if let Err(e) = channel.close().await {
            trace!(error = %e, "closing publish channel failed");
        }
        result?;

        debug!(
            message_type = %event.message_type(),
            correlation_id = %event.correlation_id(),
            "event published"
        );
        Ok(())
    }

    /// Sends a command and, unless it opts out, waits up to its TTL for the
    /// correlated reply.
    ///
    /// Returns `Ok(None)` right after publishing when the command does not
    /// expect a reply.
    ///
    /// Replies arrive on the consumer set up by [`init`](Self::init), so
    /// executing on a bus that was never initialized fails with
    /// [`BusError::NotInitialized`]. While a reconnect is rebuilding the
    /// consumer it fails with [`BusError::NotConnected`].
    pub async fn execute<T: CommandPayload>(
        &self,
        command: &Command<T>,
    ) -> Result<Option<T::Reply>, BusError> {
        self.ensure_open()?;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BusError::NotInitialized);
        }
        self.supervisor.ensure_connected().await?;

        // Direct replies only reach the channel that published the request.
        let channel = self
            .consumer
            .read()
            .await
            .as_ref()
            .map(|c| c.channel.clone())
            .ok_or(BusError::NotConnected)?;

        let routing_key = command.destination().unwrap_or(self.options.app_queue.as_str());
        let message = OutboundMessage {
            properties: properties(command.meta(), Some(channel.reply_address().to_string())),
            body: codec::encode(command.payload())?,
        };

        if !command.expect_reply() {
            channel.publish(DIRECT_EXCHANGE, routing_key, message).await?;
            debug!(
                message_type = %command.message_type(),
                correlation_id = %command.correlation_id(),
                "command sent without awaiting a reply"
            );
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let correlation_id = command.correlation_id().to_string();
        lock(&self.pending).insert(correlation_id.clone(), tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        channel.publish(DIRECT_EXCHANGE, routing_key, message).await?;
        trace!(
            message_type = %command.message_type(),
            correlation_id = %command.correlation_id(),
            destination = routing_key,
            "command sent, awaiting reply"
        );

        match tokio::time::timeout(command.ttl(), rx).await {
            Ok(Ok(delivery)) => Ok(Some(codec::decode(&delivery.body)?)),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                message_type: command.message_type().to_string(),
                ttl: command.ttl(),
            }),
        }
    }

    /// Registers an event handler for `E`.
    pub async fn register<E, H>(&self, handler: H) -> Result<(), BusError>
    where
        E: Payload,
        H: EventHandler<E>,
    {
        self.add_handler(E::message_type(), HandlerEntry::event::<E, H>(handler))
            .await
    }

    /// Registers a handler for `E` whose result is sent back to the
    /// message's reply address.
    pub async fn register_with_reply<E, H>(&self, handler: H) -> Result<(), BusError>
    where
        E: Payload,
        H: ReplyHandler<E>,
    {
        self.add_handler(E::message_type(), HandlerEntry::reply::<E, H>(handler))
            .await
    }

    async fn add_handler(&self, message_type: &str, entry: HandlerEntry) -> Result<(), BusError> {
        self.ensure_open()?;
        let _guard = self.setup_lock.lock().await;
        let handler = entry.name;
        let added = self.registry().add(message_type, entry);
        match added {
            Added::First => self.bind(message_type).await,
            Added::Appended => debug!(message_type, handler, "handler added"),
            Added::Duplicate => debug!(message_type, handler, "handler already registered"),
        }
        Ok(())
    }

    /// Removes handler `H` for `E`, unbinding the type when it was the last.
    pub async fn unregister<E, H>(&self) -> Result<(), BusError>
    where
        E: Payload,
        H: 'static,
    {
        let message_type = E::message_type();
        let _guard = self.setup_lock.lock().await;
        let removed = self.registry().remove(message_type, TypeId::of::<H>())?;
        if removed == Removed::LastForType {
            self.unbind(message_type).await;
        }
        Ok(())
    }

    /// Current consuming channel and queue, if the consumer is set up.
    async fn consumer_binding(&self) -> Option<(Arc<dyn Channel>, String)> {
        self.consumer
            .read()
            .await
            .as_ref()
            .map(|c| (c.channel.clone(), c.queue.clone()))
    }

    async fn bind(&self, message_type: &str) {
        let Some((channel, queue)) = self.consumer_binding().await else {
            debug!(message_type, "no consumer yet, binding deferred");
            return;
        };
        match channel
            .bind_queue(&queue, &self.options.exchange, message_type)
            .await
        {
            Ok(()) => debug!(message_type, queue = %queue, "queue bound"),
            Err(e) => warn!(
                message_type,
                error = %e,
                "binding deferred until the consumer is restored"
            ),
        }
    }

    async fn unbind(&self, message_type: &str) {
        let Some((channel, queue)) = self.consumer_binding().await else {
            return;
        };
        match channel
            .unbind_queue(&queue, &self.options.exchange, message_type)
            .await
        {
            Ok(()) => debug!(message_type, queue = %queue, "queue unbound"),
            Err(e) => warn!(message_type, error = %e, "unbinding failed"),
        }
    }

    /// Wire types with at least one registered handler.
    pub fn registered_types(&self) -> Vec<String> {
        self.registry().types()
    }

    /// Name of the client queue of the current connection, once set up.
    pub async fn client_queue(&self) -> Option<String> {
        self.consumer_binding().await.map(|(_, queue)| queue)
    }

    /// Hands one inbound message to its handlers.
    ///
    /// Redelivered messages are dropped. Each handler runs in its own task so
    /// a failure or panic in one does not affect the others; failures are
    /// logged, not returned.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<(), BusError> {
        if delivery.redelivered {
            debug!(
                routing_key = %delivery.routing_key,
                "dropping redelivered message"
            );
            return Ok(());
        }

        let message_type = delivery
            .properties
            .message_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| delivery.routing_key.clone());
        let handlers = self.registry().resolve(&message_type)?;
        let reply_to = delivery.properties.reply_to.clone().filter(|r| !r.is_empty());
        let correlation_id = delivery.properties.correlation_id.clone();

        trace!(
            message_type = %message_type,
            handlers = handlers.len(),
            "dispatching message"
        );

        for entry in handlers {
            let outcome = tokio::spawn(entry.invoke(delivery.body.clone())).await;
            match outcome {
                Ok(Ok(Some(reply))) => match &reply_to {
                    Some(reply_to) => {
                        if let Err(e) = self
                            .send_reply(reply_to, correlation_id.as_deref(), reply)
                            .await
                        {
                            error!(
                                handler = entry.name,
                                message_type = %message_type,
                                error = %e,
                                "failed to send reply"
                            );
                        }
                    }
                    None => debug!(
                        handler = entry.name,
                        message_type = %message_type,
                        "reply discarded, message has no reply address"
                    ),
                },
                Ok(Ok(None)) => {}
                Ok(Err(e)) => error!(
                    handler = entry.name,
                    message_type = %message_type,
                    error = format_args!("{e:#}"),
                    "handler failed"
                ),
                Err(e) => error!(
                    handler = entry.name,
                    message_type = %message_type,
                    error = %e,
                    "handler panicked"
                ),
            }
        }
        Ok(())
    }

    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        let channel = self.supervisor.create_channel().await?;
        let message = OutboundMessage {
            properties: MessageProperties {
                correlation_id: correlation_id.map(str::to_string),
                timestamp: Some(now_millis()),
                persistent: true,
                content_type: Some(CONTENT_TYPE_JSON.into()),
                ..Default::default()
            },
            body,
        };
        let result = channel.publish(DIRECT_EXCHANGE, reply_to, message).await;
        if let Err(e) = channel.close().await {
            trace!(error = %e, "closing reply channel failed");
        }
        result
    }

    /// Stops consuming, fails pending commands, and disposes the supervisor.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let consumer = self.consumer.write().await.take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.channel.close().await {
                trace!(error = %e, "closing consumer channel failed");
            }
        }
        lock(&self.pending).clear();
        self.supervisor.dispose().await;
        info!("message bus disposed");
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn properties(meta: &MessageMeta, reply_to: Option<String>) -> MessageProperties {
    MessageProperties {
        correlation_id: Some(meta.correlation_id.clone()),
        message_type: Some(meta.message_type.clone()),
        timestamp: Some(meta.created_at.timestamp_millis()),
        reply_to,
        persistent: true,
        content_type: Some(CONTENT_TYPE_JSON.into()),
    }
}

async fn consume_loop(
    bus: Weak<MessageBus>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let Some(bus) = bus.upgrade() else { break };
        tokio::spawn(async move {
            if let Err(e) = bus.dispatch(delivery).await {
                warn!(error = %e, "inbound message not handled");
            }
        });
    }
    debug!("consume loop stopped");
}

async fn reply_loop(
    pending: PendingMap,
    mut replies: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = replies.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            trace!("reply without correlation id dropped");
            continue;
        };
        let waiter = lock(&pending).remove(&correlation_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(delivery);
            }
            None => trace!(correlation_id = %correlation_id, "unmatched reply dropped"),
        }
    }
    debug!("reply loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::handler::HandlerFuture;
    use crate::memory::MemoryBroker;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Payload for Ping {}

    struct Counter(Arc<std::sync::atomic::AtomicU32>);

    impl EventHandler<Ping> for Counter {
        fn handle(&self, _event: Ping) -> HandlerFuture<'_, ()> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Panicking;

    impl EventHandler<Ping> for Panicking {
        fn handle(&self, event: Ping) -> HandlerFuture<'_, ()> {
            Box::pin(async move {
                assert!(event.n > 1000, "handler bug");
                Ok(())
            })
        }
    }

    fn bus(broker: &MemoryBroker) -> Arc<MessageBus> {
        let options = BusOptions {
            url: "memory://test".into(),
            client_queue: "agent:test".into(),
            ..Default::default()
        };
        let supervisor = ConnectionSupervisor::new(Arc::new(broker.clone()), &options);
        MessageBus::new(supervisor, options)
    }

    fn delivery(message_type: Option<&str>, routing_key: &str, body: &str) -> Delivery {
        Delivery {
            exchange: String::new(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties: MessageProperties {
                message_type: message_type.map(str::to_string),
                ..Default::default()
            },
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_routing_key() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        bus.register::<Ping, _>(Counter(count.clone())).await.unwrap();

        bus.dispatch(delivery(None, "Ping", r#"{"n":1}"#)).await.unwrap();
        bus.dispatch(delivery(Some(""), "Ping", r#"{"n":1}"#)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_without_handlers_is_no_subscription() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        let err = bus
            .dispatch(delivery(Some("Unknown"), "Unknown", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoSubscriptionFound(t) if t == "Unknown"));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_next_one() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        bus.register::<Ping, _>(Panicking).await.unwrap();
        bus.register::<Ping, _>(Counter(count.clone())).await.unwrap();

        bus.dispatch(delivery(Some("Ping"), "Ping", r#"{"n":1}"#))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_body_is_contained() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        bus.register::<Ping, _>(Counter(count.clone())).await.unwrap();

        bus.dispatch(delivery(Some("Ping"), "Ping", "garbage"))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_entry_is_removed_on_timeout() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Slow;
        impl Payload for Slow {}
        impl CommandPayload for Slow {
            type Reply = ();
        }

        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        bus.init().await.unwrap();
        let cmd = Command::new(Slow)
            .with_destination("nowhere")
            .with_ttl(Duration::from_millis(5));
        assert!(bus.execute(&cmd).await.unwrap_err().is_timeout());
        assert!(lock(&bus.pending).is_empty());
        bus.dispose().await;
    }

    #[tokio::test]
    async fn operations_fail_after_dispose() {
        let broker = MemoryBroker::new();
        let bus = bus(&broker);
        bus.init().await.unwrap();
        bus.dispose().await;
        bus.dispose().await;
        assert!(matches!(
            bus.publish(&Event::new(Ping { n: 1 })).await,
            Err(BusError::Closed)
        ));
        assert_eq!(broker.open_connections(), 0);
    }
}
