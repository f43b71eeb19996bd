//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! Exchanges are direct and durable. Replies use RabbitMQ direct reply-to:
//! every channel consumes the `amq.rabbitmq.reply-to` pseudo-queue, and the
//! broker routes replies back to the channel that published the request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::BusError;
use crate::transport::{
    BrokerFuture, Channel, ConnectParams, Connection, ConnectionFault, Delivery, FaultNotifier,
    MessageProperties, OutboundMessage, QueueSpec, Transport,
};

/// The RabbitMQ pseudo-queue for direct replies.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

fn transport_error(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

/// Connects to a RabbitMQ-compatible broker.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom connection properties, e.g. a connection name.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

/// Parses the broker URL, replacing its user info with explicit credentials.
fn broker_uri(params: &ConnectParams) -> Result<AMQPUri, BusError> {
    let mut uri: AMQPUri = params
        .url
        .parse()
        .map_err(|e: String| BusError::Transport(format!("invalid broker url: {e}")))?;
    if let Some(username) = &params.username {
        uri.authority.userinfo.username = username.clone();
    }
    if let Some(password) = &params.password {
        uri.authority.userinfo.password = password.clone();
    }
    Ok(uri)
}

/// Classifies an asynchronous connection error.
fn fault_for(error: &lapin::Error) -> ConnectionFault {
    let reason = error.to_string();
    match error {
        lapin::Error::IOError(_)
        | lapin::Error::ProtocolError(_)
        | lapin::Error::MissingHeartbeatError
        | lapin::Error::InvalidConnectionState(_) => ConnectionFault::Shutdown { reason },
        _ => ConnectionFault::CallbackError { reason },
    }
}

impl Transport for AmqpTransport {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
        faults: FaultNotifier,
    ) -> BrokerFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let uri = broker_uri(params)?;
            let host = format!("{}:{}", uri.authority.host, uri.authority.port);
            let connection = lapin::Connection::connect_uri(uri, self.properties.clone())
                .await
                .map_err(transport_error)?;

            let closing = Arc::new(AtomicBool::new(false));
            let closed_by_us = closing.clone();
            connection.on_error(move |error| {
                if closed_by_us.load(Ordering::SeqCst) {
                    return;
                }
                let fault = fault_for(&error);
                warn!(generation = faults.generation(), %fault, "amqp connection fault");
                faults.notify(fault);
            });

            debug!(%host, "amqp connection opened");
            let connection: Arc<dyn Connection> = Arc::new(AmqpConnection {
                inner: connection,
                closing,
            });
            Ok(connection)
        })
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    closing: Arc<AtomicBool>,
}

impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn Channel>> {
        Box::pin(async move {
            let channel = self.inner.create_channel().await.map_err(transport_error)?;
            trace!(channel = channel.id(), "amqp channel opened");
            let channel: Arc<dyn Channel> = Arc::new(AmqpChannel { inner: channel });
            Ok(channel)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.closing.store(true, Ordering::SeqCst);
            if !self.is_open() {
                return Ok(());
            }
            self.inner.close(200, "OK").await.map_err(transport_error)
        })
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    /// Starts a no-ack consumer and forwards its deliveries until either side
    /// goes away.
    async fn start_consumer(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError> {
        let tag = format!("repeater-{}", uuid::Uuid::new_v4().simple());
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if tx.send(from_lapin(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%queue, error = %e, "amqp consumer ended");
                        break;
                    }
                }
            }
            trace!(%queue, consumer = %tag, "amqp consumer stopped");
        });
        Ok(rx)
    }
}

impl Channel for AmqpChannel {
    fn declare_exchange<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.inner
                .exchange_declare(
                    name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(transport_error)
        })
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, String> {
        Box::pin(async move {
            let queue = self
                .inner
                .queue_declare(&spec.name, queue_options(spec), FieldTable::default())
                .await
                .map_err(transport_error)?;
            Ok(queue.name().as_str().to_string())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.inner
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transport_error)
        })
    }

    fn unbind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.inner
                .queue_unbind(queue, exchange, routing_key, FieldTable::default())
                .await
                .map_err(transport_error)
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: OutboundMessage,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let confirm = self
                .inner
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    to_lapin(&message.properties),
                )
                .await
                .map_err(transport_error)?;
            confirm.await.map_err(transport_error)?;
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, mpsc::UnboundedReceiver<Delivery>> {
        Box::pin(self.start_consumer(queue))
    }

    fn reply_address(&self) -> &str {
        DIRECT_REPLY_TO
    }

    fn consume_replies(&self) -> BrokerFuture<'_, mpsc::UnboundedReceiver<Delivery>> {
        Box::pin(self.start_consumer(DIRECT_REPLY_TO))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.inner.status().connected() {
                return Ok(());
            }
            self.inner.close(200, "OK").await.map_err(transport_error)
        })
    }
}

fn queue_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        ..Default::default()
    }
}

/// AMQP timestamps are whole seconds; ours are milliseconds.
fn to_lapin(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(kind) = &props.message_type {
        out = out.with_kind(ShortString::from(kind.as_str()));
    }
    if let Some(millis) = props.timestamp {
        out = out.with_timestamp(u64::try_from(millis / 1000).unwrap_or_default());
    }
    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if props.persistent {
        out = out.with_delivery_mode(PERSISTENT);
    }
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(ShortString::from(content_type.as_str()));
    }
    out
}

fn from_lapin_properties(props: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        correlation_id: text(props.correlation_id()),
        message_type: text(props.kind()),
        timestamp: (*props.timestamp())
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| secs.saturating_mul(1000)),
        reply_to: text(props.reply_to()),
        persistent: *props.delivery_mode() == Some(PERSISTENT),
        content_type: text(props.content_type()),
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_lapin_properties(&delivery.properties),
        body: delivery.data,
    }
}
