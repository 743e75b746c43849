use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::topology::ExchangeKind;
use crate::transport::{Broker, BrokerChannel, QueueArguments, RawDelivery, WireMessage};

const PERSISTENT: u8 = 2;

/// AMQP 0-9-1 broker reached through `lapin`.
///
/// Every [`connect`](Broker::connect) opens a dedicated connection with a
/// single channel, so tenants never share a connection.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    config: BrokerConfig,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip_all, fields(vhost = %vhost))]
    async fn connect(&self, vhost: &str) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let uri = self.config.amqp_uri(vhost);
        info!(host = %self.config.host, port = self.config.amqp_port, "opening AMQP connection");

        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let connection =
            tokio::time::timeout(timeout, Connection::connect(&uri, ConnectionProperties::default()))
                .await
                .map_err(|_| TransportError::Timeout(vhost.to_string()))??;
        let channel = connection.create_channel().await?;
        debug!(channel_id = channel.id(), "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            vhost: vhost.to_string(),
            connection,
            channel,
        }))
    }
}

struct AmqpChannel {
    vhost: String,
    connection: Connection,
    channel: Channel,
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::ShortShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn queue_table(args: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(dlx) = &args.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.clone())),
        );
    }
    if let Some(expires) = args.expires {
        let millis = i32::try_from(expires.as_millis()).unwrap_or(i32::MAX);
        table.insert(ShortString::from("x-expires"), AMQPValue::LongInt(millis));
    }
    table
}

fn properties(message: &WireMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut props = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    if let Some(ct) = &message.content_type {
        props = props.with_content_type(ShortString::from(ct.clone()));
    }
    if let Some(id) = &message.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(ts) = message.timestamp {
        props = props.with_timestamp(ts);
    }
    props
}

fn wire_message(body: Vec<u8>, props: &BasicProperties) -> WireMessage {
    let headers: BTreeMap<String, String> = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| header_value(v).map(|v| (k.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    WireMessage {
        body,
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers,
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *props.timestamp(),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_table(args),
            )
            .await?;
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        let props = properties(&message);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                props,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>, TransportError> {
        let Some(msg) = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?
        else {
            return Ok(None);
        };
        let delivery = msg.delivery;
        let message = wire_message(delivery.data, &delivery.properties);
        Ok(Some(RawDelivery {
            tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            message,
        }))
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u32, TransportError> {
        Ok(self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "OK").await {
                warn!(vhost = %self.vhost, error = %e, "failed to close AMQP channel");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await?;
        }
        debug!(vhost = %self.vhost, "AMQP connection closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
