// Reconnecting broker session
//
// A background task owns the connection lifecycle: connect, open one
// channel, enable publisher confirms, declare the exchange, then park until
// the connection drops or the session is closed. Callers observe readiness
// through a watch flag and fail fast while the session is down.

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{info, warn};

use flowmq_core::BusError;

use crate::config::AmqpConfig;

/// Shared AMQP session implementing the engine's bus port
pub struct AmqpBus {
    pub(crate) config: AmqpConfig,
    pub(crate) channel: RwLock<Option<Channel>>,
    pub(crate) ready_tx: watch::Sender<bool>,
    pub(crate) ready_rx: watch::Receiver<bool>,
    pub(crate) done_tx: watch::Sender<bool>,
}

impl AmqpBus {
    /// Start a session. Connecting happens in the background; use
    /// `wait_ready` before the first publish.
    pub fn new(config: AmqpConfig) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        let bus = Arc::new(AmqpBus {
            config,
            channel: RwLock::new(None),
            ready_tx,
            ready_rx,
            done_tx,
        });

        let session = Arc::clone(&bus);
        tokio::spawn(async move { session.run().await });
        bus
    }

    /// True once a confirmed channel is usable.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Block until the session is ready, or give up after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_rx.clone();
        let became_ready = async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        matches!(tokio::time::timeout(timeout, became_ready).await, Ok(true))
    }

    async fn run(&self) {
        let mut done = self.done_tx.subscribe();
        loop {
            if *done.borrow_and_update() {
                return;
            }

            match self.connect_once().await {
                Ok(connection) => {
                    info!(exchange = %self.config.exchange, "connected to broker");
                    let _ = self.ready_tx.send(true);

                    let lost = Arc::new(Notify::new());
                    let notifier = Arc::clone(&lost);
                    connection.on_error(move |err| {
                        warn!(error = %err, "broker connection lost");
                        notifier.notify_one();
                    });

                    tokio::select! {
                        _ = lost.notified() => {
                            let _ = self.ready_tx.send(false);
                            *self.channel.write().await = None;
                        }
                        _ = done.changed() => {
                            let _ = self.ready_tx.send(false);
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to connect to broker, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        _ = done.changed() => return,
                    }
                }
            }
        }
    }

    /// One connection attempt: connection, channel, confirms, exchange.
    async fn connect_once(&self) -> Result<Connection, lapin::Error> {
        let connection = Connection::connect(
            &self.config.url,
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio),
        )
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        // The amq.* exchanges are broker-owned and cannot be redeclared.
        if !self.config.exchange.starts_with("amq.") {
            channel
                .exchange_declare(
                    &self.config.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        *self.channel.write().await = Some(channel);
        Ok(connection)
    }

    /// One publish attempt on the current channel. Messages are persistent
    /// JSON; the returned confirm is the caller's to await (or drop).
    pub(crate) async fn try_publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PublisherConfirm, BusError> {
        let guard = self.channel.read().await;
        let channel = guard.as_ref().ok_or(BusError::NotConnected)?;

        channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|err| BusError::Publish(err.to_string()))
    }

    pub(crate) async fn current_channel(&self) -> Result<Channel, BusError> {
        self.channel
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(BusError::NotConnected)
    }
}
