// BusDriver implementation: confirmed publish loop and the consume loop

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use tracing::{info, warn};

use flowmq_core::{BusDriver, BusError, DeliveryHandler, Result};

use crate::config::AckPolicy;
use crate::session::AmqpBus;

#[async_trait]
impl BusDriver for AmqpBus {
    /// Publish-with-confirm: re-send on failure after `resend_delay`,
    /// re-send on nack or after `confirm_timeout`, and give up only on the
    /// session's shutdown signal.
    async fn push(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(BusError::NotConnected.into());
        }

        let mut done = self.done_tx.subscribe();
        loop {
            let confirm = match self.try_publish(routing_key, payload).await {
                Ok(confirm) => confirm,
                Err(err) => {
                    warn!(%routing_key, error = %err, "publish failed, retrying");
                    tokio::select! {
                        _ = done.changed() => return Err(BusError::Shutdown.into()),
                        _ = tokio::time::sleep(self.config.resend_delay) => continue,
                    }
                }
            };

            tokio::select! {
                outcome = confirm => match outcome {
                    Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => return Ok(()),
                    Ok(Confirmation::Nack(_)) => {
                        warn!(%routing_key, "publish was nacked, retrying");
                    }
                    Err(err) => {
                        warn!(%routing_key, error = %err, "confirm wait failed, retrying");
                    }
                },
                _ = tokio::time::sleep(self.config.confirm_timeout) => {
                    warn!(%routing_key, "publish not confirmed in time, retrying");
                }
                _ = done.changed() => return Err(BusError::Shutdown.into()),
            }
        }
    }

    /// Single attempt; the broker confirm is left to resolve on its own.
    async fn unsafe_push(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let _confirm = self.try_publish(routing_key, payload).await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        let channel = self.current_channel().await?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BusError::Consume(err.to_string()))?;

        for key in routing_keys {
            info!(queue = %declared.name(), exchange = %self.config.exchange, %key, "binding queue");
            channel
                .queue_bind(
                    declared.name().as_str(),
                    &self.config.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| BusError::Consume(err.to_string()))?;
        }

        let mut deliveries = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BusError::Consume(err.to_string()))?;

        info!(queue, "waiting for messages");
        while let Some(delivery) = deliveries.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %err, "delivery stream failed");
                    return Err(BusError::Consume(err.to_string()).into());
                }
            };

            let outcome = handler.on_delivery(&delivery.data).await;

            let ack_result = match (self.config.ack_policy, &outcome) {
                (AckPolicy::NackOnError { requeue }, Err(_)) => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue,
                            ..Default::default()
                        })
                        .await
                }
                _ => delivery.ack(BasicAckOptions::default()).await,
            };
            if let Err(err) = ack_result {
                warn!(error = %err, "failed to acknowledge delivery");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.done_tx.send(true);

        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            channel
                .close(200, "closing")
                .await
                .map_err(|err| BusError::Close(err.to_string()))?;
        }
        let _ = self.ready_tx.send(false);
        Ok(())
    }
}
