// Bus port
//
// The engine publishes start messages and consumes deliveries through this
// contract. Drivers own connection management, exchange/queue declaration
// and acknowledgement; the engine never sees broker primitives.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Callback the driver invokes once per delivery, sequentially.
///
/// The returned result reports whether the delivery was fully processed;
/// drivers use it only to apply their acknowledgement policy. Returning an
/// error never requests a retry by itself.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, body: &[u8]) -> Result<()>;
}

/// Driver contract for a topic-routed message bus
///
/// Implementations can:
/// - Speak AMQP to a real broker for production
/// - Record publishes in memory for tests and examples
#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Publish with confirmation. Blocks (retrying internally) until the
    /// broker confirms, and fails fast with `NotConnected` when no channel
    /// is ready or `Shutdown` when the driver is going down.
    async fn push(&self, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Single publish attempt with no confirmation wait.
    async fn unsafe_push(&self, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Declare a durable queue, bind it to every routing key, then deliver
    /// bodies to `handler` one at a time until the driver closes. Delivery
    /// is at-least-once.
    async fn consume(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()>;

    /// Tear the connection down.
    async fn close(&self) -> Result<()>;
}
