// RabbitMQ driver for the flowmq bus port
//
// `AmqpBus::new` spawns the reconnecting session and returns immediately;
// publishing fails fast with `NotConnected` until `wait_ready` reports the
// channel usable. Queues are durable, messages persistent, acks manual.

pub mod config;
mod driver;
pub mod session;

pub use config::{AckPolicy, AmqpConfig};
pub use session::AmqpBus;
