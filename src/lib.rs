//! steadfast-mqtt - a resilient asynchronous MQTT 3.1.1 client
//!
//! Built for devices on links that drop: the client reconnects on its own,
//! re-establishes subscriptions, and re-sends unacknowledged QoS 1
//! publishes, so application code sees outages only as latency.
//!
//! # Overview
//!
//! This crate provides:
//! - An MQTT 3.1.1 wire codec (QoS 0 and 1)
//! - A background reconnection supervisor with bounded exponential backoff
//! - Keepalive pings and dead-stream detection
//! - At-least-once delivery that survives reconnects, with a republish
//!   counter for observing link quality
//! - An optional link-availability signal to gate connection attempts on
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use steadfast_mqtt::{MqttClient, MqttOptions, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = MqttOptions::new("mqtt://broker.local")
//!         .client_id("sensor-42")
//!         .clean_session(false);
//!
//!     let client = MqttClient::builder(options)
//!         .on_message(|topic, payload| {
//!             println!("{topic}: {payload:?}");
//!         })
//!         .on_connected(|client| async move {
//!             let _ = client.subscribe("commands/sensor-42", QoS::AtLeastOnce).await;
//!         })
//!         .build()?;
//!
//!     client.connect().await?;
//!     // Suspends until the broker acknowledges, across reconnects.
//!     client.publish("readings", QoS::AtLeastOnce, false, "21.5").await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod telemetry;
pub mod transport;

pub use client::{MqttClient, MqttClientBuilder};
pub use codec::QoS;
pub use config::{Credentials, MqttOptions, ReconnectConfig, Will};
pub use error::{ConnectError, PublishError, SubscribeError};
pub use link::{LinkHandle, LinkMonitor};
