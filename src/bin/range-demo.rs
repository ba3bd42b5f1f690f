//! Wireless range test demo.
//!
//! Connects to a broker, subscribes to `foo_topic`, and publishes
//! connection statistics to `result` every five seconds. When the path to
//! the broker degrades, the publish loop simply pauses for the duration of
//! the outage and the republish counter climbs; watching the `result`
//! stream from the broker side shows how flaky the link really is.
//!
//! Configuration via environment:
//! - `BROKER_URL`: e.g. `mqtt://192.168.0.9` (default `mqtt://localhost`)
//! - `CLIENT_ID`: optional fixed client id

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use steadfast_mqtt::{telemetry, MqttClient, MqttOptions, QoS, Will};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_default_logging();

    let broker_url = env::var("BROKER_URL").unwrap_or_else(|_| "mqtt://localhost".to_string());
    let mut options = MqttOptions::new(&broker_url)
        .clean_session(false)
        .keepalive(Duration::from_secs(120))
        .will(Will {
            topic: "result".to_string(),
            payload: "Goodbye cruel world!".into(),
            qos: QoS::AtMostOnce,
            retain: false,
        });
    if let Ok(client_id) = env::var("CLIENT_ID") {
        options = options.client_id(client_id);
    }

    let outages = Arc::new(AtomicU64::new(0));
    let outage_counter = outages.clone();

    let client = MqttClient::builder(options)
        .on_message(|topic, payload| {
            info!(topic = %topic, payload = %String::from_utf8_lossy(&payload), "message");
        })
        .on_link_change(move |up| {
            let outages = outage_counter.clone();
            async move {
                if up {
                    info!("link is up");
                } else {
                    outages.fetch_add(1, Ordering::Relaxed);
                    info!("link is down");
                }
            }
        })
        .on_connected(|client| async move {
            let _ = client.subscribe("foo_topic", QoS::AtLeastOnce).await;
        })
        .build()?;

    client.connect().await?;

    let mut n: u64 = 0;
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = format!(
            "{} repubs: {} outages: {}",
            n,
            client.republish_count(),
            outages.load(Ordering::Relaxed)
        );
        info!(n, "publishing");
        // If the broker is unreachable this pauses for the outage.
        client.publish("result", QoS::AtLeastOnce, false, stats).await?;
        n += 1;
    }
}
