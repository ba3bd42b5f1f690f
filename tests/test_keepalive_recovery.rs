//! Keepalive behavior against a silent broker: pings go out on an idle
//! session, and sustained inbound silence tears the session down and
//! triggers a reconnect.

mod test_helpers;

use steadfast_mqtt::codec::Packet;
use steadfast_mqtt::{MqttClient, QoS};
use test_helpers::{pipe_connector, test_options, BrokerSession};

#[tokio::test(start_paused = true)]
async fn test_silent_broker_triggers_reconnect() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("keepalive-test"))
        .connector(connector)
        .build()
        .unwrap();

    let (connected, mut first) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    // An idle session gets pinged well before the keepalive expires.
    assert!(matches!(first.read_packet().await, Some(Packet::PingReq)));

    // Never answer. The client declares the stream dead and redials.
    let stream = sessions.recv().await.unwrap();
    let (_, second) = BrokerSession::accept(stream).await;
    tokio::spawn(second.serve_acking());

    // Fully functional on the new session.
    client
        .publish("result", QoS::AtLeastOnce, false, "back again")
        .await
        .unwrap();
    assert!(client.is_connected());

    client.disconnect().await;
}
