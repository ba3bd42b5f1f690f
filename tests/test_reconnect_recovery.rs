//! Reconnection recovery: republish of unacknowledged QoS 1 messages and
//! restoration of subscriptions, in the right order, on a fresh session.

mod test_helpers;

use std::time::Duration;
use steadfast_mqtt::codec::{ConnectReturnCode, Packet};
use steadfast_mqtt::{ConnectError, MqttClient, QoS, ReconnectConfig};
use test_helpers::{expect_publish, expect_subscribe, pipe_connector, test_options, BrokerSession};
use tokio::sync::mpsc;

/// A QoS 1 publish whose session dies before the PUBACK arrives is re-sent
/// on the next session with the DUP flag and the same packet id, after the
/// subscription set has been restored, and the caller's `publish` call
/// resolves only then.
#[tokio::test]
async fn test_unacked_publish_survives_session_loss() {
    let (connector, mut sessions) = pipe_connector();
    let (subscribed_tx, mut subscribed_rx) = mpsc::channel::<()>(4);

    let client = MqttClient::builder(test_options("range-test"))
        .connector(connector)
        .on_connected(move |client| {
            let subscribed_tx = subscribed_tx.clone();
            async move {
                client
                    .subscribe("foo_topic", QoS::AtLeastOnce)
                    .await
                    .expect("subscribe should be granted");
                let _ = subscribed_tx.send(()).await;
            }
        })
        .build()
        .unwrap();

    // First session: handshake, grant the hook's subscription.
    let (connected, mut first) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    let subscribe = expect_subscribe(&mut first).await;
    assert_eq!(subscribe.filters[0].0, "foo_topic");
    first.grant_subscribe(&subscribe).await;
    subscribed_rx.recv().await.unwrap();

    // The publish under test: read it off the wire, then kill the session
    // without acknowledging.
    let publisher = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .publish("result", QoS::AtLeastOnce, false, "0 repubs: 0")
                .await
        }
    });
    let publish = expect_publish(&mut first).await;
    assert!(!publish.dup);
    let packet_id = publish.packet_id.expect("QoS 1 publish carries an id");
    drop(first);

    assert!(!publisher.is_finished(), "publish must wait for the ack");

    // Second session: resubscription first, then the replayed publish.
    let stream = sessions.recv().await.unwrap();
    let (_, mut second) = BrokerSession::accept(stream).await;

    let resubscribe = expect_subscribe(&mut second).await;
    assert_eq!(resubscribe.filters[0].0, "foo_topic");
    second.grant_subscribe(&resubscribe).await;

    let republished = expect_publish(&mut second).await;
    assert!(republished.dup, "replayed publish must carry the DUP flag");
    assert_eq!(republished.packet_id, Some(packet_id));
    assert_eq!(republished.payload, publish.payload);
    second
        .write_packet(Packet::PubAck { packet_id })
        .await;

    publisher.await.unwrap().expect("acknowledged at last");
    assert_eq!(client.republish_count(), 1);

    // The connected hook subscribes again on every session.
    let hook_subscribe = expect_subscribe(&mut second).await;
    second.grant_subscribe(&hook_subscribe).await;
    subscribed_rx.recv().await.unwrap();

    client.disconnect().await;
}

/// `connect` reports the first attempt's failure but the engine keeps
/// retrying in the background.
#[tokio::test]
async fn test_first_attempt_refusal_is_reported_but_retried() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("retry-test"))
        .connector(connector)
        .reconnect(ReconnectConfig {
            initial_ms: 10,
            multiplier: 2,
            cap_ms: 100,
        })
        .build()
        .unwrap();

    let broker = tokio::spawn(async move {
        let stream = sessions.recv().await.unwrap();
        let _ = BrokerSession::accept_with(stream, ConnectReturnCode::ServerUnavailable, false)
            .await;

        let stream = sessions.recv().await.unwrap();
        let (_, session) = BrokerSession::accept(stream).await;
        session.serve_acking().await;
    });

    let result = client.connect().await;
    assert!(matches!(
        result,
        Err(ConnectError::Refused(ConnectReturnCode::ServerUnavailable))
    ));

    // Retried in the background; delivery works once the broker relents.
    client
        .publish("result", QoS::AtLeastOnce, false, "hello")
        .await
        .unwrap();
    assert!(client.is_connected());

    client.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), broker).await;
}
