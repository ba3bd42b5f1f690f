//! Shutdown semantics: graceful DISCONNECT versus will-preserving close,
//! idempotency, and cancellation of suspended callers.

mod test_helpers;

use std::time::Duration;
use steadfast_mqtt::codec::Packet;
use steadfast_mqtt::{MqttClient, PublishError, QoS};
use test_helpers::{expect_publish, pipe_connector, test_options, BrokerSession};

/// `disconnect` sends exactly one DISCONNECT then closes the stream, and a
/// second call is a no-op.
#[tokio::test]
async fn test_disconnect_sends_one_disconnect_and_is_idempotent() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("bye-test"))
        .connector(connector)
        .build()
        .unwrap();

    let (connected, mut session) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    client.disconnect().await;
    client.disconnect().await;

    assert!(matches!(
        session.read_packet().await,
        Some(Packet::Disconnect)
    ));
    assert!(session.read_packet().await.is_none(), "then EOF");
    assert!(!client.is_connected());

    // No further connection attempts are made.
    let redial = tokio::time::timeout(Duration::from_millis(200), sessions.recv()).await;
    assert!(redial.is_err());
}

/// `close` skips the DISCONNECT so the broker publishes the will.
#[tokio::test]
async fn test_close_skips_disconnect() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("will-test"))
        .connector(connector)
        .build()
        .unwrap();

    let (connected, mut session) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    client.close().await;
    assert!(
        session.read_packet().await.is_none(),
        "stream must end without a DISCONNECT"
    );
}

/// Requests still waiting for an acknowledgement resolve with a
/// cancellation error when the client shuts down.
#[tokio::test]
async fn test_shutdown_cancels_pending_requests() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("cancel-test"))
        .connector(connector)
        .build()
        .unwrap();

    let (connected, mut session) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    let publisher = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .publish("result", QoS::AtLeastOnce, false, "never acked")
                .await
        }
    });
    let _ = expect_publish(&mut session).await;

    client.disconnect().await;
    assert_eq!(publisher.await.unwrap(), Err(PublishError::Cancelled));
}
