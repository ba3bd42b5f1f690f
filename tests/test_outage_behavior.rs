//! Behavior through link outages: QoS 0 suspension, link hook ordering,
//! and caller deadlines on QoS 1 delivery.

mod test_helpers;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use steadfast_mqtt::codec::Packet;
use steadfast_mqtt::{LinkMonitor, MqttClient, PublishError, QoS};
use test_helpers::{
    expect_publish, pipe_connector, serve_all_sessions, test_options, BrokerSession,
};

/// A QoS 0 publish made while the link is down suspends until a session is
/// up again, then goes out exactly once.
#[tokio::test]
async fn test_qos0_publish_suspends_through_outage() {
    let (connector, mut sessions) = pipe_connector();
    let (link, link_handle) = LinkMonitor::new(true);
    let client = MqttClient::builder(test_options("qos0-test"))
        .connector(connector)
        .link(link)
        .build()
        .unwrap();

    let (connected, mut first) = tokio::join!(client.connect(), async {
        let stream = sessions.recv().await.unwrap();
        BrokerSession::accept(stream).await.1
    });
    connected.unwrap();

    // Outage: the supervisor tears the session down.
    link_handle.set_available(false);
    assert!(first.read_packet().await.is_none(), "session must be closed");

    let publisher = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .publish("result", QoS::AtMostOnce, false, "fire and forget")
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!publisher.is_finished(), "publish must wait out the outage");

    // Link restored, fresh session.
    link_handle.set_available(true);
    let stream = sessions.recv().await.unwrap();
    let (_, mut second) = BrokerSession::accept(stream).await;

    let publish = expect_publish(&mut second).await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
    publisher.await.unwrap().unwrap();

    // Exactly once: nothing further is queued for this session.
    let extra = tokio::time::timeout(Duration::from_millis(200), second.read_packet()).await;
    assert!(extra.is_err(), "QoS 0 must not be replayed");

    client.close().await;
}

/// Link transitions reach the application hook in order, one at a time.
#[tokio::test]
async fn test_link_hook_sees_transitions_in_order() {
    let (connector, sessions) = pipe_connector();
    serve_all_sessions(sessions);

    let (link, link_handle) = LinkMonitor::new(true);
    let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = events.clone();

    let client = MqttClient::builder(test_options("flap-test"))
        .connector(connector)
        .link(link)
        .on_link_change(move |up| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(up);
            }
        })
        .build()
        .unwrap();
    client.connect().await.unwrap();

    for state in [false, true, false] {
        link_handle.set_available(state);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(*events.lock().unwrap(), vec![false, true, false]);
    client.close().await;
}

/// `publish_with_timeout` withdraws the message on deadline: the late
/// acknowledgement is ignored, the packet id is recycled, and the message
/// is never replayed onto a later session.
#[tokio::test]
async fn test_publish_deadline_withdraws_message() {
    let (connector, mut sessions) = pipe_connector();
    let client = MqttClient::builder(test_options("deadline-test"))
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
                .publish_with_timeout(
                    "result",
                    QoS::AtLeastOnce,
                    false,
                    "too slow",
                    Duration::from_millis(200),
                )
                .await
        }
    });
    let first = expect_publish(&mut session).await;
    let first_id = first.packet_id.unwrap();

    // No ack within the deadline.
    let result = publisher.await.unwrap();
    assert_eq!(result, Err(PublishError::Timeout));

    // A late ack is tolerated and the session stays healthy.
    session
        .write_packet(Packet::PubAck {
            packet_id: first_id,
        })
        .await;

    let publisher = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .publish("result", QoS::AtLeastOnce, false, "in time")
                .await
        }
    });
    let second = expect_publish(&mut session).await;
    assert_ne!(second.packet_id, Some(first_id));
    session
        .write_packet(Packet::PubAck {
            packet_id: second.packet_id.unwrap(),
        })
        .await;
    publisher.await.unwrap().unwrap();

    // The withdrawn message must not come back after a reconnect.
    drop(session);
    let stream = sessions.recv().await.unwrap();
    let (_, mut next) = BrokerSession::accept(stream).await;
    let replay = tokio::time::timeout(Duration::from_millis(200), next.read_packet()).await;
    assert!(replay.is_err(), "withdrawn publish must not be replayed");

    client.close().await;
}
