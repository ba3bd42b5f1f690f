//! Shared helpers for integration tests: an in-process scripted broker
//! speaking real MQTT 3.1.1 frames over in-memory pipes.
//!
//! Each call the client makes to `Connector::open` yields a fresh duplex
//! pair; the test receives the broker end and scripts the conversation,
//! byte-accurate, including dropping the stream to simulate a dead path.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use steadfast_mqtt::codec::{ConnAck, Connect, ConnectReturnCode, Packet, QoS, SubAck, Subscribe};
use steadfast_mqtt::transport::{ByteStream, Connector};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const MAX_PACKET: usize = 256 * 1024;

/// Client-side connector that manufactures one pipe per attempt and hands
/// the broker end to the test.
pub struct PipeConnector {
    sessions: mpsc::UnboundedSender<DuplexStream>,
}

pub fn pipe_connector() -> (PipeConnector, mpsc::UnboundedReceiver<DuplexStream>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeConnector { sessions: tx }, rx)
}

#[async_trait]
impl Connector for PipeConnector {
    async fn open(&self) -> io::Result<Box<dyn ByteStream>> {
        let (client, broker) = tokio::io::duplex(16 * 1024);
        self.sessions
            .send(broker)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "broker gone"))?;
        Ok(Box::new(client))
    }
}

/// One scripted broker session.
pub struct BrokerSession {
    stream: DuplexStream,
    inbound: BytesMut,
}

impl BrokerSession {
    /// Consume the CONNECT and accept it.
    pub async fn accept(stream: DuplexStream) -> (Connect, BrokerSession) {
        Self::accept_with(stream, ConnectReturnCode::Accepted, false).await
    }

    /// Consume the CONNECT and answer with an arbitrary return code.
    pub async fn accept_with(
        stream: DuplexStream,
        return_code: ConnectReturnCode,
        session_present: bool,
    ) -> (Connect, BrokerSession) {
        let mut session = BrokerSession {
            stream,
            inbound: BytesMut::new(),
        };
        let connect = match session.read_packet().await {
            Some(Packet::Connect(connect)) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        };
        session
            .write_packet(Packet::ConnAck(ConnAck {
                session_present,
                return_code,
            }))
            .await;
        (connect, session)
    }

    /// Next frame off the wire, `None` on EOF.
    pub async fn read_packet(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.inbound, MAX_PACKET).unwrap() {
                return Some(packet);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.inbound.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn write_packet(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Grant a single-filter SUBSCRIBE at its requested QoS.
    pub async fn grant_subscribe(&mut self, subscribe: &Subscribe) {
        let return_codes = subscribe.filters.iter().map(|(_, qos)| *qos as u8).collect();
        self.write_packet(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await;
    }

    /// Answer everything the way a permissive broker would, until the
    /// client disconnects or the stream closes.
    pub async fn serve_acking(mut self) {
        while let Some(packet) = self.read_packet().await {
            match packet {
                Packet::Publish(publish) => {
                    if let Some(packet_id) = publish.packet_id {
                        self.write_packet(Packet::PubAck { packet_id }).await;
                    }
                }
                Packet::Subscribe(subscribe) => {
                    let codes = subscribe.filters.iter().map(|(_, qos)| *qos as u8).collect();
                    self.write_packet(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        return_codes: codes,
                    }))
                    .await;
                }
                Packet::Unsubscribe(unsubscribe) => {
                    self.write_packet(Packet::UnsubAck {
                        packet_id: unsubscribe.packet_id,
                    })
                    .await;
                }
                Packet::PingReq => self.write_packet(Packet::PingResp).await,
                Packet::Disconnect => return,
                other => panic!("client sent an unexpected {}", other.name()),
            }
        }
    }
}

pub async fn expect_subscribe(session: &mut BrokerSession) -> Subscribe {
    match session.read_packet().await {
        Some(Packet::Subscribe(subscribe)) => subscribe,
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }
}

pub async fn expect_publish(session: &mut BrokerSession) -> steadfast_mqtt::codec::Publish {
    match session.read_packet().await {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

/// Serve every future session permissively in the background.
pub fn serve_all_sessions(mut sessions: mpsc::UnboundedReceiver<DuplexStream>) {
    tokio::spawn(async move {
        while let Some(stream) = sessions.recv().await {
            tokio::spawn(async move {
                let (_, session) = BrokerSession::accept(stream).await;
                session.serve_acking().await;
            });
        }
    });
}

/// Options pointing at a fake broker; the URL never gets dialed because
/// tests install a [`PipeConnector`].
pub fn test_options(client_id: &str) -> steadfast_mqtt::MqttOptions {
    steadfast_mqtt::MqttOptions::new("mqtt://broker.test")
        .client_id(client_id)
        .keepalive(std::time::Duration::from_secs(60))
}

/// Subscribes the client to `foo_topic` at QoS 1, the shape of a typical
/// connected hook.
pub fn subscribe_foo_on_connect(
    builder: steadfast_mqtt::MqttClientBuilder,
) -> steadfast_mqtt::MqttClientBuilder {
    builder.on_connected(|client| async move {
        let _ = client.subscribe("foo_topic", QoS::AtLeastOnce).await;
    })
}
