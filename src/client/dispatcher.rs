//! Inbound dispatcher
//!
//! One task per live session that owns the frame reader. Application
//! messages are handed to the message hook, QoS 1 deliveries are
//! acknowledged, and broker acknowledgements complete entries in the
//! pending table. The loop ends when the stream dies or the broker sends
//! something a client must never receive.

use crate::client::keepalive::Activity;
use crate::client::outbound::{AckResult, PendingTable, RequestKind};
use crate::codec::{Packet, ProtocolError, QoS};
use crate::error::SessionFault;
use crate::transport::FrameReader;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(crate) type MessageHook = Arc<dyn Fn(String, bytes::Bytes) + Send + Sync>;

pub(crate) struct Dispatcher {
    pub(crate) reader: FrameReader,
    pub(crate) activity: Arc<Activity>,
    pub(crate) pending: Arc<Mutex<PendingTable>>,
    pub(crate) subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub(crate) outbound: mpsc::Sender<Packet>,
    pub(crate) on_message: MessageHook,
    pub(crate) faults: mpsc::Sender<SessionFault>,
}

impl Dispatcher {
    /// Read frames until the session dies. Exactly one fault is reported
    /// per exit, except when the outbound channel already closed (teardown
    /// is then someone else's doing).
    ///
    /// Messages reach the callback in arrival order through a bounded
    /// delivery queue. A slow callback leaves frame decoding unaffected
    /// until the queue fills, after which it backpressures the whole
    /// session; a panicking callback loses that one delivery and the queue
    /// moves on. If the delivery task itself dies, the session is faulted
    /// rather than left up with acknowledgement handling stopped.
    pub(crate) async fn run(mut self) {
        let (deliver_tx, mut deliver_rx) = mpsc::channel::<(String, bytes::Bytes)>(64);
        let hook = self.on_message.clone();
        tokio::spawn(async move {
            while let Some((topic, payload)) = deliver_rx.recv().await {
                let call = std::panic::AssertUnwindSafe(|| hook(topic, payload));
                if std::panic::catch_unwind(call).is_err() {
                    warn!("message hook panicked; message dropped");
                }
            }
        });

        loop {
            let packet = match self.reader.read_packet().await {
                Ok(packet) => packet,
                Err(fault) => {
                    let _ = self.faults.send(fault).await;
                    return;
                }
            };
            self.activity.touch_recv();

            match packet {
                Packet::Publish(publish) => {
                    trace!(topic = %publish.topic, len = publish.payload.len(), "inbound message");
                    // The decoder guarantees a packet id on QoS 1 frames.
                    let ack = match (publish.qos, publish.packet_id) {
                        (QoS::AtLeastOnce, Some(packet_id)) => Some(Packet::PubAck { packet_id }),
                        _ => None,
                    };
                    if deliver_tx
                        .send((publish.topic, publish.payload))
                        .await
                        .is_err()
                    {
                        let _ = self.faults.send(SessionFault::DeliveryHalted).await;
                        return;
                    }
                    if let Some(ack) = ack {
                        if self.outbound.send(ack).await.is_err() {
                            return;
                        }
                    }
                }
                Packet::PubAck { packet_id } => {
                    self.complete(packet_id, AckResult::Done);
                }
                Packet::SubAck(ack) => {
                    let result = match ack.any_rejected() {
                        Some(code) => AckResult::SubRejected(code),
                        None => {
                            AckResult::SubGranted(ack.return_codes.first().copied().unwrap_or(0))
                        }
                    };
                    let granted = matches!(result, AckResult::SubGranted(_));
                    if let Some(entry) = self.complete(ack.packet_id, result) {
                        if granted {
                            if let RequestKind::Subscribe { filter, qos } = entry {
                                self.remember_subscription(filter, qos);
                            }
                        }
                    }
                }
                Packet::UnsubAck { packet_id } => {
                    self.complete(packet_id, AckResult::Done);
                }
                Packet::PingResp => {
                    trace!("pong");
                }
                other => {
                    warn!(packet = other.name(), "broker sent a client-only packet");
                    let _ = self
                        .faults
                        .send(SessionFault::Protocol(ProtocolError::UnexpectedPacket(
                            other.name(),
                        )))
                        .await;
                    return;
                }
            }
        }
    }

    /// Complete a pending entry, returning its request kind. An unknown
    /// identifier is logged and ignored; it is the normal aftermath of an
    /// abandoned request whose acknowledgement arrived late.
    fn complete(&self, packet_id: u16, result: AckResult) -> Option<RequestKind> {
        let entry = self.pending.lock().unwrap().complete(packet_id, result);
        match entry {
            Some(entry) => Some(entry.kind),
            None => {
                debug!(packet_id, "acknowledgement for an unknown packet id");
                None
            }
        }
    }

    /// Record a granted subscription for resubscription after reconnects.
    fn remember_subscription(&self, filter: String, qos: QoS) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(existing) = subscriptions.iter_mut().find(|(f, _)| *f == filter) {
            existing.1 = qos;
        } else {
            subscriptions.push((filter, qos));
        }
    }
}
