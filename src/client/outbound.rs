//! Outbound delivery bookkeeping
//!
//! The pending-request table is the shared heart of at-least-once delivery:
//! publishers register entries and suspend on a per-entry watch slot, the
//! inbound dispatcher completes entries when acknowledgements arrive, and
//! the reconnection supervisor re-sends whatever was on the wire when a
//! session died. Packet identifiers are a small arena: allocated on
//! registration, recycled only on acknowledgement or explicit abandonment.

use crate::codec::{Packet, Publish, QoS, Subscribe, Unsubscribe};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

/// Protocol ceiling on concurrently pending identifiers (16-bit, zero
/// excluded).
const MAX_IN_FLIGHT: usize = u16::MAX as usize;

/// What a pending entry is waiting for.
#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
}

/// Completion value delivered through an entry's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckResult {
    /// PUBACK or UNSUBACK observed.
    Done,
    /// SUBACK observed with this granted QoS byte.
    SubGranted(u8),
    /// SUBACK observed with a failure return code.
    SubRejected(u8),
}

/// State visible to a suspended caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotSignal {
    Pending,
    Completed(AckResult),
    /// Client shut down; the request will never complete.
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) packet_id: u16,
    pub(crate) kind: RequestKind,
    /// True once the frame has been handed to a session writer; from then
    /// on re-sending after reconnection is the supervisor's job.
    pub(crate) sent: bool,
    /// Set on every supervisor re-send of a publish.
    pub(crate) dup: bool,
    /// Resubscription entries issued by the supervisor itself have no
    /// waiter; they are simply dropped on acknowledgement.
    pub(crate) detached: bool,
    slot: watch::Sender<SlotSignal>,
}

impl Entry {
    /// Wire frame for this entry's current state.
    pub(crate) fn to_packet(&self) -> Packet {
        match &self.kind {
            RequestKind::Publish {
                topic,
                payload,
                qos,
                retain,
            } => Packet::Publish(Publish {
                topic: topic.clone(),
                payload: payload.clone(),
                qos: *qos,
                packet_id: Some(self.packet_id),
                dup: self.dup,
                retain: *retain,
            }),
            RequestKind::Subscribe { filter, qos } => Packet::Subscribe(Subscribe {
                packet_id: self.packet_id,
                filters: vec![(filter.clone(), *qos)],
            }),
            RequestKind::Unsubscribe { filter } => Packet::Unsubscribe(Unsubscribe {
                packet_id: self.packet_id,
                filters: vec![filter.clone()],
            }),
        }
    }

    pub(crate) fn is_publish(&self) -> bool {
        matches!(self.kind, RequestKind::Publish { .. })
    }
}

/// Table of requests awaiting broker acknowledgement, ordered by
/// submission so reconnection re-sends preserve per-topic wire order.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: BTreeMap<u64, Entry>,
    by_packet_id: HashMap<u16, u64>,
    next_seq: u64,
    next_packet_id: u16,
}

/// Handle a suspended caller uses to observe its entry.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub(crate) seq: u64,
    pub(crate) packet_id: u16,
    pub(crate) slot: watch::Receiver<SlotSignal>,
}

impl PendingTable {
    /// Register a request, allocating a fresh packet identifier.
    ///
    /// Returns `None` when every identifier is in flight, which a caller
    /// surfaces as backpressure rather than waiting for the impossible.
    pub(crate) fn register(&mut self, kind: RequestKind, detached: bool) -> Option<Ticket> {
        let packet_id = self.allocate_packet_id()?;
        let seq = self.next_seq;
        self.next_seq += 1;

        let (slot_tx, slot_rx) = watch::channel(SlotSignal::Pending);
        self.entries.insert(
            seq,
            Entry {
                packet_id,
                kind,
                sent: false,
                dup: false,
                detached,
                slot: slot_tx,
            },
        );
        self.by_packet_id.insert(packet_id, seq);
        Some(Ticket {
            seq,
            packet_id,
            slot: slot_rx,
        })
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        if self.by_packet_id.len() >= MAX_IN_FLIGHT {
            return None;
        }
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                continue;
            }
            if !self.by_packet_id.contains_key(&self.next_packet_id) {
                return Some(self.next_packet_id);
            }
        }
    }

    pub(crate) fn mark_sent(&mut self, seq: u64) {
        if let Some(entry) = self.entries.get_mut(&seq) {
            entry.sent = true;
        }
    }

    /// Wire frame for a still-pending entry, `None` once it completed.
    pub(crate) fn packet_for(&self, seq: u64) -> Option<Packet> {
        self.entries.get(&seq).map(Entry::to_packet)
    }

    /// Complete the entry owning `packet_id`, releasing the identifier and
    /// waking its waiter. Returns the completed entry, or `None` for an
    /// identifier with no pending owner (for example the acknowledgement of
    /// an already-abandoned publish).
    pub(crate) fn complete(&mut self, packet_id: u16, result: AckResult) -> Option<Entry> {
        let seq = self.by_packet_id.remove(&packet_id)?;
        let entry = self.entries.remove(&seq)?;
        let _ = entry.slot.send(SlotSignal::Completed(result));
        Some(entry)
    }

    /// Drop an entry whose caller gave up. Returns false when the entry
    /// already completed (the acknowledgement won the race).
    pub(crate) fn abandon(&mut self, seq: u64) -> bool {
        match self.entries.remove(&seq) {
            Some(entry) => {
                self.by_packet_id.remove(&entry.packet_id);
                true
            }
            None => false,
        }
    }

    /// Entries that were handed to a now-dead session, in submission
    /// order. The supervisor re-sends these after the next handshake,
    /// setting the DUP flag on publishes.
    pub(crate) fn requeue_for_new_session(&mut self) -> Vec<(u64, Packet, bool)> {
        let mut frames = Vec::new();
        for (&seq, entry) in self.entries.iter_mut() {
            if !entry.sent {
                continue;
            }
            let is_republish = entry.is_publish();
            if is_republish {
                entry.dup = true;
            }
            frames.push((seq, entry.to_packet(), is_republish));
        }
        frames
    }

    /// Drop unacknowledged detached entries. The supervisor calls this
    /// before rebuilding resubscriptions from the retained set, so a stale
    /// detached SUBSCRIBE is never re-sent alongside its replacement.
    pub(crate) fn drop_detached(&mut self) {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.detached)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in stale {
            self.abandon(seq);
        }
    }

    /// Cancel everything; every suspended caller is released with an
    /// explicit cancellation error.
    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            let _ = entry.slot.send(SlotSignal::Cancelled);
        }
        self.by_packet_id.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
