//! Reconnection supervisor
//!
//! One background task per client that owns the connect/teardown lifecycle:
//! gate on the link, dial and handshake with bounded exponential backoff,
//! replay state onto each fresh session (resubscriptions first, then
//! unacknowledged requests in submission order), and tear the session down
//! on fault, link loss, or shutdown. Everything else in the crate only ever
//! observes the session through the connection-state watch.

use crate::client::dispatcher::Dispatcher;
use crate::client::keepalive::{self, Activity};
use crate::client::outbound::RequestKind;
use crate::client::{ConnectionState, MqttClient, SessionHandle, Shared};
use crate::codec::{Packet, Subscribe};
use crate::error::{ConnectError, SessionFault};
use crate::transport::{FrameWriter, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Frames queued towards the writer per session.
const OUTBOUND_DEPTH: usize = 64;

/// How long a graceful shutdown waits for the writer to drain its queue.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a live session ended.
enum Exit {
    Fault,
    LinkDown,
    Shutdown,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut first_attempt: Option<oneshot::Sender<Result<(), ConnectError>>>,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut link = shared.link.clone();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if !link.is_available() {
            shared.set_state(ConnectionState::Down);
            attempt = 0;
            debug!("waiting for the link");
            if first_attempt.is_some() {
                // The initial connect call still deserves an answer even if
                // the link never shows up.
                tokio::select! {
                    _ = link.await_available() => {}
                    _ = tokio::time::sleep(shared.options.connect_timeout()) => {
                        if let Some(tx) = first_attempt.take() {
                            let _ = tx.send(Err(ConnectError::LinkDown));
                        }
                    }
                    _ = shutdown_rx.changed() => {}
                }
            } else {
                tokio::select! {
                    _ = link.await_available() => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            continue;
        }

        shared.set_state(ConnectionState::Connecting);
        attempt += 1;
        let session = match establish(&shared).await {
            Ok(session) => session,
            Err(error) => {
                match first_attempt.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    None => warn!(attempt, error = %error, "connection attempt failed"),
                }
                let delay = shared.reconnect.delay_for_attempt(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                    up = link.next_transition() => {
                        if !up {
                            attempt = 0;
                        }
                    }
                }
                continue;
            }
        };

        // Session tasks: the writer owns the write half and drains a frame
        // queue, the dispatcher owns the read half, the keepalive driver
        // watches both directions.
        let (reader, writer) = session.split();
        let (out_tx, out_rx) = mpsc::channel::<Packet>(OUTBOUND_DEPTH);
        let (fault_tx, mut fault_rx) = mpsc::channel::<SessionFault>(4);
        let activity = Arc::new(Activity::new());

        let writer_task = tokio::spawn(writer_loop(
            writer,
            out_rx,
            activity.clone(),
            fault_tx.clone(),
        ));
        let dispatcher_task = tokio::spawn(
            Dispatcher {
                reader,
                activity: activity.clone(),
                pending: shared.pending.clone(),
                subscriptions: shared.subscriptions.clone(),
                outbound: out_tx.clone(),
                on_message: shared.hooks.on_message.clone(),
                faults: fault_tx.clone(),
            }
            .run(),
        );
        let keepalive_task = tokio::spawn(keepalive::run(
            activity.clone(),
            shared.options.keepalive_interval(),
            out_tx.clone(),
            fault_tx,
        ));

        replay(&shared, &out_tx).await;

        shared.set_state(ConnectionState::Up(SessionHandle {
            outbound: out_tx.clone(),
        }));
        attempt = 0;
        if let Some(tx) = first_attempt.take() {
            let _ = tx.send(Ok(()));
        }
        info!(broker = %shared.options.broker_url, "connected");

        // The connected hook runs concurrently; its publishes land behind
        // the replayed frames because they share the writer queue.
        let hook = shared.hooks.on_connected.clone();
        let client = MqttClient::from_shared(shared.clone());
        tokio::spawn(async move { hook(client).await });

        let exit = loop {
            tokio::select! {
                fault = fault_rx.recv() => {
                    if let Some(fault) = fault {
                        warn!(error = %fault, "session failed");
                    }
                    break Exit::Fault;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break Exit::Shutdown;
                    }
                }
                up = link.next_transition() => {
                    if !up {
                        break Exit::LinkDown;
                    }
                }
            }
        };

        keepalive_task.abort();
        dispatcher_task.abort();
        match exit {
            Exit::Fault => {
                writer_task.abort();
                shared.set_state(ConnectionState::Connecting);
            }
            Exit::LinkDown => {
                info!("link lost, tearing the session down");
                writer_task.abort();
                shared.set_state(ConnectionState::Down);
                attempt = 0;
            }
            Exit::Shutdown => {
                // Dropping every queue sender lets the writer drain whatever
                // is already enqueued, a DISCONNECT included, then close the
                // stream.
                shared.set_state(ConnectionState::Down);
                drop(out_tx);
                if timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
                    warn!("writer did not drain in time");
                }
                break;
            }
        }
    }

    shared.set_state(ConnectionState::Down);
    shared.pending.lock().unwrap().cancel_all();
    debug!("supervisor stopped");
}

/// Dial the broker and complete the handshake within the configured
/// deadline.
async fn establish(shared: &Shared) -> Result<Session, ConnectError> {
    let stream = timeout(shared.options.connect_timeout(), shared.connector.open())
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(ConnectError::Io)?;
    Session::establish(stream, &shared.options).await
}

/// Queue state restoration onto a fresh session: the retained subscription
/// set first, then every request that was on the wire when the previous
/// session died, in original submission order. Re-sent publishes carry the
/// DUP flag and bump the republish counter.
async fn replay(shared: &Arc<Shared>, out_tx: &mpsc::Sender<Packet>) {
    let (sub_frames, replay_frames, republishes) = {
        let mut pending = shared.pending.lock().unwrap();
        pending.drop_detached();
        let replay_frames = pending.requeue_for_new_session();
        let republishes = replay_frames.iter().filter(|(_, _, r)| *r).count();

        let subscriptions = shared.subscriptions.lock().unwrap().clone();
        let mut sub_frames = Vec::with_capacity(subscriptions.len());
        for (filter, qos) in subscriptions {
            if let Some(ticket) = pending.register(
                RequestKind::Subscribe {
                    filter: filter.clone(),
                    qos,
                },
                true,
            ) {
                pending.mark_sent(ticket.seq);
                sub_frames.push(Packet::Subscribe(Subscribe {
                    packet_id: ticket.packet_id,
                    filters: vec![(filter, qos)],
                }));
            }
        }
        (sub_frames, replay_frames, republishes as u64)
    };

    if republishes > 0 {
        shared
            .republish_count
            .fetch_add(republishes, std::sync::atomic::Ordering::Relaxed);
        debug!(count = republishes, "republishing unacknowledged messages");
    }

    for packet in sub_frames
        .into_iter()
        .chain(replay_frames.into_iter().map(|(_, packet, _)| packet))
    {
        if out_tx.send(packet).await.is_err() {
            // Writer already died; the fault loop takes it from here.
            return;
        }
    }
}

/// Drain the frame queue onto the stream. A closed queue is a graceful end
/// and flushes the stream shut; a write error is a session fault.
async fn writer_loop(
    mut writer: FrameWriter,
    mut out_rx: mpsc::Receiver<Packet>,
    activity: Arc<Activity>,
    faults: mpsc::Sender<SessionFault>,
) {
    while let Some(packet) = out_rx.recv().await {
        if let Err(fault) = writer.write_packet(&packet).await {
            let _ = faults.send(fault).await;
            return;
        }
        activity.touch_send();
    }
    writer.shutdown().await;
}
