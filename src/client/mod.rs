//! Resilient MQTT client
//!
//! [`MqttClient`] is a cheap-to-clone handle over shared state; every
//! session, reconnect, and replay decision happens inside the background
//! supervisor task. Callers only ever suspend: `publish` at QoS 1 suspends
//! until the broker acknowledges, across however many reconnects that
//! takes, and `subscribe` behaves the same way. Outages are invisible
//! except as latency, unless a caller opts into a deadline with the
//! `_with_timeout` variants.

mod dispatcher;
mod keepalive;
mod outbound;
mod supervisor;

use crate::codec::{Packet, Publish, QoS};
use crate::config::{ConfigError, MqttOptions, ReconnectConfig};
use crate::error::{validate_filter, validate_topic, ConnectError, PublishError, SubscribeError};
use crate::link::LinkMonitor;
use crate::transport::{Connector, TcpConnector};
use bytes::Bytes;
use dispatcher::MessageHook;
use outbound::{AckResult, PendingTable, RequestKind, SlotSignal, Ticket};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type LinkHook = Arc<dyn Fn(bool) -> HookFuture + Send + Sync>;
type ConnectedHook = Arc<dyn Fn(MqttClient) -> HookFuture + Send + Sync>;

/// Application callbacks. All default to no-ops.
pub(crate) struct Hooks {
    pub(crate) on_message: MessageHook,
    pub(crate) on_link_change: LinkHook,
    pub(crate) on_connected: ConnectedHook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_, _| {}),
            on_link_change: Arc::new(|_| Box::pin(async {})),
            on_connected: Arc::new(|_| Box::pin(async {})),
        }
    }
}

/// Where the client currently stands with the broker.
#[derive(Clone, Default)]
pub(crate) enum ConnectionState {
    #[default]
    Down,
    Connecting,
    Up(SessionHandle),
}

/// Entry point into a live session: the writer task's frame queue.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) outbound: tokio::sync::mpsc::Sender<Packet>,
}

/// State shared between client handles and the supervisor.
pub(crate) struct Shared {
    pub(crate) options: MqttOptions,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) hooks: Hooks,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) link: LinkMonitor,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) pending: Arc<Mutex<PendingTable>>,
    /// Granted subscriptions, replayed onto every fresh session.
    pub(crate) subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub(crate) republish_count: AtomicU64,
    started: AtomicBool,
    closing: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// Handle to the client. Clones share one engine.
#[derive(Clone)]
pub struct MqttClient {
    shared: Arc<Shared>,
}

/// Configures and constructs an [`MqttClient`].
pub struct MqttClientBuilder {
    options: MqttOptions,
    reconnect: ReconnectConfig,
    link: Option<LinkMonitor>,
    connector: Option<Arc<dyn Connector>>,
    hooks: Hooks,
}

impl MqttClientBuilder {
    /// Reconnection backoff schedule.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Gate connection attempts on an externally driven link signal.
    /// Without one the link is assumed always available.
    pub fn link(mut self, link: LinkMonitor) -> Self {
        self.link = Some(link);
        self
    }

    /// Replace the TCP connector, e.g. with a TLS one or an in-memory pipe.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Called for every inbound application message with its topic and
    /// payload, in arrival order, on a delivery task separate from frame
    /// decoding. A slow callback applies backpressure to the session once
    /// the delivery queue fills; a panicking callback loses only the
    /// message it was handling.
    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(String, Bytes) + Send + Sync + 'static,
    {
        self.hooks.on_message = Arc::new(hook);
        self
    }

    /// Called on every link availability transition, in order.
    pub fn on_link_change<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_link_change = Arc::new(move |up| Box::pin(hook(up)));
        self
    }

    /// Called after every successful handshake, initial connect and
    /// reconnects alike. Typical use is issuing subscriptions and
    /// announcing presence; publishes made here are queued behind the
    /// automatic resubscription and replay traffic.
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(MqttClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.on_connected = Arc::new(move |client| Box::pin(hook(client)));
        self
    }

    pub fn build(self) -> Result<MqttClient, ConfigError> {
        let options = self.options.finalize()?;
        self.reconnect.validate()?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let (host, port) = options.broker_addr()?;
                Arc::new(TcpConnector::new(host, port))
            }
        };
        let link = self.link.unwrap_or_else(LinkMonitor::always_available);

        Ok(MqttClient {
            shared: Arc::new(Shared {
                options,
                reconnect: self.reconnect,
                hooks: self.hooks,
                connector,
                link,
                state_tx: watch::channel(ConnectionState::Down).0,
                shutdown_tx: watch::channel(false).0,
                pending: Arc::new(Mutex::new(PendingTable::default())),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                republish_count: AtomicU64::new(0),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        })
    }
}

impl MqttClient {
    pub fn builder(options: MqttOptions) -> MqttClientBuilder {
        MqttClientBuilder {
            options,
            reconnect: ReconnectConfig::default(),
            link: None,
            connector: None,
            hooks: Hooks::default(),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Start the engine and wait for the first connection attempt.
    ///
    /// The returned error describes only that first attempt; the supervisor
    /// keeps retrying with backoff either way, so a caller may ignore the
    /// error and rely on the connected hook instead. Calling this again on
    /// an already started client is a no-op.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(supervisor::run(self.shared.clone(), Some(first_tx)));
        *self.shared.supervisor.lock().unwrap() = Some(handle);
        self.spawn_link_watcher();

        first_rx.await.unwrap_or_else(|_| {
            Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "client shut down before the first attempt finished",
            )))
        })
    }

    /// Drives the application's link hook, one transition at a time so
    /// callbacks observe transitions in order.
    fn spawn_link_watcher(&self) {
        let mut link = self.shared.link.clone();
        let hook = self.shared.hooks.on_link_change.clone();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    up = link.next_transition() => hook(up).await,
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state_tx.borrow(), ConnectionState::Up(_))
    }

    /// How many QoS 1 publishes have been re-sent after a reconnect. A
    /// steady climb is the telltale of a flaky path to the broker.
    pub fn republish_count(&self) -> u64 {
        self.shared.republish_count.load(Ordering::Relaxed)
    }

    /// Publish a message, suspending until it is handed to a live session
    /// (QoS 0) or acknowledged by the broker (QoS 1), reconnecting as
    /// needed in between. QoS 2 is not offered.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<(), PublishError> {
        validate_topic(topic).map_err(PublishError::InvalidTopic)?;
        let payload = payload.into();

        if qos == QoS::AtMostOnce {
            return self.publish_fire_and_forget(topic, retain, payload).await;
        }

        let ticket = self
            .register(RequestKind::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .ok_or(PublishError::InFlightLimit)?;
        match self.drive(ticket).await {
            Ok(_) => Ok(()),
            Err(Cancelled) => Err(PublishError::Cancelled),
        }
    }

    /// Like [`publish`](Self::publish) but gives up after `deadline`. On
    /// timeout the message is withdrawn and will not be re-sent; an
    /// acknowledgement that races the deadline still counts as success.
    pub async fn publish_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        deadline: Duration,
    ) -> Result<(), PublishError> {
        validate_topic(topic).map_err(PublishError::InvalidTopic)?;
        let payload = payload.into();

        if qos == QoS::AtMostOnce {
            return timeout(deadline, self.publish_fire_and_forget(topic, retain, payload))
                .await
                .map_err(|_| PublishError::Timeout)?;
        }

        let ticket = self
            .register(RequestKind::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .ok_or(PublishError::InFlightLimit)?;
        let seq = ticket.seq;
        match timeout(deadline, self.drive(ticket)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(Cancelled)) => Err(PublishError::Cancelled),
            Err(_) => {
                if self.shared.pending.lock().unwrap().abandon(seq) {
                    Err(PublishError::Timeout)
                } else {
                    // The acknowledgement won the race.
                    Ok(())
                }
            }
        }
    }

    /// Subscribe to a topic filter, suspending until the broker grants it.
    /// Granted subscriptions are re-established automatically after every
    /// reconnect. Returns the granted QoS, which the broker may downgrade.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError> {
        validate_filter(filter).map_err(SubscribeError::InvalidFilter)?;
        let ticket = self
            .register(RequestKind::Subscribe {
                filter: filter.to_string(),
                qos,
            })
            .ok_or(SubscribeError::InFlightLimit)?;
        match self.drive(ticket).await {
            Ok(AckResult::SubGranted(code)) => {
                Ok(QoS::from_u8(code).unwrap_or(QoS::AtMostOnce))
            }
            Ok(AckResult::SubRejected(code)) => Err(SubscribeError::Rejected(code)),
            Ok(AckResult::Done) => Ok(qos),
            Err(Cancelled) => Err(SubscribeError::Cancelled),
        }
    }

    /// Like [`subscribe`](Self::subscribe) with a deadline. A timed-out
    /// request is withdrawn, though the broker may still have granted it;
    /// a late grant is then resubscribed after the next reconnect anyway.
    pub async fn subscribe_with_timeout(
        &self,
        filter: &str,
        qos: QoS,
        deadline: Duration,
    ) -> Result<QoS, SubscribeError> {
        validate_filter(filter).map_err(SubscribeError::InvalidFilter)?;
        let ticket = self
            .register(RequestKind::Subscribe {
                filter: filter.to_string(),
                qos,
            })
            .ok_or(SubscribeError::InFlightLimit)?;
        let seq = ticket.seq;
        match timeout(deadline, self.drive(ticket)).await {
            Ok(Ok(AckResult::SubGranted(code))) => {
                Ok(QoS::from_u8(code).unwrap_or(QoS::AtMostOnce))
            }
            Ok(Ok(AckResult::SubRejected(code))) => Err(SubscribeError::Rejected(code)),
            Ok(Ok(AckResult::Done)) => Ok(qos),
            Ok(Err(Cancelled)) => Err(SubscribeError::Cancelled),
            Err(_) => {
                self.shared.pending.lock().unwrap().abandon(seq);
                Err(SubscribeError::Timeout)
            }
        }
    }

    /// Drop a subscription. The filter leaves the retained set immediately
    /// so it is not re-established on reconnect; the call then suspends
    /// until the broker confirms.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        validate_filter(filter).map_err(SubscribeError::InvalidFilter)?;
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .retain(|(f, _)| f != filter);
        let ticket = self
            .register(RequestKind::Unsubscribe {
                filter: filter.to_string(),
            })
            .ok_or(SubscribeError::InFlightLimit)?;
        match self.drive(ticket).await {
            Ok(_) => Ok(()),
            Err(Cancelled) => Err(SubscribeError::Cancelled),
        }
    }

    /// Graceful shutdown: a DISCONNECT is queued so the broker discards the
    /// will, the writer drains, and every pending request is cancelled.
    /// Idempotent.
    pub async fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.shared.state_tx.borrow().clone();
        if let ConnectionState::Up(handle) = state {
            let _ = handle.outbound.send(Packet::Disconnect).await;
        }
        self.shutdown().await;
    }

    /// Abortive shutdown: the stream is closed without a DISCONNECT, which
    /// makes the broker publish the configured will. Idempotent.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
        let handle = self.shared.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                debug!("supervisor did not stop in time");
            }
        }
    }

    fn register(&self, kind: RequestKind) -> Option<Ticket> {
        self.shared.pending.lock().unwrap().register(kind, false)
    }

    /// Hand a registered request to the current or next session, then
    /// suspend until the broker acknowledges it. Re-sends after session
    /// loss are the supervisor's job; this only performs the first send.
    async fn drive(&self, mut ticket: Ticket) -> Result<AckResult, Cancelled> {
        let handle = self.await_session().await?;
        let packet = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.mark_sent(ticket.seq);
            pending.packet_for(ticket.seq)
        };
        if let Some(packet) = packet {
            // A closed queue means the session just died; the supervisor
            // replays the entry on the next one.
            let _ = handle.outbound.send(packet).await;
        }
        // Holding the handle would keep the writer's queue open through a
        // graceful shutdown.
        drop(handle);

        loop {
            match &*ticket.slot.borrow_and_update() {
                SlotSignal::Completed(result) => return Ok(result.clone()),
                SlotSignal::Cancelled => return Err(Cancelled),
                SlotSignal::Pending => {}
            }
            if ticket.slot.changed().await.is_err() {
                return Err(Cancelled);
            }
        }
    }

    /// QoS 0 delivery: retry queuing the frame until one session accepts
    /// it. A send interrupted by session loss may or may not have reached
    /// the broker; the frame is not re-sent in that case.
    async fn publish_fire_and_forget(
        &self,
        topic: &str,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        let packet = Packet::Publish(Publish {
            topic: topic.to_string(),
            payload,
            qos: QoS::AtMostOnce,
            packet_id: None,
            dup: false,
            retain,
        });
        let mut state_rx = self.shared.state_tx.subscribe();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Err(PublishError::Cancelled);
            }
            let handle = match &*state_rx.borrow_and_update() {
                ConnectionState::Up(handle) => Some(handle.clone()),
                _ => None,
            };
            if let Some(handle) = handle {
                if handle.outbound.send(packet.clone()).await.is_ok() {
                    return Ok(());
                }
                // Stale handle, the session died under us; wait for the
                // state to move and try the next session.
            }
            tokio::select! {
                result = state_rx.changed() => {
                    if result.is_err() {
                        return Err(PublishError::Cancelled);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Suspend until a session is up, or fail once shutdown begins.
    async fn await_session(&self) -> Result<SessionHandle, Cancelled> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Err(Cancelled);
            }
            if let ConnectionState::Up(handle) = &*state_rx.borrow_and_update() {
                return Ok(handle.clone());
            }
            tokio::select! {
                result = state_rx.changed() => {
                    if result.is_err() {
                        return Err(Cancelled);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }
}

/// Internal marker: the client shut down while a request was pending.
struct Cancelled;
