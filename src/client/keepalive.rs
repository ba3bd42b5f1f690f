//! Keepalive driver
//!
//! Two jobs per live session: keep the broker from expiring us by pinging
//! when the outbound side has been idle, and detect a silently dead stream
//! by demanding an answer to a ping. Any frame counts as activity in either
//! direction, and either side going quiet provokes a PINGREQ; the death
//! deadline only starts once a ping is actually on the wire, so a session
//! that publishes steadily to a taciturn broker is probed, not condemned.

use crate::codec::Packet;
use crate::error::SessionFault;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Send/receive timestamps shared between the writer, the dispatcher and
/// the keepalive loop. Plain mutex, every access is a quick read or store.
#[derive(Debug)]
pub(crate) struct Activity {
    inner: Mutex<Stamps>,
}

#[derive(Debug, Clone, Copy)]
struct Stamps {
    last_send: Instant,
    last_recv: Instant,
}

impl Activity {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Stamps {
                last_send: now,
                last_recv: now,
            }),
        }
    }

    pub(crate) fn touch_send(&self) {
        self.inner.lock().unwrap().last_send = Instant::now();
    }

    pub(crate) fn touch_recv(&self) {
        self.inner.lock().unwrap().last_recv = Instant::now();
    }

    fn last(&self) -> (Instant, Instant) {
        let stamps = *self.inner.lock().unwrap();
        (stamps.last_send, stamps.last_recv)
    }
}

/// Drive pings and dead-stream detection for one session.
///
/// Runs until the session dies: either the outbound channel closes (the
/// writer went away, teardown is already underway) or a ping goes
/// unanswered past its response deadline, in which case exactly one
/// [`SessionFault::KeepaliveTimeout`] is reported and the loop exits.
pub(crate) async fn run(
    activity: std::sync::Arc<Activity>,
    keepalive: Duration,
    outbound: mpsc::Sender<Packet>,
    faults: mpsc::Sender<SessionFault>,
) {
    // Ping once half the interval has passed without traffic in either
    // direction. A ping arms the response deadline; any inbound frame
    // after the ping disarms it. The tick is fine-grained enough that
    // neither deadline slips by much.
    let ping_after = keepalive / 2;
    let response_grace = keepalive;
    let tick = keepalive / 4;

    let mut ping_sent_at: Option<Instant> = None;

    loop {
        tokio::time::sleep(tick).await;

        let now = Instant::now();
        let (last_send, last_recv) = activity.last();

        if let Some(sent_at) = ping_sent_at {
            if last_recv > sent_at {
                ping_sent_at = None;
            } else if now - sent_at >= response_grace {
                warn!(
                    silent_for_secs = (now - last_recv).as_secs(),
                    "ping went unanswered within the keepalive window"
                );
                let _ = faults.send(SessionFault::KeepaliveTimeout).await;
                return;
            }
        }

        // Outbound idleness needs a ping so the broker keeps the session;
        // inbound idleness needs one so there is a response to wait for.
        if ping_sent_at.is_none()
            && (now - last_send >= ping_after || now - last_recv >= ping_after)
        {
            debug!("pinging broker");
            if outbound.send(Packet::PingReq).await.is_err() {
                // Writer gone, session teardown already in progress.
                return;
            }
            activity.touch_send();
            ping_sent_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_pings_when_outbound_idle() {
        let activity = Arc::new(Activity::new());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (fault_tx, _fault_rx) = mpsc::channel(1);

        let driver = tokio::spawn(run(
            activity.clone(),
            Duration::from_secs(8),
            out_tx,
            fault_tx,
        ));

        // Keep inbound alive so only the ping path fires.
        let toucher = {
            let activity = activity.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    activity.touch_recv();
                }
            })
        };

        let packet = tokio::time::timeout(Duration::from_secs(10), out_rx.recv())
            .await
            .expect("ping due within the interval")
            .expect("channel open");
        assert!(matches!(packet, Packet::PingReq));

        toucher.abort();
        driver.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_traffic_suppresses_ping() {
        let activity = Arc::new(Activity::new());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (fault_tx, _fault_rx) = mpsc::channel(1);

        let driver = tokio::spawn(run(
            activity.clone(),
            Duration::from_secs(8),
            out_tx,
            fault_tx,
        ));

        // Simulate steady traffic in both directions.
        let toucher = {
            let activity = activity.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    activity.touch_send();
                    activity.touch_recv();
                }
            })
        };

        let result = tokio::time::timeout(Duration::from_secs(30), out_rx.recv()).await;
        assert!(result.is_err(), "busy session must not be pinged");

        toucher.abort();
        driver.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_outbound_session_is_pinged_not_condemned() {
        let activity = Arc::new(Activity::new());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (fault_tx, mut fault_rx) = mpsc::channel(1);

        let driver = tokio::spawn(run(
            activity.clone(),
            Duration::from_secs(8),
            out_tx,
            fault_tx,
        ));

        // Steady QoS 0 publishing against a broker with nothing to say.
        let toucher = {
            let activity = activity.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    activity.touch_send();
                }
            })
        };

        // Inbound silence alone must provoke a ping.
        let packet = tokio::time::timeout(Duration::from_secs(8), out_rx.recv())
            .await
            .expect("ping due despite outbound traffic")
            .expect("channel open");
        assert!(matches!(packet, Packet::PingReq));

        // Answer it; an answered ping keeps the session alive.
        tokio::time::sleep(Duration::from_millis(10)).await;
        activity.touch_recv();
        let early = tokio::time::timeout(Duration::from_secs(6), fault_rx.recv()).await;
        assert!(early.is_err(), "answered ping must not end the session");

        // Stop answering. Only an unanswered ping ends the session.
        tokio::spawn(async move { while out_rx.recv().await.is_some() {} });
        let fault = tokio::time::timeout(Duration::from_secs(20), fault_rx.recv())
            .await
            .expect("unanswered ping must be detected")
            .expect("fault channel open");
        assert!(matches!(fault, SessionFault::KeepaliveTimeout));

        toucher.abort();
        let _ = driver.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_silence_reports_one_fault() {
        let activity = Arc::new(Activity::new());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (fault_tx, mut fault_rx) = mpsc::channel(1);

        let driver = tokio::spawn(run(
            activity.clone(),
            Duration::from_secs(8),
            out_tx,
            fault_tx,
        ));

        // Drain pings so the driver never blocks on the outbound channel.
        tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

        let fault = tokio::time::timeout(Duration::from_secs(20), fault_rx.recv())
            .await
            .expect("silence must be detected")
            .expect("fault channel open");
        assert!(matches!(fault, SessionFault::KeepaliveTimeout));

        // The loop exits after reporting; no second fault follows.
        driver.await.unwrap();
        assert!(fault_rx.recv().await.is_none());
    }
}
