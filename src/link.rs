//! Link availability monitor
//!
//! Reflects the physical association state (WiFi joined, cable plugged, …)
//! that an external driver reports through a [`LinkHandle`]. The monitor
//! performs no I/O of its own and cannot fail; it only exposes the current
//! boolean state and a suspension point for waiting on it.

use std::sync::Arc;
use tokio::sync::watch;

/// Read side of the link signal. Cheap to clone; every component that needs
/// to gate on the link holds its own copy.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for monitors not driven by an external handle.
    _pinned: Option<Arc<watch::Sender<bool>>>,
}

/// Write side, owned by whatever drives the physical association.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: watch::Sender<bool>,
}

impl LinkMonitor {
    /// A monitor/handle pair starting in the given state.
    pub fn new(initially_available: bool) -> (Self, LinkHandle) {
        let (tx, rx) = watch::channel(initially_available);
        (Self { rx, _pinned: None }, LinkHandle { tx })
    }

    /// A monitor that always reports the link as up, for wired setups and
    /// tests that do not exercise outages.
    pub fn always_available() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            rx,
            _pinned: Some(Arc::new(tx)),
        }
    }

    pub fn is_available(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until the link is available, returning immediately if it
    /// already is.
    pub async fn await_available(&mut self) {
        // wait_for returns an error only when the handle is dropped; treat
        // a dropped handle as a permanently frozen state.
        if self.rx.wait_for(|up| *up).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Suspend until the state changes, returning the new value. Used by the
    /// client to drive the application's link-state hook. Never resolves
    /// once the handle is gone; a dropped handle means the state is frozen.
    pub(crate) async fn next_transition(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }
}

impl LinkHandle {
    /// Report a new association state. Redundant reports are deduplicated so
    /// observers see transitions only.
    pub fn set_available(&self, available: bool) {
        self.tx.send_if_modified(|state| {
            if *state == available {
                false
            } else {
                *state = available;
                true
            }
        });
    }
}
