use crate::events::P2pEvent;
use crate::transport::interface;
use crate::transport::peer::PeerInfo;
use crate::transport::{BaseStation, HeartBeat, InboundMessage, Listener};
use crate::Result;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Facade over the transport layer: composes the listener, the base
/// station and the optional heartbeat, and exposes byte-level send and
/// receive to the object layer.
///
/// Holds no protocol state of its own beyond the resolved local IP.
pub struct PeerManager {
    station: Arc<BaseStation>,
    listener: Listener,
    heartbeat: Mutex<Option<Arc<HeartBeat>>>,
    started: AtomicBool,
    msg_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl PeerManager {
    /// Build the transport stack on `port`. Events (currently peer-registry
    /// changes) are published on `event_tx`; inbound byte messages are
    /// consumed via [`take_messages`](Self::take_messages).
    pub fn new(port: u16, forward_all: bool, event_tx: mpsc::UnboundedSender<P2pEvent>) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        Self {
            station: Arc::new(BaseStation::new(port, forward_all, msg_tx, event_tx)),
            listener: Listener::new(port),
            heartbeat: Mutex::new(None),
            started: AtomicBool::new(false),
            msg_rx: Mutex::new(Some(msg_rx)),
        }
    }

    /// Enable the periodic discovery broadcast. Heartbeats help other peers
    /// on the same subnet find this one without any central server. Takes
    /// effect immediately if the stack is already running, otherwise on
    /// [`start`](Self::start).
    pub fn enable_automatic_discovery(&self, interval: Duration) {
        let beat = Arc::new(HeartBeat::new(interval, self.station.clone()));
        if self.started.load(Ordering::SeqCst) {
            beat.start_broadcasting();
        }
        if let Ok(mut guard) = self.heartbeat.lock() {
            if let Some(old) = guard.take() {
                old.stop();
            }
            *guard = Some(beat);
        }
    }

    /// Resolve the local address, bind the listener and start dispatching.
    /// Fails with [`Error::NoNetworkInterface`](crate::Error) when no
    /// connected interface exists.
    pub async fn start(&self) -> Result<()> {
        let local_ip = interface::resolve_local_ip()?.to_string();
        info!("Local peer address is {}", local_ip);
        self.station.set_local_ip(local_ip);

        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let udp = self.listener.start(listener_tx).await?;
        self.station.install_udp(udp);
        self.station.clone().spawn_dispatch(listener_rx);

        self.started.store(true, Ordering::SeqCst);
        if let Ok(guard) = self.heartbeat.lock() {
            if let Some(beat) = guard.as_ref() {
                beat.start_broadcasting();
            }
        }
        Ok(())
    }

    /// Take the inbound message stream. Yields `None` after the first call.
    pub(crate) fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.msg_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    /// The address this peer identifies itself by, once started.
    pub fn local_ip(&self) -> Option<String> {
        self.station.local_ip().map(str::to_string)
    }

    pub async fn known_peers(&self) -> Vec<PeerInfo> {
        self.station.known_peers().await
    }

    pub async fn send_msg_tcp(&self, ip: &str, msg: &[u8]) -> Result<bool> {
        self.station.send_unicast_tcp(ip, msg).await
    }

    pub async fn send_msg_udp(&self, ip: &str, msg: &[u8]) -> Result<bool> {
        self.station.send_unicast_udp(ip, msg).await
    }

    pub async fn send_broadcast_udp(&self, msg: &[u8]) -> Result<()> {
        self.station.send_broadcast_udp(msg).await
    }

    /// Explicit outbound connection, for peer sets managed outside the
    /// broadcast discovery mechanism.
    pub async fn direct_connect(&self, ip: &str) -> Result<()> {
        self.station.direct_connect(ip).await
    }

    /// Stop the listener and heartbeat and drop all peer connections.
    pub async fn stop(&self) {
        self.listener.stop();
        if let Ok(guard) = self.heartbeat.lock() {
            if let Some(beat) = guard.as_ref() {
                beat.stop();
            }
        }
        self.station.clear_registry().await;
        self.started.store(false, Ordering::SeqCst);
    }
}
