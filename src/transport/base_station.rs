use crate::events::P2pEvent;
use crate::transport::listener::ListenerEvent;
use crate::transport::peer::{Peer, PeerEvent, PeerInfo};
use crate::transport::{Channel, InboundMessage};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

const BROADCAST_ADDR: &str = "255.255.255.255";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of resolving an IP address against the registry. The local
/// address is a distinguished case: treated as known, but never stored in
/// the registry itself.
enum PeerLookup {
    Local,
    Known(usize),
    Unknown,
}

/// Owns the peer registry and turns raw inbound connections and datagrams
/// into peer lifecycle events and application messages.
///
/// The registry holds at most one [`Peer`] per distinct IP address. All
/// mutations go through this type, serialized by one mutex, since multiple
/// peer receive loops can report liveness changes concurrently.
pub struct BaseStation {
    port: u16,
    /// When true, locally-originated messages are forwarded instead of
    /// dropped. Used for loopback diagnostics.
    forward_all: bool,
    local_ip: OnceLock<String>,
    udp: OnceLock<Arc<UdpSocket>>,
    peers: Mutex<Vec<Peer>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    msg_tx: mpsc::UnboundedSender<InboundMessage>,
    event_tx: mpsc::UnboundedSender<P2pEvent>,
}

impl BaseStation {
    pub fn new(
        port: u16,
        forward_all: bool,
        msg_tx: mpsc::UnboundedSender<InboundMessage>,
        event_tx: mpsc::UnboundedSender<P2pEvent>,
    ) -> Self {
        let (peer_events, peer_events_rx) = mpsc::unbounded_channel();
        Self {
            port,
            forward_all,
            local_ip: OnceLock::new(),
            udp: OnceLock::new(),
            peers: Mutex::new(Vec::new()),
            peer_events,
            peer_events_rx: std::sync::Mutex::new(Some(peer_events_rx)),
            msg_tx,
            event_tx,
        }
    }

    /// Record the resolved local address. Must happen before the dispatch
    /// loop starts so locally-originated broadcasts are filtered.
    pub(crate) fn set_local_ip(&self, ip: String) {
        let _ = self.local_ip.set(ip);
    }

    pub fn local_ip(&self) -> Option<&str> {
        self.local_ip.get().map(String::as_str)
    }

    /// Install the bound UDP socket shared with the listener.
    pub(crate) fn install_udp(&self, socket: Arc<UdpSocket>) {
        let _ = self.udp.set(socket);
    }

    fn udp(&self) -> Result<&Arc<UdpSocket>> {
        self.udp.get().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport not started",
            ))
        })
    }

    /// Snapshot of the current registry.
    pub async fn known_peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().await.iter().map(Peer::info).collect()
    }

    async fn resolve(&self, ip: &str) -> PeerLookup {
        if self.local_ip() == Some(ip) {
            return PeerLookup::Local;
        }
        let peers = self.peers.lock().await;
        match peers.iter().position(|p| p.ip() == ip) {
            Some(index) => PeerLookup::Known(index),
            None => PeerLookup::Unknown,
        }
    }

    /// Send one datagram to a single address. Returns `Ok(false)` without
    /// sending when the target is a known-but-inactive peer.
    pub async fn send_unicast_udp(&self, ip: &str, msg: &[u8]) -> Result<bool> {
        if let PeerLookup::Known(index) = self.resolve(ip).await {
            let active = {
                let peers = self.peers.lock().await;
                peers.get(index).map(Peer::is_active).unwrap_or(false)
            };
            if !active {
                return Ok(false);
            }
        }
        self.udp()?.send_to(msg, (ip, self.port)).await?;
        Ok(true)
    }

    /// Fire-and-forget to the LAN broadcast address. No liveness check.
    pub async fn send_broadcast_udp(&self, msg: &[u8]) -> Result<()> {
        self.udp()?.send_to(msg, (BROADCAST_ADDR, self.port)).await?;
        Ok(())
    }

    /// Reliable send to a single peer. Connects on demand if the address is
    /// not yet in the registry; sending to the local address is invalid.
    pub async fn send_unicast_tcp(&self, ip: &str, msg: &[u8]) -> Result<bool> {
        let peer = match self.resolve(ip).await {
            PeerLookup::Local => {
                return Err(Error::PeerNotKnown(format!(
                    "{} is this peer's own address",
                    ip
                )));
            }
            PeerLookup::Known(_) => {
                let peers = self.peers.lock().await;
                peers.iter().find(|p| p.ip() == ip).cloned()
            }
            PeerLookup::Unknown => {
                self.direct_connect(ip).await?;
                let peers = self.peers.lock().await;
                peers.iter().find(|p| p.ip() == ip).cloned()
            }
        };

        let Some(peer) = peer else {
            return Err(Error::PeerNotKnown(ip.to_string()));
        };
        if !peer.is_active() {
            return Ok(false);
        }
        Ok(peer.send(msg).await)
    }

    /// Open an outbound connection and register the remote as a peer.
    /// Connect failures are reported as [`Error::PeerNotKnown`].
    pub async fn direct_connect(&self, ip: &str) -> Result<()> {
        let connect = TcpStream::connect((ip, self.port));
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::PeerNotKnown(format!("{}: {}", ip, e)));
            }
            Err(_) => {
                return Err(Error::PeerNotKnown(format!("{}: connect timed out", ip)));
            }
        };
        self.register_peer(stream, ip.to_string()).await;
        Ok(())
    }

    /// Wrap an established connection in a [`Peer`], add it to the registry
    /// (replacing any stale entry for the same address) and announce the
    /// change.
    async fn register_peer(&self, stream: TcpStream, ip: String) {
        let peer = Peer::spawn(stream, ip.clone(), self.peer_events.clone());
        let snapshot = {
            let mut peers = self.peers.lock().await;
            peers.retain(|p| p.ip() != ip);
            peers.push(peer);
            peers.iter().map(Peer::info).collect()
        };
        info!("Peer {} joined the registry", ip);
        let _ = self.event_tx.send(P2pEvent::PeerChange { peers: snapshot });
    }

    /// A peer reported inactive: drop it from the registry. No reconnect is
    /// attempted.
    async fn remove_peer(&self, ip: &str) {
        let snapshot = {
            let mut peers = self.peers.lock().await;
            let before = peers.len();
            peers.retain(|p| !(p.ip() == ip && !p.is_active()));
            if peers.len() == before {
                return;
            }
            peers.iter().map(Peer::info).collect()
        };
        info!("Peer {} left the registry", ip);
        let _ = self.event_tx.send(P2pEvent::PeerChange { peers: snapshot });
    }

    /// Drop every registered peer, closing their connections. Used on
    /// shutdown; no `PeerChange` event is emitted.
    pub(crate) async fn clear_registry(&self) {
        self.peers.lock().await.clear();
    }

    /// Process one raw datagram from the broadcast channel.
    ///
    /// Locally-originated traffic is dropped (unless forward-all is set for
    /// loopback diagnostics), unknown senders trigger an outbound connect,
    /// and zero-length payloads — heartbeat probes — are filtered out.
    async fn handle_datagram(&self, source_ip: String, payload: Vec<u8>) {
        let lookup = self.resolve(&source_ip).await;

        if matches!(lookup, PeerLookup::Local) && !self.forward_all {
            return;
        }

        if matches!(lookup, PeerLookup::Unknown) {
            debug!("Datagram from unknown address {}, connecting", source_ip);
            if let Err(e) = self.direct_connect(&source_ip).await {
                warn!("Could not connect back to {}: {}", source_ip, e);
            }
        }

        if payload.is_empty() {
            return;
        }

        let _ = self.msg_tx.send(InboundMessage {
            source_ip,
            channel: Channel::Udp,
            payload,
        });
    }

    /// Run the dispatch loop: raw listener events in, peer lifecycle and
    /// application messages out. Exits when the listener side hangs up.
    pub(crate) fn spawn_dispatch(
        self: Arc<Self>,
        mut listener_rx: mpsc::UnboundedReceiver<ListenerEvent>,
    ) {
        let mut peer_rx = match self.peer_events_rx.lock() {
            Ok(mut guard) => match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("Dispatch loop already running");
                    return;
                }
            },
            Err(_) => return,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = listener_rx.recv() => match ev {
                        Some(ListenerEvent::Connection { stream, remote_ip }) => {
                            self.register_peer(stream, remote_ip).await;
                        }
                        Some(ListenerEvent::Datagram { source_ip, payload }) => {
                            self.handle_datagram(source_ip, payload).await;
                        }
                        None => break,
                    },
                    ev = peer_rx.recv() => match ev {
                        Some(PeerEvent::Message { source_ip, payload }) => {
                            let _ = self.msg_tx.send(InboundMessage {
                                source_ip,
                                channel: Channel::Tcp,
                                payload,
                            });
                        }
                        Some(PeerEvent::Disconnected { ip }) => {
                            self.remove_peer(&ip).await;
                        }
                        None => break,
                    },
                }
            }
            info!("Dispatch loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn make_station(
        port: u16,
        forward_all: bool,
    ) -> (
        Arc<BaseStation>,
        mpsc::UnboundedReceiver<InboundMessage>,
        mpsc::UnboundedReceiver<P2pEvent>,
    ) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let station = Arc::new(BaseStation::new(port, forward_all, msg_tx, event_tx));
        (station, msg_rx, event_rx)
    }

    #[tokio::test]
    async fn tcp_send_to_own_address_is_peer_not_known() {
        let (station, _msg_rx, _event_rx) = make_station(9, false);
        station.set_local_ip("10.0.0.1".into());

        let err = station.send_unicast_tcp("10.0.0.1", b"data").await;
        assert!(matches!(err, Err(Error::PeerNotKnown(_))));
    }

    #[tokio::test]
    async fn tcp_send_to_unreachable_address_is_peer_not_known() {
        // Nothing listens on the probed port once it is released.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (station, _msg_rx, _event_rx) = make_station(port, false);
        station.set_local_ip("10.0.0.1".into());

        let err = station.send_unicast_tcp("127.0.0.1", b"data").await;
        assert!(matches!(err, Err(Error::PeerNotKnown(_))));
        assert!(station.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_removes_peer_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (station, _msg_rx, mut event_rx) = make_station(port, false);
        station.set_local_ip("10.0.0.1".into());
        let (_listener_tx, listener_rx) = mpsc::unbounded_channel();
        station.clone().spawn_dispatch(listener_rx);

        station.direct_connect("127.0.0.1").await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        match event_rx.recv().await.unwrap() {
            P2pEvent::PeerChange { peers } => assert_eq!(peers.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }

        // Remote goes away: the receive loop reports the disconnect and
        // the dispatch loop drops the registry entry.
        drop(remote);
        match event_rx.recv().await.unwrap() {
            P2pEvent::PeerChange { peers } => assert!(peers.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(station.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn udp_send_to_inactive_peer_returns_false_without_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (station, _msg_rx, _event_rx) = make_station(port, false);
        station.set_local_ip("10.0.0.1".into());
        station.direct_connect("127.0.0.1").await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        drop(remote);

        // No dispatch loop is running, so the dead peer stays registered
        // and flips inactive once its receive loop observes the close.
        let mut inactive = false;
        for _ in 0..50 {
            let peers = station.known_peers().await;
            if peers.first().is_some_and(|p| !p.active) {
                inactive = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inactive, "peer never reported inactive");

        // Returns before touching the UDP socket, which was never
        // installed here.
        let sent = station.send_unicast_udp("127.0.0.1", b"data").await.unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn datagram_from_unknown_address_registers_a_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (station, mut msg_rx, mut event_rx) = make_station(port, false);
        station.set_local_ip("10.0.0.1".into());

        station.handle_datagram("127.0.0.1".into(), b"hello".to_vec()).await;
        // The connect-back must have landed on our listener.
        listener.accept().await.unwrap();

        let peers = station.known_peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "127.0.0.1");
        assert!(peers[0].active);

        match event_rx.recv().await.unwrap() {
            P2pEvent::PeerChange { peers } => assert_eq!(peers.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }
        let msg = msg_rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.channel, Channel::Udp);
    }

    #[tokio::test]
    async fn blank_datagram_connects_but_is_not_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (station, mut msg_rx, _event_rx) = make_station(port, false);
        station.set_local_ip("10.0.0.1".into());

        // A heartbeat probe: empty payload from a new address.
        station.handle_datagram("127.0.0.1".into(), Vec::new()).await;
        listener.accept().await.unwrap();

        assert_eq!(station.known_peers().await.len(), 1);
        assert!(msg_rx.try_recv().is_err(), "blank probe must not be forwarded");
    }

    #[tokio::test]
    async fn local_datagram_is_dropped_unless_forward_all() {
        let (station, mut msg_rx, _event_rx) = make_station(9, false);
        station.set_local_ip("10.0.0.1".into());
        station.handle_datagram("10.0.0.1".into(), b"echo".to_vec()).await;
        assert!(msg_rx.try_recv().is_err());

        let (station, mut msg_rx, _event_rx) = make_station(9, true);
        station.set_local_ip("10.0.0.1".into());
        station.handle_datagram("10.0.0.1".into(), b"echo".to_vec()).await;
        let msg = msg_rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"echo");
    }
}
