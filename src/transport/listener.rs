use crate::Result;
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

/// Raw inbound traffic reported by the listener, before any peer-registry
/// processing.
#[derive(Debug)]
pub(crate) enum ListenerEvent {
    /// A remote peer opened a TCP connection to us.
    Connection { stream: TcpStream, remote_ip: String },
    /// A datagram arrived on the broadcast channel.
    Datagram { source_ip: String, payload: Vec<u8> },
}

/// Accepts inbound TCP connections and inbound UDP datagrams on the
/// protocol port and forwards them as raw events. The UDP socket is shared
/// with the base station so outbound broadcasts originate from the same
/// port peers listen on.
pub struct Listener {
    port: u16,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl Listener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            shutdown: Mutex::new(None),
        }
    }

    /// Bind both sockets and spawn the accept and datagram loops. Returns
    /// the bound UDP socket for outbound use.
    pub(crate) async fn start(
        &self,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Result<Arc<UdpSocket>> {
        let tcp = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let udp = UdpSocket::bind(("0.0.0.0", self.port)).await?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Ok(mut guard) = self.shutdown.lock() {
            *guard = Some(shutdown_tx);
        }

        info!("Listening on port {} (tcp + udp)", self.port);

        let accept_events = events.clone();
        let mut accept_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    conn = tcp.accept() => {
                        match conn {
                            Ok((stream, addr)) => {
                                debug!("Inbound connection from {}", addr);
                                let _ = accept_events.send(ListenerEvent::Connection {
                                    stream,
                                    remote_ip: addr.ip().to_string(),
                                });
                            }
                            Err(e) => error!("Error accepting connection: {}", e),
                        }
                    }
                    _ = accept_shutdown.changed() => {
                        info!("Shutting down accept loop");
                        break;
                    }
                }
            }
        });

        let datagram_socket = udp.clone();
        let mut datagram_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    received = datagram_socket.recv_from(&mut buf) => {
                        match received {
                            Ok((n, addr)) => {
                                let _ = events.send(ListenerEvent::Datagram {
                                    source_ip: addr.ip().to_string(),
                                    payload: buf[..n].to_vec(),
                                });
                            }
                            Err(e) => error!("Error receiving datagram: {}", e),
                        }
                    }
                    _ = datagram_shutdown.changed() => {
                        info!("Shutting down datagram loop");
                        break;
                    }
                }
            }
        });

        Ok(udp)
    }

    /// Signal both loops to exit. The sockets are released once the loops
    /// observe the signal.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    // Bind on an ephemeral port by probing: the listener needs one port for
    // both protocols, so grab a free TCP port number and release it before
    // the listener binds it for real.
    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    #[tokio::test]
    async fn reports_inbound_connections_and_datagrams() {
        let port = free_port().await;
        let listener = Listener::new(port);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _udp = listener.start(tx).await.unwrap();

        // Inbound TCP connection
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        match rx.recv().await.unwrap() {
            ListenerEvent::Connection { remote_ip, .. } => {
                assert_eq!(remote_ip, "127.0.0.1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        stream.shutdown().await.unwrap();

        // Inbound datagram
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();
        match rx.recv().await.unwrap() {
            ListenerEvent::Datagram { source_ip, payload } => {
                assert_eq!(source_ip, "127.0.0.1");
                assert_eq!(payload, b"ping");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        listener.stop();
    }
}
