use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Upper bound on a single frame. Protects the receive loop from a bogus
/// length prefix allocating unbounded memory.
pub(crate) const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Events a peer's receive loop reports to the base station.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// One complete frame arrived over this peer's connection.
    Message { source_ip: String, payload: Vec<u8> },
    /// The connection broke; the peer is now inactive.
    Disconnected { ip: String },
}

/// Read-only view of one registry entry, handed out in `PeerChange`
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: String,
    pub active: bool,
}

/// One live TCP connection to a remote peer.
///
/// Each peer runs its own receive loop; every frame on the wire is a u32
/// big-endian length followed by exactly that many payload bytes. The peer
/// is owned by the base station's registry and removed when its connection
/// reports inactive.
#[derive(Clone)]
pub struct Peer {
    ip: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    active: Arc<AtomicBool>,
}

impl Peer {
    /// Wrap an established connection and spawn its receive loop. Liveness
    /// transitions and inbound frames are reported on `events`.
    pub(crate) fn spawn(
        stream: TcpStream,
        ip: String,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let active = Arc::new(AtomicBool::new(true));

        let loop_ip = ip.clone();
        let loop_active = active.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_loop(reader, &loop_ip, &events).await {
                debug!("Peer {} receive loop ended: {}", loop_ip, e);
            }
            loop_active.store(false, Ordering::SeqCst);
            let _ = events.send(PeerEvent::Disconnected { ip: loop_ip });
        });

        Self {
            ip,
            writer: Arc::new(Mutex::new(writer)),
            active,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            ip: self.ip.clone(),
            active: self.is_active(),
        }
    }

    /// Write one frame to this peer. Returns false if the write failed; the
    /// peer is marked inactive in that case and the receive loop will report
    /// the disconnect.
    pub async fn send(&self, payload: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        let len = (payload.len() as u32).to_be_bytes();
        let result = async {
            writer.write_all(&len).await?;
            writer.write_all(payload).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to peer {} failed: {}", self.ip, e);
                self.active.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    ip: &str,
    events: &mpsc::UnboundedSender<PeerEvent>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        if events
            .send(PeerEvent::Message {
                source_ip: ip.to_string(),
                payload,
            })
            .is_err()
        {
            // Dispatch loop is gone; nothing left to deliver to.
            return Ok(());
        }
    }
}
