use crate::events::{P2pEvent, TransferDirection};
use crate::file::file_part::{AckMessage, FilePartObj};
use crate::file::transfer::{FileReceiveReq, FileSentReq, TransferKey};
use crate::object::{BObject, Metadata, ObjectManager, ObjectType};
use crate::transport::PeerInfo;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BUFFER_SIZE: usize = 100 * 1024;

/// Configuration for the file transfer layer.
#[derive(Debug, Clone)]
pub struct FileManagerConfig {
    /// Port this peer listens on and sends from.
    pub port: u16,
    /// Forward locally-originated messages instead of dropping them. Used
    /// for loopback diagnostics.
    pub forward_all: bool,
    /// Directory inbound files are materialized under.
    pub receive_dir: PathBuf,
    /// Buffer size used when `send_file` is called without one. Also the
    /// maximum amount of file content held in memory per transfer.
    pub buffer_size: usize,
    /// How long a transfer may wait for an ack before it is abandoned.
    /// `None` disables the sweep.
    pub ack_timeout: Option<Duration>,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            forward_all: false,
            receive_dir: PathBuf::from("./temp"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            ack_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Sends and receives files between peers, built on top of
/// [`ObjectManager`].
///
/// Transfers are chunked and strictly stop-and-wait: after the first part,
/// every further part is released only by the acknowledgment of the one
/// before it. Chunking bounds peak memory to one buffer per transfer; the
/// ack gating exists for flow control and progress visibility, not
/// retransmission (TCP is already reliable underneath). Transfers to
/// different peers, or of different files, proceed independently.
pub struct FileManager {
    inner: Arc<Inner>,
}

struct Inner {
    objects: ObjectManager,
    config: FileManagerConfig,
    sent_files: Mutex<HashMap<TransferKey, FileSentReq>>,
    received_files: Mutex<HashMap<TransferKey, FileReceiveReq>>,
    event_tx: mpsc::UnboundedSender<P2pEvent>,
}

impl FileManager {
    /// Build the full stack. The returned receiver carries every event the
    /// stack emits, in transition order.
    pub fn new(config: FileManagerConfig) -> (Self, mpsc::UnboundedReceiver<P2pEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let objects = ObjectManager::new(config.port, config.forward_all, event_tx.clone());
        let manager = Self {
            inner: Arc::new(Inner {
                objects,
                config,
                sent_files: Mutex::new(HashMap::new()),
                received_files: Mutex::new(HashMap::new()),
                event_tx,
            }),
        };
        (manager, event_rx)
    }

    /// Start listening. Resolves the local address and begins dispatching
    /// inbound objects; fails with
    /// [`Error::NoNetworkInterface`](crate::Error) when no connected
    /// interface exists.
    pub async fn start(&self) -> Result<()> {
        self.inner.objects.start().await?;

        let Some(mut obj_rx) = self.inner.objects.take_objects() else {
            return Ok(());
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some((object, metadata)) = obj_rx.recv().await {
                inner.handle_object(object, metadata).await;
            }
            info!("File dispatch loop stopped");
        });

        if let Some(timeout) = self.inner.config.ack_timeout {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.sweep_stalled_transfers(timeout).await;
            });
        }
        Ok(())
    }

    /// Start the heartbeat broadcaster so peers on the subnet discover this
    /// one automatically.
    pub fn enable_automatic_discovery(&self, interval: Duration) {
        self.inner.objects.enable_automatic_discovery(interval);
    }

    /// Begin a chunked transfer using the configured buffer size.
    pub async fn send_file(&self, ip: &str, file_path: &str) -> Result<()> {
        self.send_file_with_buffer(ip, file_path, self.inner.config.buffer_size)
            .await
    }

    /// Begin a chunked transfer. A smaller buffer triggers progress events
    /// more often at the cost of more round trips; the buffer is also the
    /// most file content the transfer holds in memory at once.
    pub async fn send_file_with_buffer(
        &self,
        ip: &str,
        file_path: &str,
        buffer_size: usize,
    ) -> Result<()> {
        self.inner.start_send(ip, file_path, buffer_size).await
    }

    /// Fan a file out to every currently known peer. Each peer's transfer
    /// is kicked off in turn and then proceeds independently.
    pub async fn send_file_to_all(&self, file_path: &str) -> Result<()> {
        let peers = self.known_peers().await;
        for peer in peers {
            self.send_file(&peer.ip, file_path).await?;
        }
        Ok(())
    }

    /// Send a typed object to one peer, bypassing file chunking.
    pub async fn send_object<T: Serialize + ObjectType>(&self, ip: &str, obj: &T) -> Result<bool> {
        self.inner.objects.send_async_tcp(ip, obj).await
    }

    /// Broadcast a typed object to the subnet, bypassing file chunking.
    pub async fn broadcast_object<T: Serialize + ObjectType>(&self, obj: &T) -> Result<()> {
        self.inner.objects.send_broadcast_async_udp(obj).await
    }

    /// Explicit outbound connection, for integration with externally
    /// managed peer sets.
    pub async fn direct_connect(&self, ip: &str) -> Result<()> {
        self.inner.objects.direct_connect(ip).await
    }

    pub async fn known_peers(&self) -> Vec<PeerInfo> {
        self.inner.objects.known_peers().await
    }

    pub fn local_ip(&self) -> Option<String> {
        self.inner.objects.local_ip()
    }

    pub async fn stop(&self) {
        self.inner.objects.stop().await;
    }
}

impl Inner {
    async fn handle_object(&self, object: BObject, metadata: Metadata) {
        let _ = self.event_tx.send(P2pEvent::ObjReceived {
            object: object.clone(),
            metadata: metadata.clone(),
        });

        match object.object_type() {
            FilePartObj::OBJECT_TYPE => match object.get_object::<FilePartObj>() {
                Ok(part) => {
                    if let Err(e) = self.received_file_part(&part, &metadata).await {
                        error!("Failed to store part from {}: {}", metadata.source_ip, e);
                        return;
                    }
                    if let Err(e) = self.send_ack_back(&part, &metadata).await {
                        error!("Failed to ack part to {}: {}", metadata.source_ip, e);
                    }
                }
                Err(e) => warn!("Undecodable file part from {}: {}", metadata.source_ip, e),
            },
            AckMessage::OBJECT_TYPE => match object.get_object::<AckMessage>() {
                Ok(ack) => {
                    if let Err(e) = self.process_ack(&ack, &metadata).await {
                        error!("Ack from {} not processed: {}", metadata.source_ip, e);
                    }
                }
                Err(e) => warn!("Undecodable ack from {}: {}", metadata.source_ip, e),
            },
            _ => {}
        }
    }

    /// Open the file, register the transfer and push part 1. Every later
    /// part is released by `process_ack`.
    async fn start_send(&self, ip: &str, file_path: &str, buffer_size: usize) -> Result<()> {
        let mut request = FileSentReq::open(ip, file_path, buffer_size).await?;
        info!(
            "Sending {} to {} in {} part(s)",
            file_path,
            ip,
            request.total_parts()
        );

        let Some(first_part) = request.next_part().await? else {
            return Ok(());
        };
        let progress = request.progress();
        let key = TransferKey::new(ip, &first_part.file_name, &first_part.file_path);
        self.sent_files.lock().await.insert(key.clone(), request);

        let delivered = match self.objects.send_async_tcp(ip, &first_part).await {
            Ok(delivered) => delivered,
            Err(e) => {
                // The transfer never got off the ground; don't leave its
                // state behind waiting for an ack that cannot come.
                self.sent_files.lock().await.remove(&key);
                return Err(e);
            }
        };
        if !delivered {
            warn!("Peer {} is inactive; first part not delivered", ip);
        }
        let _ = self.event_tx.send(P2pEvent::FileProgUpdate {
            direction: TransferDirection::Send,
            progress,
        });
        Ok(())
    }

    /// Write one inbound part, acknowledge it, and close out the transfer
    /// on the final part.
    async fn received_file_part(&self, part: &FilePartObj, metadata: &Metadata) -> Result<()> {
        let key = TransferKey::new(&metadata.source_ip, &part.file_name, &part.file_path);

        if part.part_num == 1 {
            let request =
                FileReceiveReq::create(&self.config.receive_dir, part, &metadata.source_ip).await?;
            self.received_files
                .lock()
                .await
                .insert(key.clone(), request);
            let _ = self.event_tx.send(P2pEvent::FileReceived {
                source_ip: metadata.source_ip.clone(),
                file_name: part.file_name.clone(),
                total_parts: part.total_parts,
            });
        }

        let progress = {
            let mut received = self.received_files.lock().await;
            let request = received.get_mut(&key).ok_or_else(|| {
                Error::FileNotFound(format!(
                    "received a part of {} from {} but no matching transfer is open",
                    part.file_name, metadata.source_ip
                ))
            })?;
            request.write_part(part).await?;
            let progress = request.progress();

            if part.part_num == part.total_parts {
                if let Some(request) = received.remove(&key) {
                    request.finish().await?;
                    info!(
                        "Received {} from {} complete",
                        part.file_name, metadata.source_ip
                    );
                }
            }
            progress
        };

        let _ = self.event_tx.send(P2pEvent::FileProgUpdate {
            direction: TransferDirection::Receive,
            progress,
        });
        Ok(())
    }

    async fn send_ack_back(&self, part: &FilePartObj, metadata: &Metadata) -> Result<()> {
        let ack = AckMessage::new(part);
        let delivered = self.objects.send_async_tcp(&metadata.source_ip, &ack).await?;
        if !delivered {
            warn!("Peer {} is inactive; ack not delivered", metadata.source_ip);
        }
        Ok(())
    }

    /// Match an ack against the open transfers and release the next part.
    /// An ack that matches nothing is a protocol error.
    async fn process_ack(&self, ack: &AckMessage, metadata: &Metadata) -> Result<()> {
        let key = TransferKey::new(&metadata.source_ip, &ack.file_name, &ack.file_path);

        let released = {
            let mut sent = self.sent_files.lock().await;
            let request = sent.get_mut(&key).ok_or_else(|| {
                Error::FileNotFound(format!(
                    "ack for {} from {} matches no transfer in sent storage",
                    ack.file_name, metadata.source_ip
                ))
            })?;

            match request.next_part().await? {
                Some(part) => {
                    let progress = request.progress();
                    let target_ip = request.target_ip().to_string();
                    Some((part, progress, target_ip))
                }
                None => {
                    // Final ack: all parts are out, drop the bookkeeping.
                    sent.remove(&key);
                    debug!(
                        "Transfer of {} to {} complete",
                        ack.file_name, metadata.source_ip
                    );
                    None
                }
            }
        };

        if let Some((part, progress, target_ip)) = released {
            let delivered = self.objects.send_async_tcp(&target_ip, &part).await?;
            if !delivered {
                warn!("Peer {} is inactive; part {} not delivered", target_ip, part.part_num);
            }
            let _ = self.event_tx.send(P2pEvent::FileProgUpdate {
                direction: TransferDirection::Send,
                progress,
            });
        }
        Ok(())
    }

    /// Periodically drop outbound transfers whose ack never came. The
    /// source protocol had no policy for a stalled ack; abandoning the
    /// transfer bounds memory and surfaces the failure in the log.
    async fn sweep_stalled_transfers(&self, timeout: Duration) {
        let period = std::cmp::max(timeout / 2, Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let mut sent = self.sent_files.lock().await;
            let stalled: Vec<TransferKey> = sent
                .iter()
                .filter(|(_, req)| !req.is_complete() && req.idle_for() > timeout)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stalled {
                sent.remove(&key);
                error!(
                    "abandoning transfer: {}",
                    Error::Timeout(format!(
                        "no ack for {} from {} within {:?}",
                        key.file_name, key.ip, timeout
                    ))
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_manager(receive_dir: PathBuf) -> (FileManager, mpsc::UnboundedReceiver<P2pEvent>) {
        FileManager::new(FileManagerConfig {
            receive_dir,
            ..FileManagerConfig::default()
        })
    }

    fn metadata_from(ip: &str) -> Metadata {
        Metadata {
            object_type: String::new(),
            total_msg_size_bytes: 0,
            is_two_way: false,
            source_ip: ip.to_string(),
        }
    }

    #[tokio::test]
    async fn unmatched_ack_is_file_not_found() {
        let dir = tempdir().unwrap();
        let (manager, _events) = test_manager(dir.path().to_path_buf());

        let ack = AckMessage {
            file_name: "ghost.txt".into(),
            file_path: "/src/ghost.txt".into(),
            part_num: 1,
        };
        let err = manager
            .inner
            .process_ack(&ack, &metadata_from("10.0.0.2"))
            .await;
        assert!(matches!(err, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn unmatched_ack_leaves_other_transfers_alone() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("keep.bin");
        std::fs::write(&src, vec![1u8; 64]).unwrap();
        let (manager, _events) = test_manager(dir.path().to_path_buf());

        // One live transfer with part 1 already produced.
        let mut req = FileSentReq::open("10.0.0.2", src.to_str().unwrap(), 32)
            .await
            .unwrap();
        req.next_part().await.unwrap();
        let key = TransferKey::new("10.0.0.2", "keep.bin", src.to_str().unwrap());
        manager.inner.sent_files.lock().await.insert(key.clone(), req);

        let bogus = AckMessage {
            file_name: "other.bin".into(),
            file_path: "/elsewhere/other.bin".into(),
            part_num: 1,
        };
        let err = manager
            .inner
            .process_ack(&bogus, &metadata_from("10.0.0.2"))
            .await;
        assert!(matches!(err, Err(Error::FileNotFound(_))));
        assert!(manager.inner.sent_files.lock().await.contains_key(&key));
    }

    #[tokio::test]
    async fn final_ack_removes_the_completed_transfer() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("small.bin");
        std::fs::write(&src, vec![7u8; 10]).unwrap();
        let (manager, _events) = test_manager(dir.path().to_path_buf());

        // Single-part transfer with its only part already out.
        let mut req = FileSentReq::open("10.0.0.2", src.to_str().unwrap(), 1024)
            .await
            .unwrap();
        let part = req.next_part().await.unwrap().unwrap();
        assert_eq!(part.total_parts, 1);
        let key = TransferKey::new("10.0.0.2", "small.bin", src.to_str().unwrap());
        manager.inner.sent_files.lock().await.insert(key.clone(), req);

        let ack = AckMessage::new(&part);
        manager
            .inner
            .process_ack(&ack, &metadata_from("10.0.0.2"))
            .await
            .unwrap();
        assert!(!manager.inner.sent_files.lock().await.contains_key(&key));
    }

    #[tokio::test]
    async fn zero_buffer_size_is_rejected_up_front() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("some.bin");
        std::fs::write(&src, vec![5u8; 16]).unwrap();
        let (manager, _events) = test_manager(dir.path().to_path_buf());

        let err = manager
            .send_file_with_buffer("10.0.0.2", src.to_str().unwrap(), 0)
            .await;
        assert!(matches!(err, Err(Error::Io(_))));
        assert!(manager.inner.sent_files.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_first_part_send_cleans_up_the_transfer() {
        // Nothing listens on the probed port once it is released.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let dir = tempdir().unwrap();
        let src = dir.path().join("doomed.bin");
        std::fs::write(&src, vec![9u8; 32]).unwrap();
        let (manager, _events) = FileManager::new(FileManagerConfig {
            port,
            receive_dir: dir.path().to_path_buf(),
            ..FileManagerConfig::default()
        });

        let err = manager.send_file("127.0.0.1", src.to_str().unwrap()).await;
        assert!(matches!(err, Err(Error::PeerNotKnown(_))));
        assert!(manager.inner.sent_files.lock().await.is_empty());
    }

    #[tokio::test]
    async fn part_without_open_transfer_is_file_not_found() {
        let dir = tempdir().unwrap();
        let (manager, _events) = test_manager(dir.path().join("temp"));

        // Part 2 with no part 1 ever seen.
        let part = FilePartObj {
            file_name: "orphan.txt".into(),
            file_path: "/src/orphan.txt".into(),
            part_num: 2,
            total_parts: 3,
            data: vec![0u8; 8],
        };
        let err = manager
            .inner
            .received_file_part(&part, &metadata_from("10.0.0.2"))
            .await;
        assert!(matches!(err, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn single_part_receive_materializes_file_and_emits_events() {
        let dir = tempdir().unwrap();
        let receive_dir = dir.path().join("temp");
        let (manager, mut events) = test_manager(receive_dir.clone());

        let part = FilePartObj {
            file_name: "note.txt".into(),
            file_path: "/src/note.txt".into(),
            part_num: 1,
            total_parts: 1,
            data: b"hello over the lan".to_vec(),
        };
        manager
            .inner
            .received_file_part(&part, &metadata_from("10.0.0.2"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            P2pEvent::FileReceived {
                source_ip,
                file_name,
                total_parts,
            } => {
                assert_eq!(source_ip, "10.0.0.2");
                assert_eq!(file_name, "note.txt");
                assert_eq!(total_parts, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            P2pEvent::FileProgUpdate {
                direction,
                progress,
            } => {
                assert_eq!(direction, TransferDirection::Receive);
                assert_eq!(progress.part_num, 1);
                assert_eq!(progress.percent_complete(), 100.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Final part: stream closed and state cleaned up.
        assert!(manager.inner.received_files.lock().await.is_empty());
        let written = std::fs::read(receive_dir.join("note.txt")).unwrap();
        assert_eq!(written, b"hello over the lan");
    }

    #[tokio::test]
    async fn multi_part_receive_tracks_progress_per_part() {
        let dir = tempdir().unwrap();
        let receive_dir = dir.path().join("temp");
        let (manager, mut events) = test_manager(receive_dir.clone());
        let meta = metadata_from("10.0.0.2");

        let make_part = |num: u64, data: &[u8]| FilePartObj {
            file_name: "chunks.bin".into(),
            file_path: "/src/chunks.bin".into(),
            part_num: num,
            total_parts: 3,
            data: data.to_vec(),
        };

        manager
            .inner
            .received_file_part(&make_part(1, &[1; 4]), &meta)
            .await
            .unwrap();
        manager
            .inner
            .received_file_part(&make_part(2, &[2; 4]), &meta)
            .await
            .unwrap();
        assert_eq!(manager.inner.received_files.lock().await.len(), 1);
        manager
            .inner
            .received_file_part(&make_part(3, &[3; 2]), &meta)
            .await
            .unwrap();
        assert!(manager.inner.received_files.lock().await.is_empty());

        let written = std::fs::read(receive_dir.join("chunks.bin")).unwrap();
        assert_eq!(written, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3]);

        // FileReceived, then one progress event per part.
        let mut progress_parts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let P2pEvent::FileProgUpdate { progress, .. } = event {
                progress_parts.push(progress.part_num);
            }
        }
        assert_eq!(progress_parts, [1, 2, 3]);
    }

    #[tokio::test]
    async fn transfers_from_different_peers_are_independent() {
        let dir = tempdir().unwrap();
        let receive_dir = dir.path().join("temp");
        let (manager, _events) = test_manager(receive_dir.clone());

        let part_for = |name: &str, data: u8| FilePartObj {
            file_name: name.into(),
            file_path: format!("/src/{}", name),
            part_num: 1,
            total_parts: 2,
            data: vec![data; 4],
        };

        manager
            .inner
            .received_file_part(&part_for("a.bin", 0xa), &metadata_from("10.0.0.2"))
            .await
            .unwrap();
        manager
            .inner
            .received_file_part(&part_for("b.bin", 0xb), &metadata_from("10.0.0.3"))
            .await
            .unwrap();

        let received = manager.inner.received_files.lock().await;
        assert_eq!(received.len(), 2, "each peer's transfer tracked separately");
    }
}
