use crate::events::P2pEvent;
use crate::object::{BObject, Metadata, ObjectType};
use crate::transport::{PeerInfo, PeerManager};
use crate::{Error, Result};
use log::{info, warn};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Messages above this declared size are rejected when the sender asked for
/// a two-way size handshake.
const DEFAULT_MAX_MSG_SIZE: u64 = 64 * 1024 * 1024;

/// Serialize `metadata` (JSON) and prepend it to the payload:
/// u32 BE metadata length | metadata | payload.
fn encode_envelope(metadata: &Metadata, payload: &[u8]) -> Result<Vec<u8>> {
    let meta_bytes = serde_json::to_vec(metadata)?;
    let mut frame = Vec::with_capacity(4 + meta_bytes.len() + payload.len());
    frame.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&meta_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse an inbound frame back into its envelope and payload. `source_ip`
/// comes from the connection, not the wire.
fn decode_envelope(frame: &[u8], source_ip: &str, max_msg_size: u64) -> Result<(BObject, Metadata)> {
    if frame.len() < 4 {
        return Err(Error::Envelope("frame shorter than length prefix".into()));
    }
    let meta_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body_start = 4 + meta_len;
    if body_start > frame.len() {
        return Err(Error::Envelope(format!(
            "metadata length {} exceeds frame of {} bytes",
            meta_len,
            frame.len()
        )));
    }

    let mut metadata: Metadata = serde_json::from_slice(&frame[4..body_start])?;
    metadata.source_ip = source_ip.to_string();

    // The two-way admission point: reject on declared size before touching
    // the body.
    if metadata.is_two_way && metadata.total_msg_size_bytes > max_msg_size {
        return Err(Error::Envelope(format!(
            "declared size {} rejected (limit {})",
            metadata.total_msg_size_bytes, max_msg_size
        )));
    }

    let payload = &frame[body_start..];
    if payload.len() as u64 != metadata.total_msg_size_bytes {
        return Err(Error::Envelope(format!(
            "payload is {} bytes but envelope declared {}",
            payload.len(),
            metadata.total_msg_size_bytes
        )));
    }

    let object = BObject::new(metadata.object_type.clone(), payload.to_vec());
    Ok((object, metadata))
}

/// Frames typed objects into metadata-tagged messages and decodes inbound
/// bytes back into typed objects.
pub struct ObjectManager {
    peers: PeerManager,
    max_msg_size: u64,
    obj_tx: mpsc::UnboundedSender<(BObject, Metadata)>,
    obj_rx: Mutex<Option<mpsc::UnboundedReceiver<(BObject, Metadata)>>>,
}

impl ObjectManager {
    pub fn new(port: u16, forward_all: bool, event_tx: mpsc::UnboundedSender<P2pEvent>) -> Self {
        let (obj_tx, obj_rx) = mpsc::unbounded_channel();
        Self {
            peers: PeerManager::new(port, forward_all, event_tx),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            obj_tx,
            obj_rx: Mutex::new(Some(obj_rx)),
        }
    }

    /// Start the transport and the decode loop.
    pub async fn start(&self) -> Result<()> {
        self.peers.start().await?;

        let Some(mut msg_rx) = self.peers.take_messages() else {
            return Ok(());
        };
        let obj_tx = self.obj_tx.clone();
        let max_msg_size = self.max_msg_size;
        tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                match decode_envelope(&msg.payload, &msg.source_ip, max_msg_size) {
                    Ok(decoded) => {
                        if obj_tx.send(decoded).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping message from {}: {}", msg.source_ip, e),
                }
            }
            info!("Object decode loop stopped");
        });
        Ok(())
    }

    fn encode<T: Serialize + ObjectType>(&self, obj: &T) -> Result<Vec<u8>> {
        let payload = bincode::serialize(obj)?;
        let metadata = Metadata::outbound(T::OBJECT_TYPE, payload.len(), false);
        encode_envelope(&metadata, &payload)
    }

    /// Send a typed object to one peer over TCP. Connects on demand.
    pub async fn send_async_tcp<T: Serialize + ObjectType>(
        &self,
        ip: &str,
        obj: &T,
    ) -> Result<bool> {
        let frame = self.encode(obj)?;
        self.peers.send_msg_tcp(ip, &frame).await
    }

    /// Send a typed object to one peer as a datagram (best effort).
    pub async fn send_async_udp<T: Serialize + ObjectType>(
        &self,
        ip: &str,
        obj: &T,
    ) -> Result<bool> {
        let frame = self.encode(obj)?;
        self.peers.send_msg_udp(ip, &frame).await
    }

    /// Broadcast a typed object to the whole subnet (best effort).
    pub async fn send_broadcast_async_udp<T: Serialize + ObjectType>(&self, obj: &T) -> Result<()> {
        let frame = self.encode(obj)?;
        self.peers.send_broadcast_udp(&frame).await
    }

    /// Take the stream of decoded inbound objects. Yields `None` after the
    /// first call.
    pub(crate) fn take_objects(&self) -> Option<mpsc::UnboundedReceiver<(BObject, Metadata)>> {
        self.obj_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn enable_automatic_discovery(&self, interval: Duration) {
        self.peers.enable_automatic_discovery(interval);
    }

    pub async fn direct_connect(&self, ip: &str) -> Result<()> {
        self.peers.direct_connect(ip).await
    }

    pub fn local_ip(&self) -> Option<String> {
        self.peers.local_ip()
    }

    pub async fn known_peers(&self) -> Vec<PeerInfo> {
        self.peers.known_peers().await
    }

    pub async fn stop(&self) {
        self.peers.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        who: String,
        count: u32,
    }

    impl ObjectType for Greeting {
        const OBJECT_TYPE: &'static str = "Greeting";
    }

    fn frame_for(obj: &Greeting, is_two_way: bool) -> Vec<u8> {
        let payload = bincode::serialize(obj).unwrap();
        let metadata = Metadata::outbound(Greeting::OBJECT_TYPE, payload.len(), is_two_way);
        encode_envelope(&metadata, &payload).unwrap()
    }

    #[test]
    fn envelope_round_trips_and_fills_source_ip() {
        let original = Greeting {
            who: "b".into(),
            count: 7,
        };
        let frame = frame_for(&original, false);

        let (object, metadata) = decode_envelope(&frame, "10.0.0.2", u64::MAX).unwrap();
        assert_eq!(metadata.object_type, "Greeting");
        assert_eq!(metadata.source_ip, "10.0.0.2");
        assert_eq!(metadata.total_msg_size_bytes, object.payload().len() as u64);
        assert_eq!(object.get_object::<Greeting>().unwrap(), original);
    }

    #[test]
    fn truncated_payload_is_an_envelope_error() {
        let mut frame = frame_for(
            &Greeting {
                who: "b".into(),
                count: 7,
            },
            false,
        );
        frame.pop();
        let err = decode_envelope(&frame, "10.0.0.2", u64::MAX);
        assert!(matches!(err, Err(Error::Envelope(_))));
    }

    #[test]
    fn short_frame_is_an_envelope_error() {
        let err = decode_envelope(&[0, 1], "10.0.0.2", u64::MAX);
        assert!(matches!(err, Err(Error::Envelope(_))));
    }

    #[test]
    fn two_way_oversize_is_rejected_before_decode() {
        let frame = frame_for(
            &Greeting {
                who: "big".into(),
                count: 1,
            },
            true,
        );
        // Limit below the declared size: the admission check must fire.
        let err = decode_envelope(&frame, "10.0.0.2", 1);
        assert!(matches!(err, Err(Error::Envelope(_))));

        // Without the two-way flag the same size passes; the limit only
        // applies when the sender asked for the handshake.
        let frame = frame_for(
            &Greeting {
                who: "big".into(),
                count: 1,
            },
            false,
        );
        assert!(decode_envelope(&frame, "10.0.0.2", 1).is_ok());
    }
}
