use crate::transport::BaseStation;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Periodically broadcasts a liveness datagram so other peers on the subnet
/// can discover this one passively.
///
/// The datagram carries no payload: receiving base stations use the sender
/// address to connect back and filter the zero-length body out before it
/// reaches the application.
pub struct HeartBeat {
    interval: Duration,
    station: Arc<BaseStation>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl HeartBeat {
    pub fn new(interval: Duration, station: Arc<BaseStation>) -> Self {
        Self {
            interval,
            station,
            shutdown: Mutex::new(None),
        }
    }

    /// Start the broadcast loop. Idempotent; a second call while running is
    /// ignored.
    pub fn start_broadcasting(&self) {
        let mut guard = match self.shutdown.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel(1);
        *guard = Some(tx);

        let station = self.station.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            info!("Heartbeat broadcasting every {:?}", period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = station.send_broadcast_udp(&[]).await {
                            warn!("Heartbeat broadcast failed: {}", e);
                        }
                    }
                    _ = rx.recv() => {
                        info!("Heartbeat stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop broadcasting. The rest of the stack keeps running.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.try_send(());
            }
        }
    }
}
