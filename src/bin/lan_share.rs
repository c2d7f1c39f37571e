use anyhow::Result;
use lanlink::file::{FileManager, FileManagerConfig};
use lanlink::{P2pEvent, TransferDirection};
use log::{error, info};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    info!("---- LAN File Sharing Utility ----");
    info!("Peers on the same subnet discover each other automatically.");
    info!("");

    let (manager, mut events) = FileManager::new(FileManagerConfig::default());
    manager.enable_automatic_discovery(Duration::from_secs(1));
    manager.start().await?;

    if let Some(ip) = manager.local_ip() {
        info!("This peer is {}", ip);
    }

    // Report everything the stack emits.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            report_event(event);
        }
    });

    print_help();

    let mut input = String::new();
    loop {
        input.clear();
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush()?;
        std::io::stdin().read_line(&mut input)?;
        let input = input.trim();

        if input.is_empty() {
            continue;
        }
        let parts: Vec<&str> = input.split_whitespace().collect();

        match parts[0].to_lowercase().as_str() {
            "help" | "h" => print_help(),
            "list" | "ls" => {
                let peers = manager.known_peers().await;
                if peers.is_empty() {
                    info!("No peers discovered yet");
                } else {
                    info!("Known peers:");
                    for (i, peer) in peers.iter().enumerate() {
                        let state = if peer.active { "active" } else { "inactive" };
                        info!("  {}. {} ({})", i + 1, peer.ip, state);
                    }
                }
            }
            "connect" => {
                if parts.len() < 2 {
                    error!("Usage: connect <ip>");
                    continue;
                }
                match manager.direct_connect(parts[1]).await {
                    Ok(()) => info!("Connected to {}", parts[1]),
                    Err(e) => error!("Connect failed: {}", e),
                }
            }
            "send" => {
                if parts.len() < 3 {
                    error!("Usage: send <ip> <file_path>");
                    continue;
                }
                match manager.send_file(parts[1], parts[2]).await {
                    Ok(()) => info!("Transfer started"),
                    Err(e) => error!("Failed to send file: {}", e),
                }
            }
            "sendall" => {
                if parts.len() < 2 {
                    error!("Usage: sendall <file_path>");
                    continue;
                }
                match manager.send_file_to_all(parts[1]).await {
                    Ok(()) => info!("Transfers started"),
                    Err(e) => error!("Failed to send file: {}", e),
                }
            }
            "exit" | "quit" | "q" => {
                info!("Shutting down...");
                manager.stop().await;
                break;
            }
            other => {
                error!("Unknown command: {}", other);
                print_help();
            }
        }
    }

    Ok(())
}

fn print_help() {
    info!("\nAvailable commands:");
    info!("  help, h           - Show this help");
    info!("  list, ls          - List known peers");
    info!("  connect <ip>      - Connect to a peer directly");
    info!("  send <ip> <file>  - Send a file to one peer");
    info!("  sendall <file>    - Send a file to every known peer");
    info!("  exit, quit, q     - Exit");
    info!("");
}

fn report_event(event: P2pEvent) {
    match event {
        P2pEvent::PeerChange { peers } => {
            info!("Peer registry changed: {} peer(s)", peers.len());
        }
        P2pEvent::ObjReceived { metadata, .. } => {
            info!(
                "Object '{}' ({} bytes) from {}",
                metadata.object_type, metadata.total_msg_size_bytes, metadata.source_ip
            );
        }
        P2pEvent::FileReceived {
            source_ip,
            file_name,
            total_parts,
        } => {
            info!(
                "Receiving {} from {} ({} part(s))",
                file_name, source_ip, total_parts
            );
        }
        P2pEvent::FileProgUpdate {
            direction,
            progress,
        } => {
            let verb = match direction {
                TransferDirection::Send => "sent",
                TransferDirection::Receive => "received",
            };
            info!(
                "{} part {}/{} of {} ({:.1}%)",
                verb,
                progress.part_num,
                progress.total_parts,
                progress.file_name,
                progress.percent_complete()
            );
        }
    }
}
