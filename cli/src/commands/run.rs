//! Run command implementation.

use std::sync::Arc;

use clipsync_core::clipboard::start_monitor;
use clipsync_core::{
    Config, EventSink, GroupConfig, MulticastLink, PeerSyncService, SyncEvent, SyncSource,
    SystemClipboard, TrackedClipboard,
};

use crate::ui::{format_preview, print_banner};

/// Run the multicast link and the peer sync service until Ctrl+C.
pub async fn run_sync(config: Config, multicast: bool) -> anyhow::Result<()> {
    print_banner();

    let clipboard = Arc::new(TrackedClipboard::new(Arc::new(SystemClipboard::new())));
    let (events, mut event_rx) = EventSink::channel(64);

    let mut link = if multicast {
        let group = GroupConfig::from_config(&config);
        let mut link =
            MulticastLink::new(group, clipboard.clone()).with_events(events.clone());
        link.create()?;
        println!("\x1b[1mMulticast:\x1b[0m {}", link.config().group_addr());
        Some(link)
    } else {
        None
    };

    let mut service =
        PeerSyncService::new(config.clone(), clipboard.clone()).with_events(events);
    service.start().await?;

    println!("\x1b[1mService:\x1b[0m   {}", config.service_name);
    if let Some(port) = service.port() {
        println!("\x1b[1mListening:\x1b[0m port {}", port);
    }

    let (mut changes, monitor) = start_monitor(clipboard, config.clipboard_poll_interval);

    println!("\n\x1b[1;32m✓\x1b[0m Watching the clipboard and the network...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                handle_event(event);
            }
            Some(text) = changes.recv() => {
                broadcast_change(link.as_ref(), &service, &text).await;
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                break;
            }
        }
    }

    monitor.abort();
    if let Some(link) = link.as_mut() {
        link.dispose().await;
    }
    service.stop().await;

    Ok(())
}

/// Send a local clipboard change over every active transport.
async fn broadcast_change(link: Option<&MulticastLink>, service: &PeerSyncService, text: &str) {
    println!("\x1b[1;34m📤\x1b[0m Copied: \"{}\"", format_preview(text));

    if let Some(link) = link {
        if let Err(e) = link.send_data(text).await {
            tracing::warn!("multicast send failed: {}", e);
        }
    }

    // failures arrive as SyncEvent::PushFailed
    if let Ok(true) = service.push(text).await {
        println!("\x1b[1;34m📤\x1b[0m Pushed to peer");
    }
}

/// Handle a sync event and print appropriate output.
fn handle_event(event: SyncEvent) {
    match event {
        SyncEvent::ClipboardReceived { source, text } => {
            let from = match source {
                SyncSource::Multicast(addr) => format!("{} (multicast)", addr),
                SyncSource::Peer(addr) => format!("{} (peer)", addr),
            };
            println!("\x1b[1;34m📋\x1b[0m Received from {}: \"{}\"", from, format_preview(&text));
        }
        SyncEvent::PeerConnected(peer) => {
            println!("\x1b[1;32m⬤\x1b[0m Peer: \x1b[1m{}\x1b[0m", peer);
        }
        SyncEvent::PeerLost(peer) => {
            println!("\x1b[1;31m⬤\x1b[0m Lost: {}", peer);
        }
        SyncEvent::PushFailed { peer, error } => {
            eprintln!("\x1b[1;31m✗\x1b[0m Push to {} failed: {}", peer, error);
        }
        SyncEvent::LinkFailed(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Multicast stopped: {}", e);
        }
        SyncEvent::DiscoveryFailed(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Discovery unavailable: {}", e);
        }
    }
}
