//! Send command implementation.

use std::sync::Arc;

use clipsync_core::{Config, GroupConfig, MemoryClipboard, MulticastLink};

/// Join the group, broadcast `text` once, and leave.
pub async fn send_once(config: Config, text: &str) -> anyhow::Result<()> {
    let group = GroupConfig::from_config(&config);
    let target = group.group_addr();

    // Our own datagram loops back; keep it off the system clipboard
    let mut link = MulticastLink::new(group, Arc::new(MemoryClipboard::new()));
    link.create()?;

    let sent = link.send_data(text).await;
    link.dispose().await;
    sent?;

    println!("\x1b[1;32m✓\x1b[0m Sent {} bytes to {}", text.len(), target);
    Ok(())
}
