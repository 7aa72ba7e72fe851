//! Info command implementation.

use clipsync_core::{Config, GroupConfig};

/// Display the advertised identity and network endpoints.
pub fn show_info(config: &Config) {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let group = GroupConfig::from_config(config);

    println!("\n\x1b[1mClipSync Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mHost:\x1b[0m         {}", host);
    println!("\x1b[1mService:\x1b[0m      {}", config.service_name);
    println!("\x1b[1mType:\x1b[0m         {}", config.service_type);
    println!("\x1b[1mSync port:\x1b[0m    {}", config.sync_port);
    println!("\x1b[1mMulticast:\x1b[0m    {}", group.group_addr());

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in clipsync_core::discovery::get_local_ips() {
        println!("  • {}", ip);
    }
    println!();
}
