//! mDNS service advertisement and browsing
//!
//! mdns-sd delivers its events on a blocking channel. A forwarder thread
//! turns them into [`DiscoveryEvent`]s on a single ordered tokio channel,
//! which the peer tracker consumes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread::JoinHandle;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// What this device advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub service_type: String,
    pub port: u16,
}

/// Event from the discovery substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A service instance appeared; resolution follows
    Found { name: String },
    /// A service instance was resolved to addresses and a port
    Resolved {
        name: String,
        addresses: Vec<IpAddr>,
        port: u16,
    },
    /// A service instance went away
    Lost { name: String },
}

/// mDNS discovery service
pub struct DiscoveryService {
    daemon: ServiceDaemon,
    registered: Option<String>,
    browsing: Option<(String, JoinHandle<()>)>,
}

impl DiscoveryService {
    /// Create a new discovery service
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;

        Ok(Self {
            daemon,
            registered: None,
            browsing: None,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing.is_some()
    }

    /// Advertise `identity`, replacing any earlier registration
    pub fn register(&mut self, identity: &ServiceIdentity) -> Result<()> {
        if self.registered.is_some() {
            self.unregister()?;
        }

        let host_name = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "clipsync".to_string())
        );

        let service = ServiceInfo::new(
            &identity.service_type,
            &identity.name,
            &host_name,
            (),
            identity.port,
            HashMap::<String, String>::new(),
        )
        .map_err(|e| Error::Discovery(e.to_string()))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        tracing::info!("registered mDNS service: {}", fullname);
        self.registered = Some(fullname);
        Ok(())
    }

    /// Withdraw the advertisement. No-op when nothing is registered.
    pub fn unregister(&mut self) -> Result<()> {
        let Some(fullname) = self.registered.take() else {
            return Ok(());
        };

        self.daemon
            .unregister(&fullname)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        tracing::info!("unregistered mDNS service: {}", fullname);
        Ok(())
    }

    /// Browse for `service_type` and forward events to `tx`.
    ///
    /// Instances named `own_name` are this device and are never forwarded.
    /// Restarts the browse if one is already running.
    pub fn browse(
        &mut self,
        service_type: &str,
        own_name: &str,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<()> {
        if self.browsing.is_some() {
            self.stop_browse()?;
        }

        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let own_name = own_name.to_string();
        let forwarder = std::thread::Builder::new()
            .name("clipsync-discovery".to_string())
            .spawn(move || {
                // Ends when the browse is stopped or the daemon shuts down
                while let Ok(event) = receiver.recv() {
                    let Some(event) = map_event(event, &own_name) else {
                        continue;
                    };
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                tracing::debug!("discovery forwarder stopped");
            })?;

        tracing::info!("browsing for {}", service_type);
        self.browsing = Some((service_type.to_string(), forwarder));
        Ok(())
    }

    /// Stop browsing. No-op when not browsing.
    pub fn stop_browse(&mut self) -> Result<()> {
        let Some((service_type, _forwarder)) = self.browsing.take() else {
            return Ok(());
        };

        self.daemon
            .stop_browse(&service_type)
            .map_err(|e| Error::Discovery(e.to_string()))?;

        tracing::info!("stopped browsing for {}", service_type);
        Ok(())
    }

    /// Shutdown the discovery service
    pub fn shutdown(self) -> Result<()> {
        self.daemon
            .shutdown()
            .map_err(|e| Error::Discovery(e.to_string()))?;
        Ok(())
    }
}

/// Instance label of an mDNS full name (`name._clipsync._tcp.local.` -> `name`)
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or(fullname))
        .to_string()
}

fn map_event(event: ServiceEvent, own_name: &str) -> Option<DiscoveryEvent> {
    let event = match event {
        ServiceEvent::ServiceFound(service_type, fullname) => DiscoveryEvent::Found {
            name: instance_name(&fullname, &service_type),
        },
        ServiceEvent::ServiceResolved(info) => DiscoveryEvent::Resolved {
            name: instance_name(info.get_fullname(), info.get_type()),
            addresses: info.get_addresses().iter().copied().collect(),
            port: info.get_port(),
        },
        ServiceEvent::ServiceRemoved(service_type, fullname) => DiscoveryEvent::Lost {
            name: instance_name(&fullname, &service_type),
        },
        _ => return None,
    };

    let name = match &event {
        DiscoveryEvent::Found { name }
        | DiscoveryEvent::Resolved { name, .. }
        | DiscoveryEvent::Lost { name } => name,
    };
    if name == own_name {
        tracing::trace!("ignoring own service {}", name);
        return None;
    }

    Some(event)
}

/// Pick the address to reach a resolved peer at: the first non-loopback
/// IPv4 address, else the first non-loopback IPv6 address.
pub fn select_peer_address(addresses: &[IpAddr], port: u16) -> Option<SocketAddr> {
    let usable = || addresses.iter().filter(|ip| !ip.is_loopback());
    usable()
        .find(|ip| ip.is_ipv4())
        .or_else(|| usable().next())
        .map(|ip| SocketAddr::new(*ip, port))
}

/// Get local IP addresses (non-loopback)
pub fn get_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();

    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if !iface.is_loopback() {
                ips.push(iface.ip());
            }
        }
    }

    ips
}

/// First non-loopback IPv4 address, the address peers are told to ping back
pub fn local_ipv4() -> Option<Ipv4Addr> {
    get_local_ips().into_iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_clipsync._tcp.local.";

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("laptop._clipsync._tcp.local.", TYPE), "laptop");
        assert_eq!(instance_name("my.laptop._clipsync._tcp.local.", TYPE), "my.laptop");
        assert_eq!(instance_name("other.thing.", TYPE), "other");
    }

    #[test]
    fn test_own_service_is_suppressed() {
        let found = ServiceEvent::ServiceFound(TYPE.to_string(), format!("android.{}", TYPE));
        assert_eq!(map_event(found, "android"), None);

        let found = ServiceEvent::ServiceFound(TYPE.to_string(), format!("laptop.{}", TYPE));
        assert_eq!(
            map_event(found, "android"),
            Some(DiscoveryEvent::Found { name: "laptop".to_string() })
        );
    }

    #[test]
    fn test_resolved_event_mapping() {
        let info = ServiceInfo::new(
            TYPE,
            "laptop",
            "laptop.local.",
            "192.168.1.5",
            6942,
            HashMap::<String, String>::new(),
        )
        .unwrap();

        match map_event(ServiceEvent::ServiceResolved(info), "android") {
            Some(DiscoveryEvent::Resolved { name, addresses, port }) => {
                assert_eq!(name, "laptop");
                assert_eq!(addresses, vec!["192.168.1.5".parse::<IpAddr>().unwrap()]);
                assert_eq!(port, 6942);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_select_peer_address() {
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = "192.168.1.5".parse().unwrap();

        assert_eq!(select_peer_address(&[loopback], 6942), None);
        assert_eq!(
            select_peer_address(&[loopback, v6, v4], 6942),
            Some(SocketAddr::new(v4, 6942))
        );
        assert_eq!(
            select_peer_address(&[v6], 6942),
            Some(SocketAddr::new(v6, 6942))
        );
    }

    #[test]
    fn test_get_local_ips() {
        let ips = get_local_ips();
        assert!(ips.iter().all(|ip| !ip.is_loopback()));
    }

    #[test]
    fn test_register_browse_lifecycle() {
        // May fail where multicast sockets are unavailable
        let mut discovery = match DiscoveryService::new() {
            Ok(d) => d,
            Err(e) => {
                eprintln!("skipping: mDNS daemon unavailable: {}", e);
                return;
            }
        };
        let identity = ServiceIdentity {
            name: "clipsync-test".to_string(),
            service_type: TYPE.to_string(),
            port: 46942,
        };

        // teardown steps are no-ops before anything was started
        discovery.unregister().unwrap();
        discovery.stop_browse().unwrap();
        assert!(!discovery.is_registered());
        assert!(!discovery.is_browsing());

        if let Err(e) = discovery.register(&identity) {
            eprintln!("skipping: mDNS registration unavailable: {}", e);
            let _ = discovery.shutdown();
            return;
        }
        assert!(discovery.is_registered());

        // registering again replaces the earlier advertisement
        discovery.register(&identity).unwrap();
        assert!(discovery.is_registered());

        let (tx, _rx) = mpsc::channel(8);
        discovery.browse(TYPE, &identity.name, tx.clone()).unwrap();
        assert!(discovery.is_browsing());
        discovery.browse(TYPE, &identity.name, tx).unwrap();
        assert!(discovery.is_browsing());

        discovery.stop_browse().unwrap();
        assert!(!discovery.is_browsing());
        discovery.stop_browse().unwrap();

        discovery.unregister().unwrap();
        assert!(!discovery.is_registered());
        discovery.unregister().unwrap();
        assert!(!discovery.is_registered());

        discovery.shutdown().unwrap();
    }
}
