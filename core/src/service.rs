//! Peer discovery and unicast sync service
//!
//! Coordinates the push listener, the peer tracker (and its heartbeat) and
//! mDNS advertise/browse behind explicit `start`/`stop` calls.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clipboard::ClipboardStore;
use crate::discovery::{DiscoveryEvent, DiscoveryService, ServiceIdentity};
use crate::multicast::MulticastLock;
use crate::retry;
use crate::sync::{
    HeartbeatSettings, PeerAddress, PeerClient, PeerTracker, PushServer, PushServerHandle,
};
use crate::{Config, Error, Result};

/// Where an inbound clipboard update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// A datagram on the multicast group
    Multicast(SocketAddr),
    /// A unicast push to the listener
    Peer(SocketAddr),
}

/// Events emitted by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Clipboard was written from a remote update
    ClipboardReceived { source: SyncSource, text: String },
    /// A peer was adopted and its heartbeat started
    PeerConnected(PeerAddress),
    /// The peer was cleared
    PeerLost(PeerAddress),
    /// An outbound push failed; the peer is kept
    PushFailed { peer: PeerAddress, error: String },
    /// The multicast receive loop gave up
    LinkFailed(String),
    /// Advertising or browsing could not be started
    DiscoveryFailed(String),
}

/// Optional, non-blocking outlet for [`SyncEvent`]s
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<SyncEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self(Some(tx))
    }

    /// Create a sink together with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Emit without waiting. Events are dropped when nobody listens or the
    /// consumer lags behind.
    pub fn emit(&self, event: SyncEvent) {
        let Some(tx) = &self.0 else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            tracing::debug!("dropping sync event: {}", e);
        }
    }
}

/// Resources held while the service runs
struct Running {
    server: PushServerHandle,
    client: PeerClient,
    tracker: PeerTracker,
    tracker_task: JoinHandle<()>,
    discovery: Option<DiscoveryService>,
}

/// Advertises this device, finds one peer and keeps it in sync
pub struct PeerSyncService {
    config: Config,
    clipboard: Arc<dyn ClipboardStore>,
    lock: Option<Arc<dyn MulticastLock>>,
    events: EventSink,
    running: Option<Running>,
}

impl PeerSyncService {
    pub fn new(config: Config, clipboard: Arc<dyn ClipboardStore>) -> Self {
        Self {
            config,
            clipboard,
            lock: None,
            events: EventSink::default(),
            running: None,
        }
    }

    /// Hold `lock` while the service runs
    pub fn with_lock(mut self, lock: Arc<dyn MulticastLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Port of the push listener while running
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.server.port())
    }

    /// Handle to the peer tracker while running
    pub fn tracker(&self) -> Option<&PeerTracker> {
        self.running.as_ref().map(|r| &r.tracker)
    }

    /// The tracked peer, if any
    pub async fn peer(&self) -> Option<PeerAddress> {
        match &self.running {
            Some(running) => running.tracker.get().await,
            None => None,
        }
    }

    /// Start listening, advertising and browsing. No-op when running.
    ///
    /// Only a listener bind failure is returned. Lock and discovery
    /// failures are logged (and reported as events); the service then runs
    /// with just the listener, so a peer can still adopt us by pinging.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            tracing::debug!("peer sync service already running");
            return Ok(());
        }

        let server = PushServer::bind(self.config.sync_port).await?;
        let port = server.port();

        let mut client = PeerClient::new(self.config.ping_timeout, port)?;
        if let Some(ip) = self.config.advertised_ip {
            client = client.with_advertised_addr(SocketAddr::new(ip, port));
        }
        match client.advertised_addr() {
            Some(addr) => tracing::info!("announcing {} in pings", addr),
            None => tracing::warn!("no non-loopback address found, pings carry no IP header"),
        }

        let settings = HeartbeatSettings {
            probe: Arc::new(client.clone()),
            interval: self.config.heartbeat_interval,
        };
        let (discovery_tx, discovery_rx) = mpsc::channel(32);
        let (tracker, tracker_task) =
            PeerTracker::spawn(settings, discovery_rx, self.events.clone());

        let server = server.start(tracker.clone(), self.clipboard.clone(), self.events.clone());

        if let Some(lock) = &self.lock {
            if !lock.is_held() {
                if let Err(e) = lock.acquire() {
                    tracing::warn!("failed to acquire multicast lock: {}", e);
                }
            }
        }

        let discovery = if self.config.discovery_enabled {
            match self.start_discovery(port, discovery_tx).await {
                Ok(discovery) => Some(discovery),
                Err(e) => {
                    tracing::error!("discovery unavailable: {}", e);
                    self.events.emit(SyncEvent::DiscoveryFailed(e.to_string()));
                    None
                }
            }
        } else {
            tracing::info!("discovery disabled");
            None
        };

        self.running = Some(Running {
            server,
            client,
            tracker,
            tracker_task,
            discovery,
        });

        tracing::info!("peer sync service started on port {}", port);
        Ok(())
    }

    async fn start_discovery(
        &self,
        port: u16,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<DiscoveryService> {
        let policy = self.config.discovery_retry;
        let identity = ServiceIdentity {
            name: self.config.service_name.clone(),
            service_type: self.config.service_type.clone(),
            port,
        };

        let mut discovery =
            retry::with_backoff(&policy, "mDNS daemon start", DiscoveryService::new).await?;

        let started = async {
            retry::with_backoff(&policy, "mDNS registration", || discovery.register(&identity))
                .await?;
            retry::with_backoff(&policy, "mDNS browse", || {
                discovery.browse(&identity.service_type, &identity.name, tx.clone())
            })
            .await
        }
        .await;

        match started {
            Ok(()) => Ok(discovery),
            Err(e) => {
                if let Err(unregister) = discovery.unregister() {
                    tracing::warn!("failed to unregister service: {}", unregister);
                }
                if let Err(shutdown) = discovery.shutdown() {
                    tracing::warn!("failed to shut down mDNS daemon: {}", shutdown);
                }
                Err(e)
            }
        }
    }

    /// Tear everything down. Each step runs even when an earlier one fails.
    /// No-op when stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        if let Err(e) = running.server.stop().await {
            tracing::warn!("failed to stop push server: {}", e);
        }

        if let Some(mut discovery) = running.discovery {
            if let Err(e) = discovery.stop_browse() {
                tracing::warn!("failed to stop browsing: {}", e);
            }
            if let Err(e) = discovery.unregister() {
                tracing::warn!("failed to unregister service: {}", e);
            }
            if let Err(e) = discovery.shutdown() {
                tracing::warn!("failed to shut down mDNS daemon: {}", e);
            }
        }

        if let Some(lock) = &self.lock {
            if lock.is_held() {
                lock.release();
            }
        }

        running.tracker.shutdown().await;
        if let Err(e) = running.tracker_task.await {
            tracing::warn!("peer tracker task failed: {}", e);
        }

        tracing::info!("peer sync service stopped");
    }

    /// Push clipboard text to the tracked peer.
    ///
    /// Returns `Ok(false)` when no peer is known. A failed push is reported
    /// but never clears the peer.
    pub async fn push(&self, text: &str) -> Result<bool> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| Error::NotInitialized("peer sync service not started".to_string()))?;
        let Some(peer) = running.tracker.get().await else {
            tracing::debug!("no peer known, not pushing");
            return Ok(false);
        };

        match running.client.push(peer, text).await {
            Ok(()) => {
                tracing::info!(peer = %peer, "pushed clipboard");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(peer = %peer, "push failed: {}", e);
                self.events.emit(SyncEvent::PushFailed {
                    peer,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}
