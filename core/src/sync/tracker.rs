//! Single owner of the tracked peer address
//!
//! Every read and write of the peer address goes through one actor task:
//! discovery resolutions, inbound pings and heartbeat failures are all
//! messages to it. The actor also owns the heartbeat task, so "peer known"
//! and "heartbeat running" change together.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::discovery::{select_peer_address, DiscoveryEvent};
use crate::service::{EventSink, SyncEvent};
use crate::sync::heartbeat::{self, HeartbeatSettings};
use crate::sync::PeerAddress;

/// Commands handled by the tracker actor
#[derive(Debug)]
enum TrackerCommand {
    Get {
        respond_to: oneshot::Sender<Option<PeerAddress>>,
    },
    TrySet {
        addr: PeerAddress,
        respond_to: oneshot::Sender<bool>,
    },
    Clear {
        respond_to: oneshot::Sender<Option<PeerAddress>>,
    },
    HeartbeatActive {
        respond_to: oneshot::Sender<bool>,
    },
    HeartbeatFailed {
        epoch: u64,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the peer tracker actor
#[derive(Clone, Debug)]
pub struct PeerTracker {
    tx: mpsc::Sender<TrackerCommand>,
}

impl PeerTracker {
    /// Start the actor.
    ///
    /// `discovery` is the ordered stream of discovery events; resolved peers
    /// are adopted through the same set-if-absent path as inbound pings.
    pub fn spawn(
        settings: HeartbeatSettings,
        discovery: mpsc::Receiver<DiscoveryEvent>,
        events: EventSink,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);

        let actor = TrackerActor {
            peer: None,
            heartbeat: None,
            epoch: 0,
            settings,
            events,
            handle: tx.downgrade(),
        };
        let task = tokio::spawn(actor.run(rx, discovery));

        (Self { tx }, task)
    }

    /// Currently tracked peer
    pub async fn get(&self) -> Option<PeerAddress> {
        self.request(|respond_to| TrackerCommand::Get { respond_to })
            .await
            .flatten()
    }

    /// Adopt `addr` if no peer is known. Returns whether it was adopted.
    pub async fn try_set(&self, addr: PeerAddress) -> bool {
        self.request(|respond_to| TrackerCommand::TrySet { addr, respond_to })
            .await
            .unwrap_or(false)
    }

    /// Forget the peer and stop the heartbeat. Returns the forgotten peer.
    pub async fn clear(&self) -> Option<PeerAddress> {
        self.request(|respond_to| TrackerCommand::Clear { respond_to })
            .await
            .flatten()
    }

    /// Whether a heartbeat task is running
    #[cfg(test)]
    pub(crate) async fn heartbeat_active(&self) -> bool {
        self.request(|respond_to| TrackerCommand::HeartbeatActive { respond_to })
            .await
            .unwrap_or(false)
    }

    /// Stop the heartbeat and the actor
    pub async fn shutdown(&self) {
        let _ = self
            .request(|respond_to| TrackerCommand::Shutdown { respond_to })
            .await;
    }

    pub(crate) async fn heartbeat_failed(&self, epoch: u64) {
        if self.tx.send(TrackerCommand::HeartbeatFailed { epoch }).await.is_err() {
            tracing::debug!("peer tracker already stopped");
        }
    }

    /// `None` once the actor has stopped
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand,
    ) -> Option<T> {
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(command(respond_to)).await.is_err() {
            tracing::debug!("peer tracker already stopped");
            return None;
        }
        rx.await.ok()
    }
}

struct TrackerActor {
    peer: Option<PeerAddress>,
    heartbeat: Option<JoinHandle<()>>,
    /// Bumped for every heartbeat started, so a late failure report from an
    /// old heartbeat cannot clear a newer peer
    epoch: u64,
    settings: HeartbeatSettings,
    events: EventSink,
    handle: mpsc::WeakSender<TrackerCommand>,
}

impl TrackerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<TrackerCommand>,
        mut discovery: mpsc::Receiver<DiscoveryEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = discovery.recv() => self.handle_discovery(event),
            }
        }

        self.stop_heartbeat();
        tracing::debug!("peer tracker stopped");
    }

    /// Returns `false` once the actor should stop
    fn handle_command(&mut self, command: TrackerCommand) -> bool {
        match command {
            TrackerCommand::Get { respond_to } => {
                let _ = respond_to.send(self.peer);
            }
            TrackerCommand::TrySet { addr, respond_to } => {
                let _ = respond_to.send(self.try_set(addr));
            }
            TrackerCommand::Clear { respond_to } => {
                self.stop_heartbeat();
                let cleared = self.peer.take();
                if let Some(peer) = cleared {
                    tracing::info!(peer = %peer, "peer cleared");
                    self.events.emit(SyncEvent::PeerLost(peer));
                }
                let _ = respond_to.send(cleared);
            }
            TrackerCommand::HeartbeatActive { respond_to } => {
                let _ = respond_to.send(self.heartbeat_running());
            }
            TrackerCommand::HeartbeatFailed { epoch } => {
                if epoch != self.epoch {
                    return true;
                }
                // The heartbeat task exits by itself after reporting
                self.heartbeat = None;
                if let Some(peer) = self.peer.take() {
                    tracing::info!(peer = %peer, "peer lost");
                    self.events.emit(SyncEvent::PeerLost(peer));
                }
            }
            TrackerCommand::Shutdown { respond_to } => {
                self.stop_heartbeat();
                self.peer = None;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found { name } => tracing::info!("service found: {}", name),
            DiscoveryEvent::Resolved {
                name,
                addresses,
                port,
            } => match select_peer_address(&addresses, port) {
                Some(addr) => {
                    tracing::info!("service resolved: {} at {}", name, addr);
                    if !self.try_set(addr) {
                        tracing::debug!("already tracking a peer, ignoring {}", addr);
                    }
                }
                None => tracing::debug!("service {} has no non-loopback address", name),
            },
            DiscoveryEvent::Lost { name } => tracing::info!("service lost: {}", name),
        }
    }

    fn try_set(&mut self, addr: PeerAddress) -> bool {
        if self.peer.is_some() {
            return false;
        }

        self.peer = Some(addr);
        tracing::info!(peer = %addr, "peer adopted");
        self.events.emit(SyncEvent::PeerConnected(addr));
        self.start_heartbeat(addr);
        true
    }

    fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn start_heartbeat(&mut self, addr: PeerAddress) {
        if self.heartbeat_running() {
            return;
        }
        let Some(tx) = self.handle.upgrade() else {
            return;
        };

        self.epoch += 1;
        self.heartbeat = Some(tokio::spawn(heartbeat::run(
            addr,
            self.epoch,
            self.settings.clone(),
            PeerTracker { tx },
        )));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}
