//! Same-subnet clipboard broadcast over UDP multicast
//!
//! A [`MulticastLink`] joins a fixed group, writes every datagram it
//! receives to the clipboard, and broadcasts outgoing clipboard text to the
//! group. Each datagram is one message: raw UTF-8, no framing, at most
//! [`MAX_DATAGRAM_SIZE`] bytes.

mod socket;

use socket::DatagramSource;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::clipboard::ClipboardStore;
use crate::protocol::constants::{
    MAX_DATAGRAM_SIZE, MULTICAST_GROUP_V4, MULTICAST_GROUP_V6, MULTICAST_PORT,
    RECEIVE_RETRY_ATTEMPTS,
};
use crate::retry::RetryPolicy;
use crate::service::{EventSink, SyncEvent, SyncSource};
use crate::{Config, Error, Result};

/// How long `dispose` waits for the receive task to leave the group
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Address family of the multicast group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

/// Immutable description of the group a link joins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub group: IpAddr,
    pub port: u16,
    /// Largest payload accepted for sending and read per datagram
    pub max_payload: usize,
    /// Interface address used to join, leave and send (IPv4)
    pub interface_v4: Ipv4Addr,
    /// Interface index used to join, leave and send (IPv6), 0 = any
    pub interface_v6: u32,
}

impl GroupConfig {
    pub fn for_version(version: IpVersion) -> Self {
        let group = match version {
            IpVersion::V4 => IpAddr::V4(MULTICAST_GROUP_V4),
            IpVersion::V6 => IpAddr::V6(MULTICAST_GROUP_V6),
        };
        Self {
            group,
            port: MULTICAST_PORT,
            max_payload: MAX_DATAGRAM_SIZE,
            interface_v4: Ipv4Addr::UNSPECIFIED,
            interface_v6: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::for_version(config.ip_version).with_port(config.multicast_port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_interface_v4(mut self, interface: Ipv4Addr) -> Self {
        self.interface_v4 = interface;
        self
    }

    pub fn version(&self) -> IpVersion {
        match self.group {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Destination of outgoing datagrams
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }
}

/// Platform permission to receive multicast (e.g. a Wi-Fi multicast lock).
///
/// Implementations are non-reference-counted: one `release` undoes any
/// number of `acquire` calls. A refused permission is reported as
/// [`Error::Lock`].
pub trait MulticastLock: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self);
    fn is_held(&self) -> bool;
}

/// Resources of one live link
struct LinkHandle {
    sender: UdpSocket,
    shutdown: oneshot::Sender<()>,
    receiver: JoinHandle<()>,
}

/// Multicast clipboard link
pub struct MulticastLink {
    config: GroupConfig,
    clipboard: Arc<dyn ClipboardStore>,
    lock: Option<Arc<dyn MulticastLock>>,
    events: EventSink,
    retry: RetryPolicy,
    handle: Option<LinkHandle>,
}

impl MulticastLink {
    pub fn new(config: GroupConfig, clipboard: Arc<dyn ClipboardStore>) -> Self {
        Self {
            config,
            clipboard,
            lock: None,
            events: EventSink::default(),
            retry: RetryPolicy {
                attempts: RECEIVE_RETRY_ATTEMPTS,
                ..RetryPolicy::default()
            },
            handle: None,
        }
    }

    /// Hold `lock` while the link is live
    pub fn with_lock(mut self, lock: Arc<dyn MulticastLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Policy for rebuilding the receive socket after an I/O error
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Whether the link is created and its receive task is still running
    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| !h.receiver.is_finished())
    }

    /// Join the group: acquire the lock if not held, open the send socket,
    /// and start the receive task.
    ///
    /// Must be called from within a tokio runtime. Calling it on a live
    /// link does nothing.
    pub fn create(&mut self) -> Result<()> {
        if self.is_active() {
            tracing::debug!("multicast link already active");
            return Ok(());
        }
        // Receive task gave up earlier; replace it.
        self.handle = None;

        let acquired = self.acquire_lock()?;

        let sockets = socket::sender_socket(&self.config)
            .and_then(|sender| Ok((sender, socket::receiver_socket(&self.config)?)));
        let (sender, receiver_socket) = match sockets {
            Ok(s) => s,
            Err(e) => {
                if acquired {
                    self.release_lock();
                }
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let rebuild_config = self.config.clone();
        let receiver = tokio::spawn(receive_loop(
            receiver_socket,
            move || socket::receiver_socket(&rebuild_config),
            self.config.clone(),
            self.clipboard.clone(),
            self.events.clone(),
            self.retry,
            shutdown_rx,
        ));

        self.handle = Some(LinkHandle {
            sender,
            shutdown,
            receiver,
        });

        tracing::info!("multicast link created on {}", self.config.group_addr());
        Ok(())
    }

    /// Broadcast `text` to the group.
    ///
    /// Text larger than one datagram is rejected, never fragmented.
    pub async fn send_data(&self, text: &str) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::NotInitialized("sender socket not initialized".to_string()))?;

        let payload = text.as_bytes();
        if payload.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            });
        }

        handle
            .sender
            .send_to(payload, self.config.group_addr())
            .await
            .map_err(|e| Error::Network(format!("multicast send failed: {}", e)))?;

        tracing::debug!("broadcast {} bytes to {}", payload.len(), self.config.group_addr());
        Ok(())
    }

    /// Stop the receive task, close the send socket, release the lock.
    ///
    /// Safe to call any number of times.
    pub async fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            let LinkHandle {
                sender,
                shutdown,
                mut receiver,
            } = handle;

            // Err means the task already exited on its own
            let _ = shutdown.send(());

            if tokio::time::timeout(DISPOSE_TIMEOUT, &mut receiver).await.is_err() {
                tracing::warn!("multicast receive task did not stop in time, aborting");
                receiver.abort();
            }
            drop(sender);
            tracing::info!("multicast link disposed");
        }

        self.release_lock();
    }

    /// Returns whether this call took the lock
    fn acquire_lock(&self) -> Result<bool> {
        match &self.lock {
            Some(lock) if !lock.is_held() => {
                lock.acquire()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_lock(&self) {
        if let Some(lock) = &self.lock {
            if lock.is_held() {
                lock.release();
            }
        }
    }
}

/// Deliver datagrams until shut down.
///
/// A receive error rebuilds the source after a backoff delay. Once
/// `policy.attempts` rebuilds in a row are followed by another error, the
/// loop emits [`SyncEvent::LinkFailed`] and exits. Any datagram received
/// successfully resets the count.
async fn receive_loop<S, F>(
    mut source: S,
    mut rebuild: F,
    config: GroupConfig,
    clipboard: Arc<dyn ClipboardStore>,
    events: EventSink,
    policy: RetryPolicy,
    mut shutdown: oneshot::Receiver<()>,
) where
    S: DatagramSource,
    F: FnMut() -> Result<S> + Send + 'static,
{
    // One spare byte tells an oversize datagram apart from one that fits
    let mut buf = vec![0u8; config.max_payload + 1];
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            received = source.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    failures = 0;
                    if len > config.max_payload {
                        tracing::debug!(
                            "dropping oversize datagram from {} (more than {} bytes)",
                            from,
                            config.max_payload
                        );
                        continue;
                    }
                    deliver(&buf[..len], from, clipboard.as_ref(), &events);
                }
                Err(e) => {
                    failures += 1;
                    if failures > policy.attempts {
                        tracing::error!(
                            "multicast receive failed after {} socket rebuild(s): {}",
                            policy.attempts,
                            e
                        );
                        events.emit(SyncEvent::LinkFailed(e.to_string()));
                        return;
                    }

                    let delay = policy.delay_after(failures);
                    tracing::warn!(
                        "multicast receive error (rebuild {}/{} in {:?}): {}",
                        failures,
                        policy.attempts,
                        delay,
                        e
                    );

                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match rebuild() {
                        Ok(fresh) => source = fresh,
                        Err(e) => tracing::warn!("failed to rebuild multicast socket: {}", e),
                    }
                }
            },
        }
    }

    if let Err(e) = source.leave(&config) {
        tracing::warn!("failed to leave multicast group: {}", e);
    }
    tracing::debug!("multicast receive task stopped");
}

/// Write one received datagram to the clipboard. Best effort: anything
/// that is not valid UTF-8 or cannot be written is dropped.
fn deliver(payload: &[u8], from: SocketAddr, clipboard: &dyn ClipboardStore, events: &EventSink) {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => {
            tracing::debug!("dropping non-UTF-8 datagram from {}", from);
            return;
        }
    };

    match clipboard.write(text) {
        Ok(()) => {
            tracing::info!("received clipboard from {}", from);
            events.emit(SyncEvent::ClipboardReceived {
                source: SyncSource::Multicast(from),
                text: text.to_string(),
            });
        }
        Err(e) => tracing::debug!("dropping datagram from {}: {}", from, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingLock {
        held: AtomicBool,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl MulticastLock for CountingLock {
        fn acquire(&self) -> Result<()> {
            self.held.store(true, Ordering::SeqCst);
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) {
            self.held.store(false, Ordering::SeqCst);
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn is_held(&self) -> bool {
            self.held.load(Ordering::SeqCst)
        }
    }

    struct DeniedLock;

    impl MulticastLock for DeniedLock {
        fn acquire(&self) -> Result<()> {
            Err(Error::Lock("permission refused".to_string()))
        }

        fn release(&self) {}

        fn is_held(&self) -> bool {
            false
        }
    }

    type Script = Arc<Mutex<VecDeque<io::Result<(Vec<u8>, SocketAddr)>>>>;

    /// Replays scripted receive results, then waits forever
    struct ScriptedSource {
        script: Script,
    }

    impl DatagramSource for ScriptedSource {
        fn recv_from(
            &mut self,
            buf: &mut [u8],
        ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
            let next = self.script.lock().unwrap().pop_front();
            let result = next.map(|r| {
                r.map(|(payload, from)| {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    (len, from)
                })
            });
            async move {
                match result {
                    Some(r) => r,
                    None => std::future::pending().await,
                }
            }
        }

        fn leave(&self, _config: &GroupConfig) -> Result<()> {
            Ok(())
        }
    }

    fn reset() -> io::Result<(Vec<u8>, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn loopback_group(port: u16) -> GroupConfig {
        GroupConfig::for_version(IpVersion::V4)
            .with_port(port)
            .with_interface_v4(Ipv4Addr::LOCALHOST)
    }

    async fn wait_for(clipboard: &MemoryClipboard, expected: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if clipboard.read().unwrap().as_deref() == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn test_group_config_defaults() {
        let v4 = GroupConfig::for_version(IpVersion::V4);
        assert_eq!(v4.group_addr(), "224.0.0.123:7645".parse().unwrap());
        assert_eq!(v4.max_payload, 1024);

        let v6 = GroupConfig::for_version(IpVersion::V6);
        assert_eq!(v6.group_addr(), "[ff02::123]:7645".parse().unwrap());
        assert_eq!(v6.version(), IpVersion::V6);
    }

    #[tokio::test]
    async fn test_send_before_create_fails() {
        let link = MulticastLink::new(loopback_group(47651), Arc::new(MemoryClipboard::new()));
        let err = link.send_data("hello").await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_dispose_without_create_is_noop() {
        let lock = Arc::new(CountingLock::default());
        let mut link = MulticastLink::new(loopback_group(47652), Arc::new(MemoryClipboard::new()))
            .with_lock(lock.clone());

        link.dispose().await;
        link.dispose().await;
        assert_eq!(lock.released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_releases_and_recreates() {
        let lock = Arc::new(CountingLock::default());
        let mut link = MulticastLink::new(loopback_group(47653), Arc::new(MemoryClipboard::new()))
            .with_lock(lock.clone());

        if let Err(e) = link.create() {
            eprintln!("skipping: multicast unavailable on this host: {}", e);
            return;
        }
        assert!(link.is_active());
        assert!(lock.is_held());

        // second create on a live link keeps the existing resources
        link.create().unwrap();
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);

        link.dispose().await;
        assert!(!link.is_active());
        assert!(!lock.is_held());

        link.dispose().await;
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);

        link.create().unwrap();
        assert!(link.is_active());
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 2);
        link.dispose().await;
    }

    #[tokio::test]
    async fn test_lock_already_held_is_not_reacquired() {
        let lock = Arc::new(CountingLock::default());
        lock.acquire().unwrap();

        let mut link = MulticastLink::new(loopback_group(47654), Arc::new(MemoryClipboard::new()))
            .with_lock(lock.clone());
        if link.create().is_err() {
            return;
        }
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        link.dispose().await;
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let mut link = MulticastLink::new(loopback_group(47655), Arc::new(MemoryClipboard::new()));
        if link.create().is_err() {
            return;
        }

        let text = "x".repeat(MAX_DATAGRAM_SIZE + 1);
        let err = link.send_data(&text).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 1025, max: 1024 }));
        link.dispose().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_link() {
        let port = 47656;
        let clipboard_a = Arc::new(MemoryClipboard::new());
        let clipboard_b = Arc::new(MemoryClipboard::new());
        let mut a = MulticastLink::new(loopback_group(port), clipboard_a.clone());
        let mut b = MulticastLink::new(loopback_group(port), clipboard_b.clone());

        if let Err(e) = a.create().and_then(|_| b.create()) {
            eprintln!("skipping: multicast unavailable on this host: {}", e);
            return;
        }
        if let Err(e) = a.send_data("hello").await {
            eprintln!("skipping: multicast send unavailable on this host: {}", e);
            a.dispose().await;
            b.dispose().await;
            return;
        }

        assert!(wait_for(&clipboard_b, "hello", Duration::from_millis(200)).await);
        // loopback mode: the sender hears itself too
        assert!(wait_for(&clipboard_a, "hello", Duration::from_millis(200)).await);

        let limit = "é".repeat(MAX_DATAGRAM_SIZE / 2);
        a.send_data(&limit).await.unwrap();
        assert!(wait_for(&clipboard_b, &limit, Duration::from_millis(500)).await);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn test_non_utf8_datagram_dropped() {
        let port = 47657;
        let clipboard = Arc::new(MemoryClipboard::new());
        let config = loopback_group(port);
        let mut link = MulticastLink::new(config.clone(), clipboard.clone());
        if link.create().is_err() {
            return;
        }

        let raw = match socket::sender_socket(&config) {
            Ok(s) => s,
            Err(_) => return,
        };
        if raw.send_to(&[0xff, 0xfe, 0xfd], config.group_addr()).await.is_err() {
            link.dispose().await;
            return;
        }
        link.send_data("after garbage").await.unwrap();

        assert!(wait_for(&clipboard, "after garbage", Duration::from_millis(500)).await);
        assert_eq!(clipboard.write_count(), 1);
        link.dispose().await;
    }

    #[tokio::test]
    async fn test_oversize_datagram_dropped_on_receive() {
        let port = 47658;
        let clipboard = Arc::new(MemoryClipboard::new());
        let config = loopback_group(port);
        let mut link = MulticastLink::new(config.clone(), clipboard.clone());
        if link.create().is_err() {
            return;
        }

        let raw = match socket::sender_socket(&config) {
            Ok(s) => s,
            Err(_) => return,
        };
        let oversize = vec![b'a'; 1500];
        if raw.send_to(&oversize, config.group_addr()).await.is_err() {
            link.dispose().await;
            return;
        }
        link.send_data("fits").await.unwrap();

        assert!(wait_for(&clipboard, "fits", Duration::from_millis(500)).await);
        assert_eq!(clipboard.write_count(), 1);
        link.dispose().await;
    }

    #[tokio::test]
    async fn test_repeated_receive_errors_end_in_link_failed() {
        let script: Script = Arc::new(Mutex::new(VecDeque::new()));
        script.lock().unwrap().extend((0..10).map(|_| reset()));
        let rebuilds = Arc::new(AtomicUsize::new(0));
        let (events, mut rx) = EventSink::channel(4);
        let (_shutdown, shutdown_rx) = oneshot::channel();

        let counter = rebuilds.clone();
        let rebuild_script = script.clone();
        let task = tokio::spawn(receive_loop(
            ScriptedSource { script: script.clone() },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedSource {
                    script: rebuild_script.clone(),
                })
            },
            loopback_group(47659),
            Arc::new(MemoryClipboard::new()),
            events,
            fast_retry(),
            shutdown_rx,
        ));

        let finished = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(finished.is_ok(), "receive loop kept retrying");
        assert_eq!(rebuilds.load(Ordering::SeqCst), 3);
        assert!(matches!(rx.recv().await, Some(SyncEvent::LinkFailed(_))));
    }

    #[tokio::test]
    async fn test_received_datagram_resets_error_count() {
        let from: SocketAddr = "192.168.1.7:7645".parse().unwrap();
        let script: Script = Arc::new(Mutex::new(VecDeque::new()));
        {
            let mut queue = script.lock().unwrap();
            queue.extend((0..3).map(|_| reset()));
            queue.push_back(Ok((b"between errors".to_vec(), from)));
            queue.extend((0..3).map(|_| reset()));
        }
        let rebuilds = Arc::new(AtomicUsize::new(0));
        let clipboard = Arc::new(MemoryClipboard::new());
        let (events, mut rx) = EventSink::channel(8);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let counter = rebuilds.clone();
        let rebuild_script = script.clone();
        let task = tokio::spawn(receive_loop(
            ScriptedSource { script: script.clone() },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedSource {
                    script: rebuild_script.clone(),
                })
            },
            loopback_group(47660),
            clipboard.clone(),
            events,
            fast_retry(),
            shutdown_rx,
        ));

        let deadline = Instant::now() + Duration::from_secs(2);
        while rebuilds.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rebuilds.load(Ordering::SeqCst), 6);
        assert_eq!(clipboard.read().unwrap().as_deref(), Some("between errors"));
        assert!(!task.is_finished());

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SyncEvent::ClipboardReceived { source: SyncSource::Multicast(addr), .. }) if addr == from
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_denied_lock_fails_create() {
        let mut link = MulticastLink::new(loopback_group(47661), Arc::new(MemoryClipboard::new()))
            .with_lock(Arc::new(DeniedLock));

        let err = link.create().unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        assert!(!link.is_active());
        assert!(matches!(link.send_data("x").await, Err(Error::NotInitialized(_))));
    }
}
