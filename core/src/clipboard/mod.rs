//! Clipboard capability and change monitoring
//!
//! The sync engine never touches the OS clipboard directly. It is handed a
//! [`ClipboardStore`], which is either the real system clipboard or an
//! in-memory store for headless use.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arboard::Clipboard as ArboardClipboard;
use tokio::sync::mpsc;

use crate::protocol::ContentHash;
use crate::{Error, Result};

/// Get-text/set-text access to a clipboard.
///
/// Writes of identical text must be harmless: the multicast and unicast
/// channels may both deliver the same change.
pub trait ClipboardStore: Send + Sync {
    /// Current clipboard text, `None` when the clipboard holds no text
    fn read(&self) -> Result<Option<String>>;

    /// Replace the clipboard content with `text`
    fn write(&self, text: &str) -> Result<()>;
}

/// The operating system clipboard
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl SystemClipboard {
    pub fn new() -> Self {
        Self
    }
}

impl ClipboardStore for SystemClipboard {
    fn read(&self) -> Result<Option<String>> {
        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(text)),
            Ok(_) => Ok(None),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::Clipboard(e.to_string())),
        }
    }

    fn write(&self, text: &str) -> Result<()> {
        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;

        clipboard
            .set_text(text)
            .map_err(|e| Error::Clipboard(e.to_string()))
    }
}

/// In-process clipboard for headless hosts
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    content: Mutex<Option<String>>,
    writes: AtomicUsize,
    reject_writes: AtomicBool,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following write fail (or succeed again)
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

impl ClipboardStore for MemoryClipboard {
    fn read(&self) -> Result<Option<String>> {
        let content = self
            .content
            .lock()
            .map_err(|_| Error::Clipboard("clipboard mutex poisoned".to_string()))?;
        Ok(content.clone())
    }

    fn write(&self, text: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Clipboard("clipboard is not writable".to_string()));
        }

        let mut content = self
            .content
            .lock()
            .map_err(|_| Error::Clipboard("clipboard mutex poisoned".to_string()))?;
        *content = Some(text.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Clipboard wrapper that remembers the last content it has seen or written.
///
/// Inbound sync writes go through [`ClipboardStore::write`] on this wrapper,
/// so the change monitor treats them as already seen and does not send them
/// back out.
pub struct TrackedClipboard {
    inner: Arc<dyn ClipboardStore>,
    last_hash: Mutex<Option<ContentHash>>,
}

impl TrackedClipboard {
    pub fn new(inner: Arc<dyn ClipboardStore>) -> Self {
        Self {
            inner,
            last_hash: Mutex::new(None),
        }
    }

    /// Return the clipboard text if it changed since the last check or write
    pub fn poll_change(&self) -> Result<Option<String>> {
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| Error::Clipboard("clipboard mutex poisoned".to_string()))?;

        match self.inner.read()? {
            Some(text) => {
                let hash = ContentHash::of(&text);
                if last.as_ref() == Some(&hash) {
                    return Ok(None);
                }
                *last = Some(hash);
                Ok(Some(text))
            }
            None => {
                *last = None;
                Ok(None)
            }
        }
    }
}

impl ClipboardStore for TrackedClipboard {
    fn read(&self) -> Result<Option<String>> {
        self.inner.read()
    }

    fn write(&self, text: &str) -> Result<()> {
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| Error::Clipboard("clipboard mutex poisoned".to_string()))?;

        self.inner.write(text)?;
        *last = Some(ContentHash::of(text));
        Ok(())
    }
}

/// Start a clipboard monitoring task that sends changed text to a channel.
///
/// Whatever is on the clipboard when monitoring starts counts as seen; only
/// later changes are reported.
pub fn start_monitor(
    clipboard: Arc<TrackedClipboard>,
    poll_interval: Duration,
) -> (mpsc::Receiver<String>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);

    if let Err(e) = clipboard.poll_change() {
        tracing::warn!("clipboard read error: {}", e);
    }

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll_interval).await;

            match clipboard.poll_change() {
                Ok(Some(text)) => {
                    if tx.send(text).await.is_err() {
                        // Receiver dropped, stop monitoring
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("clipboard read error: {}", e);
                }
            }
        }
    });

    (rx, handle)
}
