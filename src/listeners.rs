//! Status listener registry with liveness tracking
//!
//! Observers are deduplicated by [`ObserverId`]. Each registration links a
//! death recipient to the observer; when the observer's channel closes the
//! recipient fires once, marks the entry dead and asks the worker to drop it.
//! Dispatch skips and removes dead observers inline.

use crate::error::{GnssError, GnssResult};
use crate::hal::SvStatus;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identity of an observer, stable across clones of its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

/// Events fanned out to status listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    FirstFix { ttff_ms: u64 },
    Started,
    Stopped,
    SvStatus(SvStatus),
    Nmea { timestamp_ms: i64, sentence: String },
}

/// Callback fired once when an observer dies
pub struct DeathRecipient(Box<dyn FnOnce() + Send>);

impl DeathRecipient {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        DeathRecipient(Box::new(f))
    }

    pub fn fire(self) {
        (self.0)()
    }
}

/// A remote observer of positioning status
pub trait StatusObserver: Send + Sync {
    fn id(&self) -> ObserverId;

    /// Deliver one event; `Err(ObserverGone)` means the observer is dead.
    fn deliver(&self, event: &StatusEvent) -> GnssResult<()>;

    /// Install a death recipient. Fails if the observer is already dead.
    fn link_to_death(&self, recipient: DeathRecipient) -> GnssResult<()>;

    fn unlink_to_death(&self);
}

struct ListenerEntry {
    observer: Arc<dyn StatusObserver>,
    alive: Arc<AtomicBool>,
}

/// Registry of status observers. Mutated only on the worker.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`; `on_death` runs on whatever thread observes the death.
    ///
    /// Returns false for duplicates and for observers that are already dead.
    pub fn add<F>(&mut self, observer: Arc<dyn StatusObserver>, on_death: F) -> bool
    where
        F: FnOnce(ObserverId) + Send + 'static,
    {
        let id = observer.id();
        if self.contains(id) {
            log::debug!("Duplicate listener {:?} ignored", id);
            return false;
        }

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let recipient = DeathRecipient::new(move || {
            flag.store(false, Ordering::SeqCst);
            on_death(id);
        });

        if observer.link_to_death(recipient).is_err() {
            log::warn!("Listener {:?} died before registration", id);
            return false;
        }

        self.entries.push(ListenerEntry { observer, alive });
        true
    }

    /// Unregister `id`, cancelling its death watch. No-op if absent.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        match self.position(id) {
            Some(index) => {
                let entry = self.entries.remove(index);
                entry.observer.unlink_to_death();
                true
            }
            None => false,
        }
    }

    /// Drop an observer whose death was reported.
    pub fn handle_death(&mut self, id: ObserverId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.entries.remove(index);
                log::info!("Listener {:?} died, removed", id);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to every live observer, removing dead ones as found.
    /// Returns the number of successful deliveries.
    pub fn dispatch(&mut self, event: &StatusEvent) -> usize {
        let mut delivered = 0;
        let mut index = 0;

        while index < self.entries.len() {
            let entry = &self.entries[index];
            let ok = entry.alive.load(Ordering::SeqCst) && entry.observer.deliver(event).is_ok();

            if ok {
                delivered += 1;
                index += 1;
            } else {
                let entry = self.entries.remove(index);
                entry.observer.unlink_to_death();
                log::debug!("Dropped dead listener {:?} during dispatch", entry.observer.id());
            }
        }

        delivered
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, id: ObserverId) -> Option<usize> {
        self.entries.iter().position(|e| e.observer.id() == id)
    }
}

struct DeathLink {
    closed: bool,
    recipient: Option<DeathRecipient>,
}

/// Observer backed by a crossbeam channel.
///
/// Dropping the paired [`StatusReceiver`] is the observer's death: the linked
/// recipient fires exactly once from the dropping thread.
pub struct ChannelObserver {
    tx: Sender<StatusEvent>,
    link: Arc<Mutex<DeathLink>>,
}

impl ChannelObserver {
    pub fn pair() -> (Arc<ChannelObserver>, StatusReceiver) {
        let (tx, rx) = unbounded();
        let link = Arc::new(Mutex::new(DeathLink {
            closed: false,
            recipient: None,
        }));

        let observer = Arc::new(ChannelObserver {
            tx,
            link: Arc::clone(&link),
        });
        (observer, StatusReceiver { rx, link })
    }
}

impl StatusObserver for ChannelObserver {
    fn id(&self) -> ObserverId {
        ObserverId(Arc::as_ptr(&self.link) as usize as u64)
    }

    fn deliver(&self, event: &StatusEvent) -> GnssResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| GnssError::ObserverGone)
    }

    fn link_to_death(&self, recipient: DeathRecipient) -> GnssResult<()> {
        let mut link = self
            .link
            .lock()
            .map_err(|_| GnssError::Internal("Failed to acquire death link lock".to_string()))?;
        if link.closed {
            return Err(GnssError::ObserverGone);
        }
        link.recipient = Some(recipient);
        Ok(())
    }

    fn unlink_to_death(&self) {
        if let Ok(mut link) = self.link.lock() {
            link.recipient = None;
        }
    }
}

/// Receiving end of a [`ChannelObserver`]
pub struct StatusReceiver {
    rx: Receiver<StatusEvent>,
    link: Arc<Mutex<DeathLink>>,
}

impl StatusReceiver {
    pub fn try_recv(&self) -> Option<StatusEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StatusEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued so far
    pub fn drain(&self) -> Vec<StatusEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for StatusReceiver {
    fn drop(&mut self) {
        let recipient = match self.link.lock() {
            Ok(mut link) => {
                link.closed = true;
                link.recipient.take()
            }
            Err(_) => None,
        };
        if let Some(recipient) = recipient {
            recipient.fire();
        }
    }
}
