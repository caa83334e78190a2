//! Worker message queue
//!
//! Every mutation goes through [`Poster::post`] and is applied, in order, by a
//! single worker. Supersedable kinds (enable, fix request, network state per
//! network kind, time injection, ephemeris download, location injection)
//! coalesce: posting one invalidates any queued instance of the same kind, and
//! only the newest is handled. Everything else (listener/client changes,
//! engine callbacks, fetch completions, alarms) is queued and handled in full.
//!
//! The wake lock is held while any coalescing bit is set or the queued counter
//! is non-zero; it is acquired on the first pending message and released when
//! the last one finishes.

use crate::alarm::WakeToken;
use crate::collaborators::{ClientId, NetworkKind, NetworkStateEvent, TimeReference};
use crate::error::{GnssError, GnssResult};
use crate::hal::{AidingData, ConnectionKind, EngineStatus, Location, RawFix};
use crate::listeners::{ObserverId, StatusObserver};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prevents the device from sleeping while work is pending
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Wake lock for hosts without power management
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Fix request from the location manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRequest {
    pub report_location: bool,
    pub interval: Duration,
}

/// Report from the engine callback boundary
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Location(RawFix),
    Status(EngineStatus),
    SvStatus,
    Nmea(i64),
    Capabilities(u32),
    RequestConnection(ConnectionKind, Option<IpAddr>),
    ReleaseConnection(ConnectionKind),
    RequestSetId(u32),
    RequestReferenceLocation(u32),
}

pub enum Message {
    Enable(bool),
    SetRequest(FixRequest),
    RequestSingleShot,
    UpdateNetworkState(NetworkStateEvent),
    InjectTime,
    DownloadXtra,
    UpdateLocation(Location),
    AddListener(Arc<dyn StatusObserver>),
    RemoveListener(ObserverId),
    ListenerDied(ObserverId),
    AddClient(ClientId),
    RemoveClient(ClientId),
    Engine(EngineEvent),
    TimeFetched(GnssResult<TimeReference>),
    XtraFetched(GnssResult<Vec<u8>>),
    Alarm { token: WakeToken, generation: u64 },
    DeleteAidingData(AidingData),
    SendRawCommand(Vec<u8>),
    Flush(Sender<()>),
    Shutdown,
}

const COALESCE_SLOTS: usize = 9;

impl Message {
    /// Coalescing slot, or `None` for kinds that are always delivered.
    pub fn coalesce_slot(&self) -> Option<usize> {
        match self {
            Message::Enable(_) => Some(0),
            Message::SetRequest(_) => Some(1),
            Message::RequestSingleShot => Some(2),
            Message::UpdateNetworkState(event) => Some(match event.kind {
                NetworkKind::Assisted => 3,
                NetworkKind::Cellular => 4,
                NetworkKind::Other => 5,
            }),
            Message::InjectTime => Some(6),
            Message::DownloadXtra => Some(7),
            Message::UpdateLocation(_) => Some(8),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Enable(_) => "Enable",
            Message::SetRequest(_) => "SetRequest",
            Message::RequestSingleShot => "RequestSingleShot",
            Message::UpdateNetworkState(_) => "UpdateNetworkState",
            Message::InjectTime => "InjectTime",
            Message::DownloadXtra => "DownloadXtra",
            Message::UpdateLocation(_) => "UpdateLocation",
            Message::AddListener(_) => "AddListener",
            Message::RemoveListener(_) => "RemoveListener",
            Message::ListenerDied(_) => "ListenerDied",
            Message::AddClient(_) => "AddClient",
            Message::RemoveClient(_) => "RemoveClient",
            Message::Engine(_) => "Engine",
            Message::TimeFetched(_) => "TimeFetched",
            Message::XtraFetched(_) => "XtraFetched",
            Message::Alarm { .. } => "Alarm",
            Message::DeleteAidingData(_) => "DeleteAidingData",
            Message::SendRawCommand(_) => "SendRawCommand",
            Message::Flush(_) => "Flush",
            Message::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Enable(on) => write!(f, "Enable({})", on),
            Message::Engine(event) => write!(f, "Engine({:?})", event),
            Message::Alarm { token, generation } => write!(f, "Alarm({:?}#{})", token, generation),
            other => f.write_str(other.name()),
        }
    }
}

/// Which pending-work entry a queued message accounts for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    slot: Option<usize>,
    generation: u64,
}

pub struct Envelope {
    pub message: Message,
    ticket: Ticket,
}

impl Envelope {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

/// Snapshot of pending work, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingSummary {
    pub bits: u32,
    pub queued: u32,
    pub wake_lock_held: bool,
}

impl PendingSummary {
    pub fn is_empty(&self) -> bool {
        self.bits == 0 && self.queued == 0
    }
}

#[derive(Default)]
struct PendingWork {
    bits: u32,
    queued: u32,
    generations: [u64; COALESCE_SLOTS],
    wake_lock_held: bool,
}

struct Shared {
    pending: Mutex<PendingWork>,
    wake_lock: Arc<dyn WakeLock>,
}

/// Sending half of the worker queue
#[derive(Clone)]
pub struct Poster {
    tx: Sender<Envelope>,
    shared: Arc<Shared>,
}

/// Receiving half of the worker queue
pub struct Inbox {
    rx: Receiver<Envelope>,
    shared: Arc<Shared>,
}

/// Create a worker queue guarded by `wake_lock`.
pub fn channel(wake_lock: Arc<dyn WakeLock>) -> (Poster, Inbox) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(Shared {
        pending: Mutex::new(PendingWork::default()),
        wake_lock,
    });
    (
        Poster {
            tx,
            shared: Arc::clone(&shared),
        },
        Inbox { rx, shared },
    )
}

impl Poster {
    pub fn post(&self, message: Message) -> GnssResult<()> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|_| GnssError::Internal("Failed to acquire pending lock".to_string()))?;

        let slot = message.coalesce_slot();
        let generation = match slot {
            Some(slot) => {
                pending.bits |= 1 << slot;
                pending.generations[slot] += 1;
                pending.generations[slot]
            }
            None => {
                pending.queued += 1;
                0
            }
        };

        if !pending.wake_lock_held {
            self.shared.wake_lock.acquire();
            pending.wake_lock_held = true;
        }

        let envelope = Envelope {
            message,
            ticket: Ticket { slot, generation },
        };
        if self.tx.send(envelope).is_err() {
            // Worker gone; undo the accounting so the lock is not leaked.
            match slot {
                Some(slot) => pending.bits &= !(1 << slot),
                None => pending.queued -= 1,
            }
            release_if_idle(&mut pending, &*self.shared.wake_lock);
            return Err(GnssError::WorkerStopped);
        }
        Ok(())
    }

    pub fn pending(&self) -> PendingSummary {
        summary(&self.shared)
    }
}

impl Inbox {
    /// Block until a message is available; `None` once every poster is gone.
    pub fn recv(&self) -> Option<Envelope> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// A coalesced message is current only if nothing of its kind was posted after it.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        let Some(slot) = ticket.slot else {
            return true;
        };
        match self.shared.pending.lock() {
            Ok(pending) => pending.generations[slot] == ticket.generation,
            Err(_) => true,
        }
    }

    /// Mark the message behind `ticket` handled, releasing the wake lock if idle.
    pub fn finish(&self, ticket: Ticket) {
        let Ok(mut pending) = self.shared.pending.lock() else {
            return;
        };
        match ticket.slot {
            // A newer instance posted during handling keeps the bit set.
            Some(slot) if pending.generations[slot] == ticket.generation => {
                pending.bits &= !(1 << slot);
            }
            Some(_) => {}
            None => pending.queued = pending.queued.saturating_sub(1),
        }
        release_if_idle(&mut pending, &*self.shared.wake_lock);
    }

    pub fn pending(&self) -> PendingSummary {
        summary(&self.shared)
    }
}

fn release_if_idle(pending: &mut PendingWork, wake_lock: &dyn WakeLock) {
    if pending.wake_lock_held && pending.bits == 0 && pending.queued == 0 {
        wake_lock.release();
        pending.wake_lock_held = false;
    }
}

fn summary(shared: &Shared) -> PendingSummary {
    match shared.pending.lock() {
        Ok(pending) => PendingSummary {
            bits: pending.bits,
            queued: pending.queued,
            wake_lock_held: pending.wake_lock_held,
        },
        Err(_) => PendingSummary::default(),
    }
}

/// Handles one message at a time on the worker
pub trait Handler {
    /// Returns false to stop the loop.
    fn handle(&mut self, message: Message) -> bool;
}

/// Take the next current message, skipping superseded ones. Non-blocking.
pub fn next_current(inbox: &Inbox) -> Option<Envelope> {
    while let Some(envelope) = inbox.try_recv() {
        if inbox.is_current(envelope.ticket) {
            return Some(envelope);
        }
        log::trace!("Dropping superseded {}", envelope.message.name());
    }
    None
}

/// Handle one envelope and settle its pending-work accounting.
pub fn dispatch<H: Handler>(inbox: &Inbox, handler: &mut H, envelope: Envelope) -> bool {
    let ticket = envelope.ticket;
    let keep_going = handler.handle(envelope.message);
    inbox.finish(ticket);
    keep_going
}

/// Drain everything currently queued without blocking.
pub fn run_pending<H: Handler>(inbox: &Inbox, handler: &mut H) -> bool {
    while let Some(envelope) = next_current(inbox) {
        if !dispatch(inbox, handler, envelope) {
            return false;
        }
    }
    true
}

/// Worker loop: blocks only while the queue is empty.
pub fn run_loop<H: Handler>(inbox: Inbox, mut handler: H) {
    while let Some(envelope) = inbox.recv() {
        if !inbox.is_current(envelope.ticket) {
            log::trace!("Dropping superseded {}", envelope.message.name());
            continue;
        }
        if !dispatch(&inbox, &mut handler, envelope) {
            break;
        }
    }
    // Nothing runs after shutdown; settle the books so the wake lock drops
    while let Some(envelope) = inbox.try_recv() {
        log::trace!("Discarding {} posted after shutdown", envelope.message.name());
        inbox.finish(envelope.ticket);
    }
    log::debug!("GNSS worker exiting");
}
