//! Location provider facade
//!
//! [`GnssLocationProvider`] owns a dedicated worker thread. Public calls only
//! validate their input and post a message; [`ProviderCore`] applies every
//! message on the worker, so the engine, connection and sync state machines
//! are never touched from two threads at once. After each message the worker
//! publishes a [`ProviderSnapshot`] that callers may read from any thread.

use crate::alarm::{Alarms, WakeScheduler, WakeToken};
use crate::clock::Clock;
use crate::collaborators::{
    ClientId, Connectivity, LocationSink, NetworkStateEvent, SubscriberInfo, TaskRunner,
    TimeSource, UsageAccounting, XtraSource,
};
use crate::config::GnssConfig;
use crate::connection::{ConnectionContext, ConnectionManager, ConnectionState};
use crate::engine::{EngineSession, EngineStateMachine};
use crate::error::{GnssError, GnssResult};
use crate::hal::{
    set_id_flags, AidingData, Capabilities, ConnectionKind, EngineStatus, GnssCallbacks,
    GnssDriver, Location, NetworkStateReport, RawFix, SetIdType,
};
use crate::listeners::{ObserverId, StatusObserver};
use crate::sync::{FetchState, Synchronizer};
use crate::worker::{self, EngineEvent, FixRequest, Handler, Message, PendingSummary, Poster, WakeLock};
use crossbeam::channel::bounded;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Every collaborator the provider drives
#[derive(Clone)]
pub struct Services {
    pub driver: Arc<dyn GnssDriver>,
    pub connectivity: Arc<dyn Connectivity>,
    pub time_source: Arc<dyn TimeSource>,
    pub xtra_source: Arc<dyn XtraSource>,
    pub location_sink: Arc<dyn LocationSink>,
    pub accounting: Arc<dyn UsageAccounting>,
    pub subscriber: Arc<dyn SubscriberInfo>,
    pub scheduler: Arc<dyn WakeScheduler>,
    pub clock: Arc<dyn Clock>,
    pub runner: Arc<dyn TaskRunner>,
    pub wake_lock: Arc<dyn WakeLock>,
}

/// What the state machines need while handling a message
#[derive(Clone)]
pub struct Env {
    pub services: Services,
    pub config: GnssConfig,
    pub poster: Poster,
    /// Handed to the engine on init
    pub callbacks: Arc<dyn GnssCallbacks>,
}

impl Env {
    pub fn new(services: Services, config: GnssConfig, poster: Poster) -> Self {
        let callbacks: Arc<dyn GnssCallbacks> = Arc::new(EngineCallbacks::new(poster.clone()));
        Self {
            services,
            config,
            poster,
            callbacks,
        }
    }

    /// Post from the worker; a stopped worker only means shutdown is under way.
    pub fn post(&self, message: Message) {
        let name = message.name();
        if let Err(e) = self.poster.post(message) {
            log::debug!("Dropping {}: {}", name, e);
        }
    }

    pub fn now(&self) -> Duration {
        self.services.clock.elapsed_realtime()
    }

    /// Arm `token` to fire `delay` from now.
    pub fn arm(&self, alarms: &mut Alarms, token: WakeToken, delay: Duration) {
        let deadline = self.now() + delay;
        let poster = self.poster.clone();
        alarms.arm(token, deadline, move |generation| {
            if poster.post(Message::Alarm { token, generation }).is_err() {
                log::debug!("Alarm {:?} fired after worker stopped", token);
            }
        });
    }
}

/// Engine callbacks: each report becomes a worker message, nothing blocks.
pub struct EngineCallbacks {
    poster: Poster,
}

impl EngineCallbacks {
    pub fn new(poster: Poster) -> Self {
        Self { poster }
    }

    fn post(&self, message: Message) {
        if let Err(e) = self.poster.post(message) {
            log::warn!("Engine report dropped: {}", e);
        }
    }

    fn event(&self, event: EngineEvent) {
        self.post(Message::Engine(event));
    }
}

impl GnssCallbacks for EngineCallbacks {
    fn report_location(&self, fix: RawFix) {
        self.event(EngineEvent::Location(fix));
    }

    fn report_status(&self, status: EngineStatus) {
        self.event(EngineEvent::Status(status));
    }

    fn report_sv_status(&self) {
        self.event(EngineEvent::SvStatus);
    }

    fn report_nmea(&self, timestamp_ms: i64) {
        self.event(EngineEvent::Nmea(timestamp_ms));
    }

    fn report_capabilities(&self, capabilities: u32) {
        self.event(EngineEvent::Capabilities(capabilities));
    }

    fn report_xtra_requested(&self) {
        self.post(Message::DownloadXtra);
    }

    fn request_network_connection(&self, kind: ConnectionKind, address: Option<IpAddr>) {
        self.event(EngineEvent::RequestConnection(kind, address));
    }

    fn release_network_connection(&self, kind: ConnectionKind) {
        self.event(EngineEvent::ReleaseConnection(kind));
    }

    fn request_utc_time(&self) {
        self.post(Message::InjectTime);
    }

    fn request_set_id(&self, flags: u32) {
        self.event(EngineEvent::RequestSetId(flags));
    }

    fn request_reference_location(&self, flags: u32) {
        self.event(EngineEvent::RequestReferenceLocation(flags));
    }
}

/// Read-only view of provider state, refreshed after every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub session: EngineSession,
    pub tracking_requested: bool,
    pub network_available: bool,
    pub periodic_time_injection: bool,
    pub time_state: FetchState,
    pub xtra_state: FetchState,
    pub connections: BTreeMap<ConnectionKind, ConnectionState>,
    pub listeners: usize,
    pub clients: usize,
}

impl Default for ProviderSnapshot {
    fn default() -> Self {
        Self {
            session: EngineSession::new(crate::config::DEFAULT_FIX_INTERVAL_MS),
            tracking_requested: false,
            network_available: false,
            periodic_time_injection: false,
            time_state: FetchState::Idle,
            xtra_state: FetchState::Idle,
            connections: ConnectionKind::ALL
                .iter()
                .map(|kind| (*kind, ConnectionState::Closed))
                .collect(),
            listeners: 0,
            clients: 0,
        }
    }
}

/// Extra commands accepted by [`GnssLocationProvider::send_extra_command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraCommand {
    DeleteAidingData(AidingData),
    ForceTimeInjection,
    ForceXtraInjection,
}

impl ExtraCommand {
    /// Parse a command name plus its arguments. `delete_aiding_data` with no
    /// names deletes everything.
    pub fn parse(command: &str, args: &[&str]) -> GnssResult<Self> {
        match command {
            "delete_aiding_data" => {
                if args.is_empty() {
                    return Ok(ExtraCommand::DeleteAidingData(AidingData::from_bits(AidingData::ALL)));
                }
                let mut flags = 0u16;
                for name in args {
                    flags |= AidingData::flag_for(name)
                        .ok_or_else(|| GnssError::UnknownAidingData(name.to_string()))?;
                }
                Ok(ExtraCommand::DeleteAidingData(AidingData::from_bits(flags)))
            }
            "force_time_injection" => Ok(ExtraCommand::ForceTimeInjection),
            "force_xtra_injection" => Ok(ExtraCommand::ForceXtraInjection),
            other => Err(GnssError::InvalidCommand(other.to_string())),
        }
    }
}

/// Worker-side state; every message is applied here.
pub struct ProviderCore {
    env: Env,
    alarms: Alarms,
    engine: EngineStateMachine,
    connections: ConnectionManager,
    sync: Synchronizer,
    snapshot: Arc<RwLock<ProviderSnapshot>>,
}

impl ProviderCore {
    pub fn new(env: Env, snapshot: Arc<RwLock<ProviderSnapshot>>) -> Self {
        let alarms = Alarms::new(Arc::clone(&env.services.scheduler));
        let engine = EngineStateMachine::new(env.config.fix_interval_ms);
        let connections = ConnectionManager::new(&env.config.default_apn);
        Self {
            env,
            alarms,
            engine,
            connections,
            sync: Synchronizer::new(),
            snapshot,
        }
    }

    pub fn engine(&self) -> &EngineStateMachine {
        &self.engine
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn alarms(&self) -> &Alarms {
        &self.alarms
    }

    fn handle_enable(&mut self, enable: bool) {
        if enable {
            match self.engine.enable(&self.env, &mut self.alarms) {
                Ok(true) => {
                    self.sync.set_supports_xtra(self.engine.session().supports_xtra);
                }
                Ok(false) => {}
                Err(e) => log::error!("Enable failed: {}", e),
            }
        } else {
            self.engine.disable(&self.env, &mut self.alarms);
        }
    }

    fn handle_network_state(&mut self, event: NetworkStateEvent) {
        self.sync.on_network_state(event.available, &self.env);

        let ctx = ConnectionContext {
            connectivity: &*self.env.services.connectivity,
            driver: &*self.env.services.driver,
        };
        self.connections.on_network_state(&event, &ctx);

        let kind = event.kind.connection_kind();
        let report = NetworkStateReport {
            connected: event.connected,
            kind,
            roaming: event.roaming,
            available: event.available,
            extra_info: event.apn.clone(),
            default_apn: self.connections.default_apn(kind),
        };
        self.env.services.driver.update_network_state(&report);
    }

    fn handle_update_location(&self, location: Location) {
        match location.accuracy {
            Some(accuracy) => {
                self.env
                    .services
                    .driver
                    .inject_location(location.latitude, location.longitude, accuracy);
            }
            None => log::debug!("Ignoring injected location without accuracy"),
        }
    }

    fn handle_add_listener(&mut self, observer: Arc<dyn StatusObserver>) {
        let poster = self.env.poster.clone();
        self.engine.listeners_mut().add(observer, move |id| {
            if poster.post(Message::ListenerDied(id)).is_err() {
                log::debug!("Listener {:?} died after worker stopped", id);
            }
        });
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Location(fix) => self.engine.on_location(fix, &self.env, &mut self.alarms),
            EngineEvent::Status(status) => self.engine.on_status(status, &self.env),
            EngineEvent::SvStatus => self.engine.on_sv_status(&self.env),
            EngineEvent::Nmea(timestamp_ms) => self.engine.on_nmea(timestamp_ms, &self.env),
            EngineEvent::Capabilities(bits) => {
                let capabilities = Capabilities::from_bits(bits);
                self.engine.on_capabilities(capabilities);
                self.sync.on_capabilities(capabilities, &self.env);
            }
            EngineEvent::RequestConnection(kind, address) => {
                let ctx = ConnectionContext {
                    connectivity: &*self.env.services.connectivity,
                    driver: &*self.env.services.driver,
                };
                self.connections.request_open(kind, address, &ctx);
            }
            EngineEvent::ReleaseConnection(kind) => {
                let ctx = ConnectionContext {
                    connectivity: &*self.env.services.connectivity,
                    driver: &*self.env.services.driver,
                };
                self.connections.request_close(kind, &ctx);
            }
            EngineEvent::RequestSetId(flags) => self.reply_set_id(flags),
            EngineEvent::RequestReferenceLocation(_) => self.reply_reference_location(),
        }
    }

    fn reply_set_id(&self, flags: u32) {
        let subscriber = &self.env.services.subscriber;
        let (id_type, value) = if flags & set_id_flags::IMSI != 0 {
            subscriber.imsi().map(|v| (SetIdType::Imsi, v))
        } else if flags & set_id_flags::MSISDN != 0 {
            subscriber.msisdn().map(|v| (SetIdType::Msisdn, v))
        } else {
            None
        }
        .unwrap_or((SetIdType::None, String::new()));

        log::debug!("Replying set id {:?}", id_type);
        self.env.services.driver.set_set_id(id_type, &value);
    }

    fn reply_reference_location(&self) {
        match self.env.services.subscriber.reference_location() {
            Some(cell) => self.env.services.driver.set_reference_location(&cell),
            None => log::warn!("No serving cell for reference location"),
        }
    }

    fn handle_alarm(&mut self, token: WakeToken, generation: u64) {
        if !self.alarms.take_fired(token, generation) {
            log::trace!("Ignoring stale alarm {:?}#{}", token, generation);
            return;
        }
        match token {
            WakeToken::NoFixTimeout | WakeToken::HibernateWakeup => {
                self.engine.on_alarm(token, &self.env, &mut self.alarms)
            }
            WakeToken::TimeInjection => self.sync.handle_inject_time(&self.env),
            WakeToken::XtraDownload => self.sync.handle_download_xtra(&self.env),
        }
    }

    fn refresh_snapshot(&self) {
        let connections = ConnectionKind::ALL
            .iter()
            .map(|kind| (*kind, self.connections.state(*kind)))
            .collect();
        let snapshot = ProviderSnapshot {
            session: self.engine.session().clone(),
            tracking_requested: self.engine.tracking_requested(),
            network_available: self.sync.network_available(),
            periodic_time_injection: self.sync.periodic_time_injection(),
            time_state: self.sync.time_state(),
            xtra_state: self.sync.xtra_state(),
            connections,
            listeners: self.engine.listeners().len(),
            clients: self.engine.client_count(),
        };
        if let Ok(mut current) = self.snapshot.write() {
            *current = snapshot;
        }
    }
}

impl Handler for ProviderCore {
    fn handle(&mut self, message: Message) -> bool {
        log::trace!("Handling {:?}", message);
        let mut keep_going = true;

        match message {
            Message::Enable(enable) => self.handle_enable(enable),
            Message::SetRequest(request) => self.engine.set_request(
                request.report_location,
                request.interval,
                &self.env,
                &mut self.alarms,
            ),
            Message::RequestSingleShot => {
                if let Err(e) = self.engine.request_single_shot(&self.env, &mut self.alarms) {
                    log::debug!("Single-shot request not started: {}", e);
                }
            }
            Message::UpdateNetworkState(event) => self.handle_network_state(event),
            Message::InjectTime => self.sync.handle_inject_time(&self.env),
            Message::DownloadXtra => self.sync.handle_download_xtra(&self.env),
            Message::UpdateLocation(location) => self.handle_update_location(location),
            Message::AddListener(observer) => self.handle_add_listener(observer),
            Message::RemoveListener(id) => {
                self.engine.listeners_mut().remove(id);
            }
            Message::ListenerDied(id) => {
                self.engine.listeners_mut().handle_death(id);
            }
            Message::AddClient(client) => self.engine.add_client(client, &self.env),
            Message::RemoveClient(client) => self.engine.remove_client(client, &self.env),
            Message::Engine(event) => self.handle_engine_event(event),
            Message::TimeFetched(result) => {
                self.sync.on_time_fetched(result, &self.env, &mut self.alarms)
            }
            Message::XtraFetched(result) => {
                self.sync.on_xtra_fetched(result, &self.env, &mut self.alarms)
            }
            Message::Alarm { token, generation } => self.handle_alarm(token, generation),
            Message::DeleteAidingData(flags) => self.env.services.driver.delete_aiding_data(flags),
            Message::SendRawCommand(bytes) => {
                log::debug!("Raw engine command ({} bytes)", bytes.len());
                self.env.services.driver.send_raw_command(&bytes);
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Shutdown => {
                self.engine.disable(&self.env, &mut self.alarms);
                keep_going = false;
            }
        }

        self.refresh_snapshot();
        keep_going
    }
}

/// Positioning coordinator.
///
/// Built once by whatever composes the service layer and dropped to shut the
/// worker down.
pub struct GnssLocationProvider {
    poster: Poster,
    snapshot: Arc<RwLock<ProviderSnapshot>>,
    worker: Option<JoinHandle<()>>,
}

impl GnssLocationProvider {
    pub fn new(services: Services, config: GnssConfig) -> GnssResult<Self> {
        let (poster, inbox) = worker::channel(Arc::clone(&services.wake_lock));
        let env = Env::new(services, config, poster.clone());
        let snapshot = Arc::new(RwLock::new(ProviderSnapshot::default()));
        let core = ProviderCore::new(env, Arc::clone(&snapshot));

        let (ready_tx, ready_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("gnss-worker".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                worker::run_loop(inbox, core);
            })
            .map_err(|e| GnssError::Internal(format!("Failed to spawn worker: {}", e)))?;

        ready_rx.recv().map_err(|_| GnssError::WorkerStopped)?;
        log::info!("GNSS worker started");

        // Time is injected once at boot; it parks until a network shows up.
        poster.post(Message::InjectTime)?;

        Ok(Self {
            poster,
            snapshot,
            worker: Some(handle),
        })
    }

    pub fn enable(&self) -> GnssResult<()> {
        self.poster.post(Message::Enable(true))
    }

    pub fn disable(&self) -> GnssResult<()> {
        self.poster.post(Message::Enable(false))
    }

    pub fn set_request(&self, request: FixRequest) -> GnssResult<()> {
        if request.report_location && request.interval.is_zero() {
            return Err(GnssError::InvalidParameters("fix interval must be non-zero".to_string()));
        }
        self.poster.post(Message::SetRequest(request))
    }

    /// Request one fix. Rejected without side effects while navigating.
    pub fn request_single_shot(&self) -> GnssResult<()> {
        if self.snapshot().session.started {
            return Err(GnssError::AlreadyNavigating);
        }
        self.poster.post(Message::RequestSingleShot)
    }

    pub fn add_listener(&self, observer: Arc<dyn StatusObserver>) -> GnssResult<()> {
        self.poster.post(Message::AddListener(observer))
    }

    pub fn remove_listener(&self, id: ObserverId) -> GnssResult<()> {
        self.poster.post(Message::RemoveListener(id))
    }

    pub fn add_client(&self, client: ClientId) -> GnssResult<()> {
        self.poster.post(Message::AddClient(client))
    }

    pub fn remove_client(&self, client: ClientId) -> GnssResult<()> {
        self.poster.post(Message::RemoveClient(client))
    }

    pub fn update_network_state(&self, event: NetworkStateEvent) -> GnssResult<()> {
        self.poster.post(Message::UpdateNetworkState(event))
    }

    /// Network-derived location, used as a position hint by the engine.
    pub fn inject_location(&self, location: Location) -> GnssResult<()> {
        self.poster.post(Message::UpdateLocation(location))
    }

    pub fn send_extra_command(&self, command: &str, args: &[&str]) -> GnssResult<()> {
        match ExtraCommand::parse(command, args)? {
            ExtraCommand::DeleteAidingData(flags) => {
                self.poster.post(Message::DeleteAidingData(flags))
            }
            ExtraCommand::ForceTimeInjection => self.poster.post(Message::InjectTime),
            ExtraCommand::ForceXtraInjection => {
                if !self.snapshot().session.supports_xtra {
                    return Err(GnssError::Unsupported("xtra"));
                }
                self.poster.post(Message::DownloadXtra)
            }
        }
    }

    /// Pass a vendor command straight through to the engine.
    pub fn send_raw_command(&self, bytes: &[u8]) -> GnssResult<()> {
        if bytes.is_empty() {
            return Err(GnssError::InvalidParameters("raw command is empty".to_string()));
        }
        self.poster.post(Message::SendRawCommand(bytes.to_vec()))
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> PendingSummary {
        self.poster.pending()
    }

    /// Block until everything posted before this call has been handled or
    /// superseded by a later post of the same kind.
    pub fn flush(&self) -> GnssResult<()> {
        let (tx, rx) = bounded(1);
        self.poster.post(Message::Flush(tx))?;
        rx.recv().map_err(|_| GnssError::WorkerStopped)
    }
}

impl Drop for GnssLocationProvider {
    fn drop(&mut self) {
        let _ = self.poster.post(Message::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("GNSS worker panicked");
            }
        }
    }
}
