//! Mock collaborators for testing and the simulator binary
//!
//! Every double records what it was asked to do and can be scripted. None of
//! them touch hardware, the network or real time.

use crate::alarm::{Alarms, FireFn, WakeScheduler, WakeToken};
use crate::clock::Clock;
use crate::collaborators::{
    ActivateResult, ClientId, Connectivity, LocationSink, SubscriberInfo, TaskRunner,
    TimeReference, TimeSource, UsageAccounting, XtraSource,
};
use crate::config::GnssConfig;
use crate::error::{GnssError, GnssResult};
use crate::hal::{
    AgpsServer, AidingData, Bearer, ConnectionKind, GnssCallbacks, GnssDriver, Location,
    NetworkStateReport, PositionMode, Recurrence, ReferenceLocation, SetIdType, SvStatus,
};
use crate::provider::{Env, Services};
use crate::worker::{self, Handler, Inbox, Poster, WakeLock};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One recorded engine call
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Init,
    Cleanup,
    SetPositionMode(PositionMode, Recurrence, u32),
    Start,
    Stop,
    DeleteAidingData(u16),
    InjectTime(i64, i64, i32),
    InjectLocation(f64, f64, f32),
    /// Length of the injected blob
    InjectXtra(usize),
    SetAgpsServer(AgpsServer, String, u16),
    RawCommand(Vec<u8>),
    UpdateNetworkState(NetworkStateReport),
    ConnOpen(ConnectionKind, String, Bearer),
    ConnClosed(ConnectionKind),
    ConnFailed(ConnectionKind),
    SetSetId(SetIdType, String),
    SetReferenceLocation(ReferenceLocation),
}

/// Scriptable engine that records every call
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    callbacks: Mutex<Option<Arc<dyn GnssCallbacks>>>,
    fail_init: AtomicBool,
    fail_start: AtomicBool,
    supports_xtra: AtomicBool,
    capabilities_on_init: Mutex<Option<u32>>,
    sv_status: Mutex<SvStatus>,
    nmea: Mutex<Vec<u8>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            callbacks: Mutex::new(None),
            fail_init: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            supports_xtra: AtomicBool::new(false),
            capabilities_on_init: Mutex::new(None),
            sv_status: Mutex::new(SvStatus::default()),
            nmea: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn count<F: Fn(&DriverCall) -> bool>(&self, predicate: F) -> usize {
        lock(&self.calls).iter().filter(|c| predicate(c)).count()
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_supports_xtra(&self, supported: bool) {
        self.supports_xtra.store(supported, Ordering::SeqCst);
    }

    /// Report these capabilities from inside `init`, as real engines do.
    pub fn set_capabilities_on_init(&self, capabilities: u32) {
        *lock(&self.capabilities_on_init) = Some(capabilities);
    }

    pub fn set_sv_status(&self, status: SvStatus) {
        *lock(&self.sv_status) = status;
    }

    pub fn set_nmea(&self, sentence: &str) {
        *lock(&self.nmea) = sentence.as_bytes().to_vec();
    }

    /// Callbacks registered by the last successful `init`
    pub fn callbacks(&self) -> Option<Arc<dyn GnssCallbacks>> {
        lock(&self.callbacks).clone()
    }

    fn record(&self, call: DriverCall) {
        lock(&self.calls).push(call);
    }
}

impl GnssDriver for MockDriver {
    fn init(&self, callbacks: Arc<dyn GnssCallbacks>) -> GnssResult<()> {
        self.record(DriverCall::Init);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(GnssError::EngineInit);
        }
        *lock(&self.callbacks) = Some(Arc::clone(&callbacks));
        if let Some(bits) = *lock(&self.capabilities_on_init) {
            callbacks.report_capabilities(bits);
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.record(DriverCall::Cleanup);
    }

    fn set_position_mode(
        &self,
        mode: PositionMode,
        recurrence: Recurrence,
        min_interval_ms: u32,
        _preferred_accuracy_m: u32,
        _preferred_time_ms: u32,
    ) -> GnssResult<()> {
        self.record(DriverCall::SetPositionMode(mode, recurrence, min_interval_ms));
        Ok(())
    }

    fn start(&self) -> GnssResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(GnssError::EngineCall("start"));
        }
        self.record(DriverCall::Start);
        Ok(())
    }

    fn stop(&self) -> GnssResult<()> {
        self.record(DriverCall::Stop);
        Ok(())
    }

    fn delete_aiding_data(&self, flags: AidingData) {
        self.record(DriverCall::DeleteAidingData(flags.bits()));
    }

    fn inject_time(&self, time_ms: i64, reference_ms: i64, uncertainty_ms: i32) {
        self.record(DriverCall::InjectTime(time_ms, reference_ms, uncertainty_ms));
    }

    fn inject_location(&self, latitude: f64, longitude: f64, accuracy: f32) {
        self.record(DriverCall::InjectLocation(latitude, longitude, accuracy));
    }

    fn supports_xtra(&self) -> bool {
        self.supports_xtra.load(Ordering::SeqCst)
    }

    fn inject_xtra_data(&self, data: &[u8]) {
        self.record(DriverCall::InjectXtra(data.len()));
    }

    fn set_agps_server(&self, server: AgpsServer, host: &str, port: u16) {
        self.record(DriverCall::SetAgpsServer(server, host.to_string(), port));
    }

    fn send_raw_command(&self, bytes: &[u8]) {
        self.record(DriverCall::RawCommand(bytes.to_vec()));
    }

    fn read_sv_status(&self) -> SvStatus {
        lock(&self.sv_status).clone()
    }

    fn read_nmea(&self, buffer: &mut [u8]) -> usize {
        let nmea = lock(&self.nmea);
        let length = nmea.len().min(buffer.len());
        buffer[..length].copy_from_slice(&nmea[..length]);
        length
    }

    fn update_network_state(&self, report: &NetworkStateReport) {
        self.record(DriverCall::UpdateNetworkState(report.clone()));
    }

    fn agps_data_conn_open(&self, kind: ConnectionKind, apn: &str, bearer: Bearer) {
        self.record(DriverCall::ConnOpen(kind, apn.to_string(), bearer));
    }

    fn agps_data_conn_closed(&self, kind: ConnectionKind) {
        self.record(DriverCall::ConnClosed(kind));
    }

    fn agps_data_conn_failed(&self, kind: ConnectionKind) {
        self.record(DriverCall::ConnFailed(kind));
    }

    fn set_set_id(&self, id_type: SetIdType, value: &str) {
        self.record(DriverCall::SetSetId(id_type, value.to_string()));
    }

    fn set_reference_location(&self, location: &ReferenceLocation) {
        self.record(DriverCall::SetReferenceLocation(*location));
    }
}

/// Connectivity manager with a scripted activation result
pub struct MockConnectivity {
    activate_result: Mutex<ActivateResult>,
    activations: AtomicUsize,
    deactivated: Mutex<Vec<ConnectionKind>>,
    bound_routes: Mutex<Vec<(ConnectionKind, IpAddr)>>,
}

impl Default for MockConnectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnectivity {
    pub fn new() -> Self {
        Self {
            activate_result: Mutex::new(ActivateResult::Started),
            activations: AtomicUsize::new(0),
            deactivated: Mutex::new(Vec::new()),
            bound_routes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_activate_result(&self, result: ActivateResult) {
        *lock(&self.activate_result) = result;
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivated(&self) -> Vec<ConnectionKind> {
        lock(&self.deactivated).clone()
    }

    pub fn bound_routes(&self) -> Vec<(ConnectionKind, IpAddr)> {
        lock(&self.bound_routes).clone()
    }
}

impl Connectivity for MockConnectivity {
    fn activate_feature(&self, _kind: ConnectionKind) -> ActivateResult {
        self.activations.fetch_add(1, Ordering::SeqCst);
        *lock(&self.activate_result)
    }

    fn deactivate_feature(&self, kind: ConnectionKind) {
        lock(&self.deactivated).push(kind);
    }

    fn bind_route(&self, kind: ConnectionKind, address: IpAddr) -> bool {
        lock(&self.bound_routes).push((kind, address));
        true
    }
}

/// Time source returning a scripted result
pub struct MockTimeSource {
    result: Mutex<GnssResult<TimeReference>>,
    fetches: AtomicUsize,
    last_server: Mutex<Option<String>>,
}

impl Default for MockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTimeSource {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(Ok(TimeReference {
                time_ms: 1_700_000_000_000,
                reference_ms: 0,
                uncertainty_ms: 50,
            })),
            fetches: AtomicUsize::new(0),
            last_server: Mutex::new(None),
        }
    }

    pub fn set_result(&self, result: GnssResult<TimeReference>) {
        *lock(&self.result) = result;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn last_server(&self) -> Option<String> {
        lock(&self.last_server).clone()
    }
}

impl TimeSource for MockTimeSource {
    fn fetch_time(&self, server: Option<&str>) -> GnssResult<TimeReference> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_server) = server.map(str::to_string);
        lock(&self.result).clone()
    }
}

/// Ephemeris source returning a scripted blob
pub struct MockXtraSource {
    result: Mutex<GnssResult<Vec<u8>>>,
    downloads: AtomicUsize,
    last_servers: Mutex<Vec<String>>,
}

impl Default for MockXtraSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockXtraSource {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(Ok(vec![0xE5, 0x01, 0x02, 0x03])),
            downloads: AtomicUsize::new(0),
            last_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, result: GnssResult<Vec<u8>>) {
        *lock(&self.result) = result;
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn last_servers(&self) -> Vec<String> {
        lock(&self.last_servers).clone()
    }
}

impl XtraSource for MockXtraSource {
    fn download(&self, servers: &[String]) -> GnssResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_servers) = servers.to_vec();
        lock(&self.result).clone()
    }
}

/// Clock that only moves when told to
#[derive(Default)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    /// Wall time reported at elapsed zero
    pub const EPOCH_MS: i64 = 1_700_000_000_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.elapsed) += by;
    }
}

impl Clock for ManualClock {
    fn elapsed_realtime(&self) -> Duration {
        *lock(&self.elapsed)
    }

    fn current_time_millis(&self) -> i64 {
        Self::EPOCH_MS + self.elapsed_realtime().as_millis() as i64
    }
}

/// Scheduler that records deadlines and fires only on demand
#[derive(Default)]
pub struct MockScheduler {
    scheduled: Mutex<HashMap<WakeToken, (Duration, FireFn)>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self, token: WakeToken) -> bool {
        lock(&self.scheduled).contains_key(&token)
    }

    pub fn deadline(&self, token: WakeToken) -> Option<Duration> {
        lock(&self.scheduled).get(&token).map(|(deadline, _)| *deadline)
    }

    /// Fire `token` now regardless of its deadline. Returns false if not scheduled.
    pub fn fire(&self, token: WakeToken) -> bool {
        let entry = lock(&self.scheduled).remove(&token);
        match entry {
            Some((_, on_fire)) => {
                on_fire();
                true
            }
            None => false,
        }
    }
}

impl WakeScheduler for MockScheduler {
    fn schedule(&self, token: WakeToken, deadline: Duration, on_fire: FireFn) {
        lock(&self.scheduled).insert(token, (deadline, on_fire));
    }

    fn cancel(&self, token: WakeToken) {
        lock(&self.scheduled).remove(&token);
    }
}

/// Task runner that queues work until `run_all`
#[derive(Default)]
pub struct ManualRunner {
    tasks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ManualRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Run every queued task on the calling thread; returns how many ran.
    pub fn run_all(&self) -> usize {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl TaskRunner for ManualRunner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        lock(&self.tasks).push(task);
    }
}

/// Location sink keeping every reported fix
#[derive(Default)]
pub struct RecordingSink {
    locations: Mutex<Vec<Location>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locations(&self) -> Vec<Location> {
        lock(&self.locations).clone()
    }
}

impl LocationSink for RecordingSink {
    fn report_location(&self, location: &Location) {
        lock(&self.locations).push(location.clone());
    }
}

/// Accounting that records successful notes and can fail per client
#[derive(Default)]
pub struct RecordingAccounting {
    on: Mutex<Vec<ClientId>>,
    off: Mutex<Vec<ClientId>>,
    failing: Mutex<HashSet<ClientId>>,
}

impl RecordingAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, client: ClientId) {
        lock(&self.failing).insert(client);
    }

    pub fn on_events(&self) -> Vec<ClientId> {
        lock(&self.on).clone()
    }

    pub fn off_events(&self) -> Vec<ClientId> {
        lock(&self.off).clone()
    }

    fn check(&self, client: ClientId) -> GnssResult<()> {
        if lock(&self.failing).contains(&client) {
            return Err(GnssError::Internal(format!("accounting rejected {:?}", client)));
        }
        Ok(())
    }
}

impl UsageAccounting for RecordingAccounting {
    fn note_engine_on(&self, client: ClientId) -> GnssResult<()> {
        self.check(client)?;
        lock(&self.on).push(client);
        Ok(())
    }

    fn note_engine_off(&self, client: ClientId) -> GnssResult<()> {
        self.check(client)?;
        lock(&self.off).push(client);
        Ok(())
    }
}

/// SIM and cell information, all absent until set
#[derive(Default)]
pub struct MockSubscriber {
    imsi: Mutex<Option<String>>,
    msisdn: Mutex<Option<String>>,
    reference_location: Mutex<Option<ReferenceLocation>>,
}

impl MockSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_imsi(&self, imsi: Option<&str>) {
        *lock(&self.imsi) = imsi.map(str::to_string);
    }

    pub fn set_msisdn(&self, msisdn: Option<&str>) {
        *lock(&self.msisdn) = msisdn.map(str::to_string);
    }

    pub fn set_reference_location(&self, location: Option<ReferenceLocation>) {
        *lock(&self.reference_location) = location;
    }
}

impl SubscriberInfo for MockSubscriber {
    fn imsi(&self) -> Option<String> {
        lock(&self.imsi).clone()
    }

    fn msisdn(&self) -> Option<String> {
        lock(&self.msisdn).clone()
    }

    fn reference_location(&self) -> Option<ReferenceLocation> {
        *lock(&self.reference_location)
    }
}

/// Wake lock counting acquire/release pairs
#[derive(Default)]
pub struct MockWakeLock {
    held: AtomicBool,
    acquired: AtomicU32,
    released: AtomicU32,
}

impl MockWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }
}

impl WakeLock for MockWakeLock {
    fn acquire(&self) {
        self.held.store(true, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every mock wired together, plus a worker queue the caller drains by hand
pub struct TestBed {
    pub driver: Arc<MockDriver>,
    pub connectivity: Arc<MockConnectivity>,
    pub time_source: Arc<MockTimeSource>,
    pub xtra_source: Arc<MockXtraSource>,
    pub sink: Arc<RecordingSink>,
    pub accounting: Arc<RecordingAccounting>,
    pub subscriber: Arc<MockSubscriber>,
    pub scheduler: Arc<MockScheduler>,
    pub clock: Arc<ManualClock>,
    pub runner: Arc<ManualRunner>,
    pub wake_lock: Arc<MockWakeLock>,
    pub config: GnssConfig,
    pub poster: Poster,
    pub inbox: Inbox,
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBed {
    pub fn new() -> Self {
        let wake_lock = Arc::new(MockWakeLock::new());
        let (poster, inbox) = worker::channel(wake_lock.clone());
        Self {
            driver: Arc::new(MockDriver::new()),
            connectivity: Arc::new(MockConnectivity::new()),
            time_source: Arc::new(MockTimeSource::new()),
            xtra_source: Arc::new(MockXtraSource::new()),
            sink: Arc::new(RecordingSink::new()),
            accounting: Arc::new(RecordingAccounting::new()),
            subscriber: Arc::new(MockSubscriber::new()),
            scheduler: Arc::new(MockScheduler::new()),
            clock: Arc::new(ManualClock::new()),
            runner: Arc::new(ManualRunner::new()),
            wake_lock,
            config: GnssConfig::default(),
            poster,
            inbox,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            driver: self.driver.clone(),
            connectivity: self.connectivity.clone(),
            time_source: self.time_source.clone(),
            xtra_source: self.xtra_source.clone(),
            location_sink: self.sink.clone(),
            accounting: self.accounting.clone(),
            subscriber: self.subscriber.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            runner: self.runner.clone(),
            wake_lock: self.wake_lock.clone(),
        }
    }

    /// Environment posting into this bed's queue
    pub fn env(&self) -> Env {
        Env::new(self.services(), self.config.clone(), self.poster.clone())
    }

    pub fn alarms(&self) -> Alarms {
        Alarms::new(self.scheduler.clone())
    }

    /// Take every current message off the queue without handling it.
    pub fn queued_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some(envelope) = worker::next_current(&self.inbox) {
            names.push(envelope.message.name());
            self.inbox.finish(envelope.ticket());
        }
        names
    }

    /// Handle everything queued so far with `handler`.
    pub fn run<H: Handler>(&self, handler: &mut H) -> bool {
        worker::run_pending(&self.inbox, handler)
    }
}
