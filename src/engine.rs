//! Engine state machine
//!
//! ```text
//! Disabled --enable--> Enabled(Idle) --start--> Enabled(Navigating)
//!                          ^                         |   \--fix, no scheduling--> Hibernating
//!                          \---------stop------------/          |
//!                                                               \--wakeup alarm--> Navigating
//! ```
//!
//! Engines with native scheduling run continuously at the requested interval.
//! Engines without it are started at 1 Hz; after each fix they hibernate until
//! the next interval when that interval exceeds [`HIBERNATE_THRESHOLD`], and a
//! [`NO_FIX_TIMEOUT`] alarm gives up on a start that never produces a fix.

use crate::alarm::{Alarms, WakeToken};
use crate::collaborators::ClientId;
use crate::error::{GnssError, GnssResult};
use crate::hal::{
    location_flags, AgpsServer, Capabilities, EngineStatus, Location, PositionMode, RawFix,
    Recurrence,
};
use crate::listeners::{ListenerRegistry, StatusEvent};
use crate::provider::Env;
use crate::usage::{self, ClientUsageTable};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Give up on a start without a fix after this long
pub const NO_FIX_TIMEOUT: Duration = Duration::from_secs(60);
/// An AVAILABLE status without a fix for this long is demoted
pub const RECENT_FIX_TIMEOUT: Duration = Duration::from_secs(10);
/// Unscheduled engines hibernate between fixes above this interval
pub const HIBERNATE_THRESHOLD: Duration = Duration::from_millis(1000);
/// Recurrence used for engines that cannot schedule fixes
pub const UNSCHEDULED_INTERVAL_MS: u32 = 1000;

const NMEA_BUFFER_LEN: usize = 120;

/// Provider availability as seen by location clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    OutOfService,
    TemporarilyUnavailable,
    Available,
}

/// Engine session, owned by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSession {
    pub enabled: bool,
    pub started: bool,
    pub single_shot: bool,
    pub position_mode: PositionMode,
    pub fix_interval_ms: u32,
    pub capabilities: Capabilities,
    pub supports_xtra: bool,
    /// Monotonic time of the last fix
    pub last_fix_at: Option<Duration>,
    pub ttff_ms: Option<u64>,
    pub fix_requested_at: Option<Duration>,
    pub navigating: bool,
    pub engine_on: bool,
    pub status: ProviderStatus,
    pub sv_count: u32,
}

impl EngineSession {
    pub fn new(fix_interval_ms: u32) -> Self {
        Self {
            enabled: false,
            started: false,
            single_shot: false,
            position_mode: PositionMode::Standalone,
            fix_interval_ms,
            capabilities: Capabilities::default(),
            supports_xtra: false,
            last_fix_at: None,
            ttff_ms: None,
            fix_requested_at: None,
            navigating: false,
            engine_on: false,
            status: ProviderStatus::TemporarilyUnavailable,
            sv_count: 0,
        }
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities.has(capability)
    }

    fn fix_interval(&self) -> Duration {
        Duration::from_millis(self.fix_interval_ms as u64)
    }
}

/// Engine state machine plus the observers it reports to
pub struct EngineStateMachine {
    session: EngineSession,
    tracking_requested: bool,
    listeners: ListenerRegistry,
    clients: Mutex<ClientUsageTable>,
}

impl EngineStateMachine {
    pub fn new(fix_interval_ms: u32) -> Self {
        Self {
            session: EngineSession::new(fix_interval_ms),
            tracking_requested: false,
            listeners: ListenerRegistry::new(),
            clients: Mutex::new(ClientUsageTable::new()),
        }
    }

    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerRegistry {
        &mut self.listeners
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn tracking_requested(&self) -> bool {
        self.tracking_requested
    }

    /// Initialise the engine. Returns `Ok(false)` when already enabled.
    pub fn enable(&mut self, env: &Env, alarms: &mut Alarms) -> GnssResult<bool> {
        if self.session.enabled {
            return Ok(false);
        }

        let driver = &env.services.driver;
        if let Err(e) = driver.init(env.callbacks.clone()) {
            log::error!("Failed to enable location provider: {}", e);
            return Err(GnssError::EngineInit);
        }

        self.session.enabled = true;
        self.session.supports_xtra = driver.supports_xtra();

        if let Some(supl) = &env.config.supl_server {
            driver.set_agps_server(AgpsServer::Supl, &supl.host, supl.port);
        }
        if let Some(c2k) = &env.config.c2k_server {
            driver.set_agps_server(AgpsServer::C2k, &c2k.host, c2k.port);
        }
        log::info!("Location provider enabled (xtra={})", self.session.supports_xtra);

        if self.tracking_requested {
            self.session.ttff_ms = None;
            self.session.last_fix_at = None;
            // Failure is logged inside; the request stands until changed.
            let _ = self.start_navigating(false, env, alarms);
        }
        Ok(true)
    }

    pub fn disable(&mut self, env: &Env, alarms: &mut Alarms) {
        if !self.session.enabled {
            return;
        }

        self.stop_navigating(env, alarms);
        env.services.driver.cleanup();

        let mut session = EngineSession::new(self.session.fix_interval_ms);
        session.capabilities = self.session.capabilities;
        self.session = session;
        log::info!("Location provider disabled");
    }

    /// Apply a fix request from the location manager.
    pub fn set_request(&mut self, report_location: bool, interval: Duration, env: &Env, alarms: &mut Alarms) {
        self.tracking_requested = report_location;
        self.session.fix_interval_ms = interval.as_millis().min(u32::MAX as u128) as u32;

        if !report_location {
            self.stop_navigating(env, alarms);
            return;
        }
        if !self.session.enabled {
            log::debug!("Fix request recorded; provider not enabled yet");
            return;
        }

        if self.session.started {
            if self.session.single_shot {
                log::debug!("Fix request recorded; resumes after the single-shot fix");
            } else if self.session.has_capability(Capabilities::SCHEDULING) {
                // Pick up the new interval without restarting
                if let Err(e) = env.services.driver.set_position_mode(
                    self.session.position_mode,
                    Recurrence::Periodic,
                    self.session.fix_interval_ms,
                    0,
                    0,
                ) {
                    log::error!("set_position_mode failed in set_request: {}", e);
                }
            }
        } else {
            self.session.ttff_ms = None;
            self.session.last_fix_at = None;
            let _ = self.start_navigating(false, env, alarms);
        }
    }

    pub fn request_single_shot(&mut self, env: &Env, alarms: &mut Alarms) -> GnssResult<()> {
        if self.session.started {
            log::warn!("Single-shot fix rejected, navigation already started");
            return Err(GnssError::AlreadyNavigating);
        }
        self.session.ttff_ms = None;
        self.session.last_fix_at = None;
        self.start_navigating(true, env, alarms)
    }

    /// Start a navigation session. No-op when already started.
    pub fn start_navigating(&mut self, single_shot: bool, env: &Env, alarms: &mut Alarms) -> GnssResult<()> {
        if self.session.started {
            return Ok(());
        }
        if !self.session.enabled {
            log::warn!("start_navigating while disabled");
            return Err(GnssError::NotEnabled);
        }

        let mode = self.choose_position_mode(single_shot, env.config.assisted_gps_enabled);
        let scheduling = self.session.has_capability(Capabilities::SCHEDULING);
        let interval = if scheduling {
            self.session.fix_interval_ms
        } else {
            UNSCHEDULED_INTERVAL_MS
        };
        let recurrence = if single_shot && self.session.has_capability(Capabilities::SINGLE_SHOT) {
            Recurrence::Single
        } else {
            Recurrence::Periodic
        };

        let driver = &env.services.driver;
        if let Err(e) = driver.set_position_mode(mode, recurrence, interval, 0, 0) {
            log::error!("set_position_mode failed in start_navigating: {}", e);
            return Err(GnssError::EngineCall("set_position_mode"));
        }
        if let Err(e) = driver.start() {
            log::error!("Engine start failed: {}", e);
            return Err(GnssError::EngineCall("start"));
        }

        self.session.started = true;
        self.session.single_shot = single_shot;
        self.session.position_mode = mode;
        self.session.fix_requested_at = Some(env.now());
        self.update_status(ProviderStatus::TemporarilyUnavailable, 0);
        log::info!(
            "Navigation started (mode={:?}, interval={}ms, single_shot={})",
            mode,
            interval,
            single_shot
        );

        if !scheduling {
            env.arm(alarms, WakeToken::NoFixTimeout, NO_FIX_TIMEOUT);
        }
        Ok(())
    }

    fn choose_position_mode(&self, single_shot: bool, assisted_allowed: bool) -> PositionMode {
        if !assisted_allowed {
            return PositionMode::Standalone;
        }
        if single_shot && self.session.has_capability(Capabilities::MSA) {
            PositionMode::MsAssisted
        } else if self.session.has_capability(Capabilities::MSB) {
            PositionMode::MsBased
        } else {
            PositionMode::Standalone
        }
    }

    /// Stop navigation and cancel both alarms. Idempotent.
    pub fn stop_navigating(&mut self, env: &Env, alarms: &mut Alarms) {
        alarms.cancel(WakeToken::NoFixTimeout);
        alarms.cancel(WakeToken::HibernateWakeup);

        if !self.session.started {
            return;
        }

        self.session.started = false;
        self.session.single_shot = false;
        if let Err(e) = env.services.driver.stop() {
            log::error!("Engine stop failed: {}", e);
        }
        self.session.ttff_ms = None;
        self.session.last_fix_at = None;
        self.update_status(ProviderStatus::TemporarilyUnavailable, 0);
        log::debug!("Navigation stopped");
    }

    /// Stop until the next fix interval, then restart.
    pub fn hibernate(&mut self, env: &Env, alarms: &mut Alarms) {
        self.stop_navigating(env, alarms);
        env.arm(alarms, WakeToken::HibernateWakeup, self.session.fix_interval());
        log::debug!("Hibernating for {}ms", self.session.fix_interval_ms);
    }

    /// Pick the periodic request back up once a single-shot session is over.
    fn resume_tracking(&mut self, env: &Env, alarms: &mut Alarms) {
        if !self.session.enabled || !self.tracking_requested {
            return;
        }
        if !self.session.has_capability(Capabilities::SCHEDULING)
            && self.session.fix_interval() > HIBERNATE_THRESHOLD
        {
            env.arm(alarms, WakeToken::HibernateWakeup, self.session.fix_interval());
            log::debug!("Periodic tracking resumes in {}ms", self.session.fix_interval_ms);
        } else if let Err(e) = self.start_navigating(false, env, alarms) {
            log::warn!("Could not resume periodic tracking: {}", e);
        }
    }

    /// A navigation alarm fired.
    pub fn on_alarm(&mut self, token: WakeToken, env: &Env, alarms: &mut Alarms) {
        match token {
            WakeToken::NoFixTimeout => {
                if !self.session.started {
                    return;
                }
                log::info!("No fix within {:?}", NO_FIX_TIMEOUT);
                if self.session.single_shot {
                    self.stop_navigating(env, alarms);
                    self.resume_tracking(env, alarms);
                } else {
                    self.hibernate(env, alarms);
                }
            }
            WakeToken::HibernateWakeup => {
                if self.session.enabled && self.tracking_requested {
                    let _ = self.start_navigating(false, env, alarms);
                }
            }
            WakeToken::TimeInjection | WakeToken::XtraDownload => {}
        }
    }

    pub fn on_location(&mut self, fix: RawFix, env: &Env, alarms: &mut Alarms) {
        let location = Location::from_fix(&fix);
        env.services.location_sink.report_location(&location);

        let now = env.now();
        self.session.last_fix_at = Some(now);

        if self.session.ttff_ms.is_none() && fix.has(location_flags::HAS_LAT_LONG) {
            let requested = self.session.fix_requested_at.unwrap_or(now);
            let ttff_ms = now.saturating_sub(requested).as_millis() as u64;
            self.session.ttff_ms = Some(ttff_ms);
            log::info!("TTFF: {}ms", ttff_ms);
            self.listeners.dispatch(&StatusEvent::FirstFix { ttff_ms });
        }

        if self.session.single_shot {
            self.stop_navigating(env, alarms);
            self.resume_tracking(env, alarms);
            return;
        }

        if self.session.started && self.session.status != ProviderStatus::Available {
            alarms.cancel(WakeToken::NoFixTimeout);
            self.update_status(ProviderStatus::Available, self.session.sv_count);
        }

        if self.session.started
            && !self.session.has_capability(Capabilities::SCHEDULING)
            && self.session.fix_interval() > HIBERNATE_THRESHOLD
        {
            self.hibernate(env, alarms);
        }
    }

    pub fn on_status(&mut self, status: EngineStatus, env: &Env) {
        let was_navigating = self.session.navigating;
        match status {
            EngineStatus::SessionBegin => {
                self.session.navigating = true;
                self.session.engine_on = true;
            }
            EngineStatus::SessionEnd => self.session.navigating = false,
            EngineStatus::EngineOn => self.session.engine_on = true,
            EngineStatus::EngineOff => {
                self.session.engine_on = false;
                self.session.navigating = false;
            }
            EngineStatus::None => {}
        }

        if was_navigating == self.session.navigating {
            return;
        }

        let navigating = self.session.navigating;
        let event = if navigating {
            StatusEvent::Started
        } else {
            StatusEvent::Stopped
        };
        self.listeners.dispatch(&event);

        if let Ok(clients) = self.clients.lock() {
            clients.note_all(&*env.services.accounting, navigating);
        }
    }

    pub fn on_sv_status(&mut self, env: &Env) {
        let status = env.services.driver.read_sv_status();
        let used = status.used_in_fix_count();
        self.listeners.dispatch(&StatusEvent::SvStatus(status));
        self.update_status(self.session.status, used);

        let stale = self
            .session
            .last_fix_at
            .map(|at| env.now().saturating_sub(at) > RECENT_FIX_TIMEOUT)
            .unwrap_or(false);
        if self.session.navigating && self.session.status == ProviderStatus::Available && stale {
            log::debug!("No recent fix, status temporarily unavailable");
            self.update_status(ProviderStatus::TemporarilyUnavailable, self.session.sv_count);
        }
    }

    pub fn on_nmea(&mut self, timestamp_ms: i64, env: &Env) {
        let mut buffer = [0u8; NMEA_BUFFER_LEN];
        let length = env.services.driver.read_nmea(&mut buffer).min(NMEA_BUFFER_LEN);
        let sentence = String::from_utf8_lossy(&buffer[..length]).into_owned();
        self.listeners.dispatch(&StatusEvent::Nmea {
            timestamp_ms,
            sentence,
        });
    }

    pub fn on_capabilities(&mut self, capabilities: Capabilities) {
        log::info!("Engine capabilities: {:#x}", capabilities.bits());
        self.session.capabilities = capabilities;
    }

    pub fn add_client(&mut self, client: ClientId, env: &Env) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        if clients.add(client) && self.session.navigating {
            usage::note(&*env.services.accounting, client, true);
        }
    }

    pub fn remove_client(&mut self, client: ClientId, env: &Env) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        if clients.remove(client) && self.session.navigating {
            usage::note(&*env.services.accounting, client, false);
        }
    }

    fn update_status(&mut self, status: ProviderStatus, sv_count: u32) {
        if status != self.session.status || sv_count != self.session.sv_count {
            log::trace!("Status {:?} -> {:?} ({} SVs)", self.session.status, status, sv_count);
            self.session.status = status;
            self.session.sv_count = sv_count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ClientId;
    use crate::hal::{SvInfo, SvStatus};
    use crate::listeners::{ChannelObserver, StatusObserver};
    use crate::mock::{DriverCall, TestBed};
    use std::sync::Arc;

    fn fix() -> RawFix {
        RawFix {
            flags: location_flags::HAS_LAT_LONG | location_flags::HAS_ACCURACY,
            latitude: 51.5,
            longitude: -0.12,
            accuracy: 12.0,
            timestamp_ms: 1_700_000_000_000,
            ..RawFix::default()
        }
    }

    fn enabled(bed: &TestBed, caps: u32, interval_ms: u32) -> (EngineStateMachine, Alarms) {
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut engine = EngineStateMachine::new(interval_ms);
        engine.on_capabilities(Capabilities::from_bits(caps));
        engine.enable(&env, &mut alarms).unwrap();
        bed.driver.clear_calls();
        (engine, alarms)
    }

    #[test]
    fn test_enable_twice_inits_once() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut engine = EngineStateMachine::new(1000);

        assert_eq!(engine.enable(&env, &mut alarms), Ok(true));
        assert_eq!(engine.enable(&env, &mut alarms), Ok(false));
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Init)), 1);
    }

    #[test]
    fn test_enable_failure_stays_disabled() {
        let bed = TestBed::new();
        bed.driver.fail_init(true);
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut engine = EngineStateMachine::new(1000);

        assert_eq!(engine.enable(&env, &mut alarms), Err(GnssError::EngineInit));
        assert!(!engine.session().enabled);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::SetAgpsServer(..))), 0);
    }

    #[test]
    fn test_enable_pushes_configured_servers() {
        let mut bed = TestBed::new();
        bed.config = crate::config::GnssConfig::parse("SUPL_HOST=supl.example.com\nSUPL_PORT=7275\n").unwrap();
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut engine = EngineStateMachine::new(1000);

        engine.enable(&env, &mut alarms).unwrap();
        assert!(bed.driver.calls().contains(&DriverCall::SetAgpsServer(
            AgpsServer::Supl,
            "supl.example.com".to_string(),
            7275
        )));
    }

    #[test]
    fn test_start_twice_starts_once() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();

        engine.start_navigating(false, &env, &mut alarms).unwrap();
        engine.start_navigating(false, &env, &mut alarms).unwrap();
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Start)), 1);
        assert!(engine.session().started);
    }

    #[test]
    fn test_start_failure_leaves_stopped() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        bed.driver.fail_start(true);
        let env = bed.env();

        assert_eq!(
            engine.start_navigating(false, &env, &mut alarms),
            Err(GnssError::EngineCall("start"))
        );
        assert!(!engine.session().started);
    }

    #[test]
    fn test_position_mode_selection() {
        let bed = TestBed::new();
        let caps = Capabilities::SCHEDULING | Capabilities::MSA | Capabilities::MSB;
        let (mut engine, mut alarms) = enabled(&bed, caps, 1000);
        let env = bed.env();

        engine.request_single_shot(&env, &mut alarms).unwrap();
        assert_eq!(engine.session().position_mode, PositionMode::MsAssisted);
        engine.stop_navigating(&env, &mut alarms);

        engine.start_navigating(false, &env, &mut alarms).unwrap();
        assert_eq!(engine.session().position_mode, PositionMode::MsBased);
    }

    #[test]
    fn test_assisted_disabled_forces_standalone() {
        let mut bed = TestBed::new();
        bed.config.assisted_gps_enabled = false;
        let caps = Capabilities::SCHEDULING | Capabilities::MSA | Capabilities::MSB;
        let (mut engine, mut alarms) = enabled(&bed, caps, 1000);
        let env = bed.env();

        engine.request_single_shot(&env, &mut alarms).unwrap();
        assert_eq!(engine.session().position_mode, PositionMode::Standalone);
    }

    #[test]
    fn test_single_shot_rejected_while_started() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        engine.start_navigating(false, &env, &mut alarms).unwrap();
        bed.driver.clear_calls();

        assert_eq!(
            engine.request_single_shot(&env, &mut alarms),
            Err(GnssError::AlreadyNavigating)
        );
        assert!(bed.driver.calls().is_empty());
        assert!(!engine.session().single_shot);
    }

    #[test]
    fn test_single_shot_stops_after_fix() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();

        engine.request_single_shot(&env, &mut alarms).unwrap();
        engine.on_location(fix(), &env, &mut alarms);

        assert!(!engine.session().started);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Stop)), 1);
        assert_eq!(bed.sink.locations().len(), 1);
    }

    #[test]
    fn test_single_shot_resumes_periodic_request() {
        // Scheduled engine: tracking asked for mid single-shot starts right after the fix
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();

        engine.request_single_shot(&env, &mut alarms).unwrap();
        engine.set_request(true, Duration::from_millis(1000), &env, &mut alarms);
        assert!(engine.session().single_shot);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Start)), 1);

        engine.on_location(fix(), &env, &mut alarms);
        assert!(engine.session().started);
        assert!(!engine.session().single_shot);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Start)), 2);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Stop)), 1);

        // Unscheduled engine: a single-shot during hibernation re-arms the wakeup
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, 0, 5000);
        let env = bed.env();

        engine.set_request(true, Duration::from_millis(5000), &env, &mut alarms);
        engine.on_location(fix(), &env, &mut alarms);
        assert!(bed.scheduler.is_scheduled(WakeToken::HibernateWakeup));

        engine.request_single_shot(&env, &mut alarms).unwrap();
        assert!(engine.session().single_shot);

        bed.clock.advance(Duration::from_secs(3));
        engine.on_location(fix(), &env, &mut alarms);
        assert!(!engine.session().started);
        assert_eq!(
            bed.scheduler.deadline(WakeToken::HibernateWakeup),
            Some(Duration::from_secs(3) + Duration::from_millis(5000))
        );


        // A single-shot that times out hands back to the periodic request as well
        engine.request_single_shot(&env, &mut alarms).unwrap();
        engine.on_alarm(WakeToken::NoFixTimeout, &env, &mut alarms);
        assert!(!engine.session().started);
        assert!(alarms.is_armed(WakeToken::HibernateWakeup));
    }

    #[test]
    fn test_unscheduled_fix_hibernates() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, 0, 5000);
        let env = bed.env();

        bed.clock.advance(Duration::from_secs(30));
        engine.start_navigating(false, &env, &mut alarms).unwrap();
        assert_eq!(
            bed.scheduler.deadline(WakeToken::NoFixTimeout),
            Some(Duration::from_secs(30) + NO_FIX_TIMEOUT)
        );
        assert!(bed.driver.calls().contains(&DriverCall::SetPositionMode(
            PositionMode::Standalone,
            Recurrence::Periodic,
            UNSCHEDULED_INTERVAL_MS
        )));

        bed.clock.advance(Duration::from_secs(2));
        engine.on_location(fix(), &env, &mut alarms);

        assert!(!engine.session().started);
        assert_eq!(bed.driver.calls().last(), Some(&DriverCall::Stop));
        assert_eq!(
            bed.scheduler.deadline(WakeToken::HibernateWakeup),
            Some(Duration::from_secs(32) + Duration::from_millis(5000))
        );
        assert!(!bed.scheduler.is_scheduled(WakeToken::NoFixTimeout));
    }

    #[test]
    fn test_scheduled_engine_never_arms_timeout() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 5000);
        let env = bed.env();

        engine.start_navigating(false, &env, &mut alarms).unwrap();
        engine.on_location(fix(), &env, &mut alarms);

        assert!(engine.session().started);
        assert!(!alarms.is_armed(WakeToken::NoFixTimeout));
        assert!(!alarms.is_armed(WakeToken::HibernateWakeup));
        assert_eq!(engine.session().status, ProviderStatus::Available);
    }

    #[test]
    fn test_no_fix_timeout_hibernates_then_wakes() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, 0, 120_000);
        let env = bed.env();
        engine.set_request(true, Duration::from_secs(120), &env, &mut alarms);
        assert!(engine.session().started);

        engine.on_alarm(WakeToken::NoFixTimeout, &env, &mut alarms);
        assert!(!engine.session().started);
        assert!(alarms.is_armed(WakeToken::HibernateWakeup));

        engine.on_alarm(WakeToken::HibernateWakeup, &env, &mut alarms);
        assert!(engine.session().started);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Start)), 2);
    }

    #[test]
    fn test_set_request_updates_interval_in_place() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();

        engine.set_request(true, Duration::from_secs(1), &env, &mut alarms);
        engine.set_request(true, Duration::from_secs(10), &env, &mut alarms);

        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Start)), 1);
        assert_eq!(
            bed.driver.calls().last(),
            Some(&DriverCall::SetPositionMode(
                PositionMode::Standalone,
                Recurrence::Periodic,
                10_000
            ))
        );

        engine.set_request(false, Duration::from_secs(10), &env, &mut alarms);
        assert!(!engine.session().started);
    }

    #[test]
    fn test_first_fix_dispatched_once_with_ttff() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        let (observer, rx) = ChannelObserver::pair();
        engine.listeners_mut().add(observer as Arc<dyn StatusObserver>, |_| {});

        engine.start_navigating(false, &env, &mut alarms).unwrap();
        bed.clock.advance(Duration::from_millis(4200));
        engine.on_location(fix(), &env, &mut alarms);
        engine.on_location(fix(), &env, &mut alarms);

        assert_eq!(rx.drain(), vec![StatusEvent::FirstFix { ttff_ms: 4200 }]);
        assert_eq!(engine.session().ttff_ms, Some(4200));
    }

    #[test]
    fn test_status_edges_notify_and_account() {
        let bed = TestBed::new();
        let (mut engine, _alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        let (observer, rx) = ChannelObserver::pair();
        engine.listeners_mut().add(observer as Arc<dyn StatusObserver>, |_| {});
        engine.add_client(ClientId(10), &env);
        engine.add_client(ClientId(11), &env);

        engine.on_status(EngineStatus::SessionBegin, &env);
        engine.on_status(EngineStatus::EngineOn, &env);
        engine.on_status(EngineStatus::EngineOff, &env);

        assert_eq!(rx.drain(), vec![StatusEvent::Started, StatusEvent::Stopped]);
        assert_eq!(bed.accounting.on_events(), vec![ClientId(10), ClientId(11)]);
        assert_eq!(bed.accounting.off_events(), vec![ClientId(10), ClientId(11)]);
        assert!(!engine.session().engine_on);
    }

    #[test]
    fn test_client_added_while_navigating_is_accounted() {
        let bed = TestBed::new();
        let (mut engine, _alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();

        engine.on_status(EngineStatus::SessionBegin, &env);
        engine.add_client(ClientId(42), &env);
        engine.add_client(ClientId(42), &env);
        assert_eq!(bed.accounting.on_events(), vec![ClientId(42)]);

        engine.remove_client(ClientId(42), &env);
        assert!(bed.accounting.off_events().is_empty());
        engine.remove_client(ClientId(42), &env);
        assert_eq!(bed.accounting.off_events(), vec![ClientId(42)]);
        assert_eq!(engine.client_count(), 0);
    }

    #[test]
    fn test_sv_status_demotes_stale_available() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        bed.driver.set_sv_status(SvStatus {
            svs: vec![SvInfo {
                prn: 5,
                snr: 38.0,
                elevation: 45.0,
                azimuth: 120.0,
            }],
            used_in_fix_mask: 1 << 4,
            ..SvStatus::default()
        });

        engine.start_navigating(false, &env, &mut alarms).unwrap();
        engine.on_status(EngineStatus::SessionBegin, &env);
        engine.on_location(fix(), &env, &mut alarms);
        engine.on_sv_status(&env);
        assert_eq!(engine.session().status, ProviderStatus::Available);
        assert_eq!(engine.session().sv_count, 1);

        bed.clock.advance(RECENT_FIX_TIMEOUT + Duration::from_secs(1));
        engine.on_sv_status(&env);
        assert_eq!(engine.session().status, ProviderStatus::TemporarilyUnavailable);
    }

    #[test]
    fn test_nmea_dispatch() {
        let bed = TestBed::new();
        let (mut engine, _alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        let (observer, rx) = ChannelObserver::pair();
        engine.listeners_mut().add(observer as Arc<dyn StatusObserver>, |_| {});
        bed.driver.set_nmea("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47");

        engine.on_nmea(1_234, &env);
        match rx.try_recv() {
            Some(StatusEvent::Nmea {
                timestamp_ms,
                sentence,
            }) => {
                assert_eq!(timestamp_ms, 1_234);
                assert!(sentence.starts_with("$GPGGA"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_disable_stops_then_cleans_up() {
        let bed = TestBed::new();
        let (mut engine, mut alarms) = enabled(&bed, Capabilities::SCHEDULING, 1000);
        let env = bed.env();
        engine.start_navigating(false, &env, &mut alarms).unwrap();
        bed.driver.clear_calls();

        engine.disable(&env, &mut alarms);
        assert_eq!(bed.driver.calls(), vec![DriverCall::Stop, DriverCall::Cleanup]);
        assert!(!engine.session().enabled);
        assert!(!engine.session().started);

        engine.disable(&env, &mut alarms);
        assert_eq!(bed.driver.count(|c| matches!(c, DriverCall::Cleanup)), 1);
    }
}
