//! Time injection and ephemeris (XTRA) prefetch
//!
//! Both flows are gated on network availability. A flow started without a
//! network parks in `PendingNetwork` and is resumed once by the next
//! "network available" notification. Fetches run on the task runner and post
//! their result back to the worker; failures re-arm after `RETRY_INTERVAL`.

use crate::alarm::{Alarms, WakeToken};
use crate::collaborators::TimeReference;
use crate::error::GnssResult;
use crate::hal::Capabilities;
use crate::provider::Env;
use crate::worker::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Re-injection period when the engine cannot request time itself
pub const NTP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Backoff after a failed fetch
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    Idle,
    PendingNetwork,
    Downloading,
}

/// State of both data flows
#[derive(Debug)]
pub struct Synchronizer {
    network_available: bool,
    periodic_time_injection: bool,
    supports_xtra: bool,
    time_state: FetchState,
    xtra_state: FetchState,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            network_available: false,
            periodic_time_injection: false,
            supports_xtra: false,
            time_state: FetchState::Idle,
            xtra_state: FetchState::Idle,
        }
    }

    pub fn time_state(&self) -> FetchState {
        self.time_state
    }

    pub fn xtra_state(&self) -> FetchState {
        self.xtra_state
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    pub fn periodic_time_injection(&self) -> bool {
        self.periodic_time_injection
    }

    pub fn supports_xtra(&self) -> bool {
        self.supports_xtra
    }

    pub fn set_supports_xtra(&mut self, supported: bool) {
        self.supports_xtra = supported;
    }

    /// Engines without on-demand time need periodic injection; decided once.
    pub fn on_capabilities(&mut self, capabilities: Capabilities, env: &Env) {
        if !capabilities.has(Capabilities::ON_DEMAND_TIME) && !self.periodic_time_injection {
            log::info!("Engine lacks on-demand time, enabling periodic injection");
            self.periodic_time_injection = true;
            env.post(Message::InjectTime);
        }
    }

    /// Track availability and resume flows parked for lack of network.
    pub fn on_network_state(&mut self, available: bool, env: &Env) {
        self.network_available = available;
        if !available {
            return;
        }

        if self.time_state == FetchState::PendingNetwork {
            log::debug!("Network available, resuming time injection");
            env.post(Message::InjectTime);
        }
        if self.xtra_state == FetchState::PendingNetwork {
            log::debug!("Network available, resuming XTRA download");
            env.post(Message::DownloadXtra);
        }
    }

    pub fn handle_inject_time(&mut self, env: &Env) {
        if self.time_state == FetchState::Downloading {
            return;
        }
        if !self.network_available {
            self.time_state = FetchState::PendingNetwork;
            return;
        }

        self.time_state = FetchState::Downloading;
        let source = Arc::clone(&env.services.time_source);
        let server = env.config.ntp_server.clone();
        let poster = env.poster.clone();
        env.services.runner.spawn(Box::new(move || {
            let result = source.fetch_time(server.as_deref());
            if poster.post(Message::TimeFetched(result)).is_err() {
                log::debug!("Time fetch finished after worker stopped");
            }
        }));
    }

    pub fn on_time_fetched(
        &mut self,
        result: GnssResult<TimeReference>,
        env: &Env,
        alarms: &mut Alarms,
    ) {
        self.time_state = FetchState::Idle;

        match result {
            Ok(time) => {
                log::info!(
                    "Injecting time {} (reference {}, uncertainty {}ms)",
                    time.time_ms,
                    time.reference_ms,
                    time.uncertainty_ms
                );
                env.services
                    .driver
                    .inject_time(time.time_ms, time.reference_ms, time.uncertainty_ms);
                if self.periodic_time_injection {
                    env.arm(alarms, WakeToken::TimeInjection, NTP_INTERVAL);
                }
            }
            Err(e) => {
                log::warn!("Time fetch failed: {}, retrying", e);
                env.arm(alarms, WakeToken::TimeInjection, RETRY_INTERVAL);
            }
        }
    }

    pub fn handle_download_xtra(&mut self, env: &Env) {
        if !self.supports_xtra {
            log::debug!("XTRA download requested but engine has no XTRA support");
            return;
        }
        if self.xtra_state == FetchState::Downloading {
            return;
        }
        if !self.network_available {
            self.xtra_state = FetchState::PendingNetwork;
            return;
        }

        self.xtra_state = FetchState::Downloading;
        let source = Arc::clone(&env.services.xtra_source);
        let servers = env.config.xtra_servers.clone();
        let poster = env.poster.clone();
        env.services.runner.spawn(Box::new(move || {
            let result = source.download(&servers);
            if poster.post(Message::XtraFetched(result)).is_err() {
                log::debug!("XTRA download finished after worker stopped");
            }
        }));
    }

    pub fn on_xtra_fetched(&mut self, result: GnssResult<Vec<u8>>, env: &Env, alarms: &mut Alarms) {
        self.xtra_state = FetchState::Idle;

        match result {
            Ok(data) => {
                log::info!("Injecting {} bytes of XTRA data", data.len());
                env.services.driver.inject_xtra_data(&data);
            }
            Err(e) => {
                log::warn!("XTRA download failed: {}, retrying", e);
                env.arm(alarms, WakeToken::XtraDownload, RETRY_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GnssError;
    use crate::mock::{DriverCall, TestBed};

    #[test]
    fn test_capabilities_without_on_demand_time_schedule_injection() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut sync = Synchronizer::new();

        sync.on_capabilities(Capabilities::from_bits(Capabilities::SCHEDULING), &env);
        assert!(sync.periodic_time_injection());
        assert_eq!(bed.queued_names(), vec!["InjectTime"]);

        // Decided once
        sync.on_capabilities(Capabilities::from_bits(0), &env);
        assert!(bed.queued_names().is_empty());
    }

    #[test]
    fn test_on_demand_time_needs_no_periodic_injection() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut sync = Synchronizer::new();

        sync.on_capabilities(Capabilities::from_bits(Capabilities::ON_DEMAND_TIME), &env);
        assert!(!sync.periodic_time_injection());
        assert!(bed.queued_names().is_empty());
    }

    #[test]
    fn test_xtra_pending_until_network() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut sync = Synchronizer::new();
        sync.set_supports_xtra(true);

        sync.handle_download_xtra(&env);
        assert_eq!(sync.xtra_state(), FetchState::PendingNetwork);
        assert_eq!(bed.runner.pending(), 0);

        sync.on_network_state(true, &env);
        assert_eq!(bed.queued_names(), vec!["DownloadXtra"]);

        sync.handle_download_xtra(&env);
        assert_eq!(sync.xtra_state(), FetchState::Downloading);
        assert_eq!(bed.runner.pending(), 1);

        // Another available notification while downloading starts nothing new
        sync.on_network_state(true, &env);
        sync.handle_download_xtra(&env);
        assert_eq!(bed.runner.pending(), 1);
        assert!(bed.queued_names().is_empty());
    }

    #[test]
    fn test_time_failure_retries_after_interval() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut sync = Synchronizer::new();

        bed.clock.advance(Duration::from_secs(100));
        sync.on_time_fetched(Err(GnssError::Fetch("timeout".to_string())), &env, &mut alarms);

        assert_eq!(sync.time_state(), FetchState::Idle);
        assert_eq!(
            bed.scheduler.deadline(WakeToken::TimeInjection),
            Some(Duration::from_secs(100) + RETRY_INTERVAL)
        );
        assert!(bed.driver.calls().is_empty());
    }

    #[test]
    fn test_time_success_rearms_only_when_periodic() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut sync = Synchronizer::new();
        let time = TimeReference {
            time_ms: 1_700_000_000_000,
            reference_ms: 5_000,
            uncertainty_ms: 40,
        };

        sync.on_time_fetched(Ok(time), &env, &mut alarms);
        assert_eq!(
            bed.driver.calls(),
            vec![DriverCall::InjectTime(1_700_000_000_000, 5_000, 40)]
        );
        assert!(!alarms.is_armed(WakeToken::TimeInjection));

        sync.on_capabilities(Capabilities::from_bits(0), &env);
        sync.on_time_fetched(Ok(time), &env, &mut alarms);
        assert_eq!(
            bed.scheduler.deadline(WakeToken::TimeInjection),
            Some(NTP_INTERVAL)
        );
    }

    #[test]
    fn test_xtra_unsupported_is_ignored() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut sync = Synchronizer::new();
        sync.on_network_state(true, &env);

        sync.handle_download_xtra(&env);
        assert_eq!(sync.xtra_state(), FetchState::Idle);
        assert_eq!(bed.runner.pending(), 0);
    }

    #[test]
    fn test_xtra_fetch_injects_blob() {
        let bed = TestBed::new();
        let env = bed.env();
        let mut alarms = bed.alarms();
        let mut sync = Synchronizer::new();

        sync.on_xtra_fetched(Ok(vec![1, 2, 3]), &env, &mut alarms);
        assert_eq!(bed.driver.calls(), vec![DriverCall::InjectXtra(3)]);
        assert!(!alarms.is_armed(WakeToken::XtraDownload));
    }

    #[test]
    fn test_fetches_use_configured_servers() {
        let mut bed = TestBed::new();
        bed.config.ntp_server = Some("time.example.org".to_string());
        bed.config.xtra_servers = vec![
            "http://xtra1.example.org/xtra.bin".to_string(),
            "http://xtra2.example.org/xtra.bin".to_string(),
        ];
        let env = bed.env();
        let mut sync = Synchronizer::new();
        sync.set_supports_xtra(true);
        sync.on_network_state(true, &env);

        sync.handle_inject_time(&env);
        sync.handle_download_xtra(&env);
        assert_eq!(bed.runner.run_all(), 2);

        assert_eq!(bed.time_source.last_server(), Some("time.example.org".to_string()));
        assert_eq!(bed.xtra_source.last_servers(), bed.config.xtra_servers);
        assert_eq!(bed.queued_names(), vec!["TimeFetched", "XtraFetched"]);
    }
}
