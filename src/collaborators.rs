//! Platform services the coordinator consumes but does not implement.

use crate::error::GnssResult;
use crate::hal::{ConnectionKind, Location, ReferenceLocation};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Result of asking connectivity to bring up a data path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateResult {
    /// Already up; open can proceed right away
    AlreadyActive,
    /// Accepted; a network-state notification will follow
    Started,
    Rejected,
}

/// Cellular connectivity manager
pub trait Connectivity: Send + Sync {
    fn activate_feature(&self, kind: ConnectionKind) -> ActivateResult;
    fn deactivate_feature(&self, kind: ConnectionKind);
    /// Route traffic for `address` over the data path of `kind`.
    fn bind_route(&self, kind: ConnectionKind, address: IpAddr) -> bool;
}

/// Network type carried by a network-state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkKind {
    Assisted,
    Cellular,
    Other,
}

impl NetworkKind {
    pub fn connection_kind(&self) -> Option<ConnectionKind> {
        match self {
            NetworkKind::Assisted => Some(ConnectionKind::Assisted),
            NetworkKind::Cellular => Some(ConnectionKind::Cellular),
            NetworkKind::Other => None,
        }
    }
}

impl From<ConnectionKind> for NetworkKind {
    fn from(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Assisted => NetworkKind::Assisted,
            ConnectionKind::Cellular => NetworkKind::Cellular,
        }
    }
}

/// Network-state-changed notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStateEvent {
    /// Any network usable for data fetches
    pub available: bool,
    pub connected: bool,
    pub kind: NetworkKind,
    pub roaming: bool,
    pub apn: Option<String>,
    /// Local address of the network, which decides the bearer of a data path
    pub address: Option<IpAddr>,
}

impl NetworkStateEvent {
    pub fn available(kind: NetworkKind) -> Self {
        Self {
            available: true,
            connected: true,
            kind,
            roaming: false,
            apn: None,
            address: None,
        }
    }

    pub fn unavailable(kind: NetworkKind) -> Self {
        Self {
            available: false,
            connected: false,
            ..Self::available(kind)
        }
    }

    pub fn with_apn(mut self, apn: &str) -> Self {
        self.apn = Some(apn.to_string());
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }
}

/// Time reference from the network time source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReference {
    pub time_ms: i64,
    /// Monotonic clock reading (ms) when `time_ms` was valid
    pub reference_ms: i64,
    pub uncertainty_ms: i32,
}

/// Network time source; may block, always called off the worker.
pub trait TimeSource: Send + Sync {
    /// `server` is the configured NTP host; `None` leaves the choice to the source.
    fn fetch_time(&self, server: Option<&str>) -> GnssResult<TimeReference>;
}

/// Bulk ephemeris (XTRA) download; may block, always called off the worker.
pub trait XtraSource: Send + Sync {
    /// Servers are tried in the order given.
    fn download(&self, servers: &[String]) -> GnssResult<Vec<u8>>;
}

/// Platform location manager receiving fixes
pub trait LocationSink: Send + Sync {
    fn report_location(&self, location: &Location);
}

/// Caller identity used for usage accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

/// Engine-on time accounting, best-effort
pub trait UsageAccounting: Send + Sync {
    fn note_engine_on(&self, client: ClientId) -> GnssResult<()>;
    fn note_engine_off(&self, client: ClientId) -> GnssResult<()>;
}

/// SIM and serving-cell lookups for AGPS requests
pub trait SubscriberInfo: Send + Sync {
    fn imsi(&self) -> Option<String>;
    fn msisdn(&self) -> Option<String>;
    fn reference_location(&self) -> Option<ReferenceLocation>;
}

/// Runs blocking work away from the worker thread
pub trait TaskRunner: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>);
}

/// Spawns one OS thread per task
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRunner;

impl TaskRunner for ThreadRunner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        if let Err(e) = std::thread::Builder::new()
            .name("gnss-fetch".to_string())
            .spawn(task)
        {
            log::error!("Failed to spawn fetch thread: {}", e);
        }
    }
}

/// Accounting that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccounting;

impl UsageAccounting for NoAccounting {
    fn note_engine_on(&self, _client: ClientId) -> GnssResult<()> {
        Ok(())
    }

    fn note_engine_off(&self, _client: ClientId) -> GnssResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_kind_mapping() {
        assert_eq!(
            NetworkKind::Assisted.connection_kind(),
            Some(ConnectionKind::Assisted)
        );
        assert_eq!(NetworkKind::Other.connection_kind(), None);
        assert_eq!(NetworkKind::from(ConnectionKind::Cellular), NetworkKind::Cellular);
    }

    #[test]
    fn test_network_event_builders() {
        let event = NetworkStateEvent::available(NetworkKind::Assisted).with_apn("supl.apn");
        assert!(event.available);
        assert_eq!(event.apn.as_deref(), Some("supl.apn"));

        let lost = NetworkStateEvent::unavailable(NetworkKind::Cellular);
        assert!(!lost.available);
        assert!(!lost.connected);
    }
}
