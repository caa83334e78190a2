//! Data-path state machine, one record per connection kind
//!
//! ```text
//! Closed --request_open--> Opening --available--> Open
//!                            |  \--unavailable/rejected--> Closed (engine told: failed)
//!                            \--already active--> Open
//! Opening|Open --request_close--> Closed (engine told: closed)
//! Open --network lost--> Closed (engine told: failed)
//! ```
//!
//! A rejected or lost data path is never retried here; the engine asks again.

use crate::collaborators::{ActivateResult, Connectivity, NetworkStateEvent};
use crate::hal::{Bearer, ConnectionKind, GnssDriver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// State of one data path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub apn: Option<String>,
    pub bearer: Bearer,
    pub bound_address: Option<IpAddr>,
}

impl ConnectionInfo {
    fn closed() -> Self {
        Self {
            state: ConnectionState::Closed,
            apn: None,
            bearer: Bearer::default(),
            bound_address: None,
        }
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Closed;
        self.apn = None;
        self.bound_address = None;
    }
}

/// Collaborators the state machine drives
pub struct ConnectionContext<'a> {
    pub connectivity: &'a dyn Connectivity,
    pub driver: &'a dyn GnssDriver,
}

/// Tracks both connection kinds
pub struct ConnectionManager {
    connections: BTreeMap<ConnectionKind, ConnectionInfo>,
    cached_apns: HashMap<ConnectionKind, String>,
    fallback_apn: String,
}

impl ConnectionManager {
    pub fn new(fallback_apn: &str) -> Self {
        Self {
            connections: BTreeMap::new(),
            cached_apns: HashMap::new(),
            fallback_apn: fallback_apn.to_string(),
        }
    }

    pub fn state(&self, kind: ConnectionKind) -> ConnectionState {
        self.connections
            .get(&kind)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn info(&self, kind: ConnectionKind) -> Option<&ConnectionInfo> {
        self.connections.get(&kind)
    }

    /// Default APN the engine sees in network-state reports
    pub fn default_apn(&self, kind: Option<ConnectionKind>) -> String {
        kind.and_then(|k| self.cached_apns.get(&k))
            .cloned()
            .unwrap_or_else(|| self.fallback_apn.clone())
    }

    /// Engine asked for a data path of `kind`.
    pub fn request_open(
        &mut self,
        kind: ConnectionKind,
        address: Option<IpAddr>,
        ctx: &ConnectionContext<'_>,
    ) {
        let info = self
            .connections
            .entry(kind)
            .or_insert_with(ConnectionInfo::closed);
        if info.state != ConnectionState::Closed {
            log::debug!("{:?} data path already {:?}", kind, info.state);
            return;
        }

        info.state = ConnectionState::Opening;
        info.bound_address = address;
        if let Some(addr) = address {
            info.bearer = bearer_for(addr);
        }

        match ctx.connectivity.activate_feature(kind) {
            ActivateResult::AlreadyActive => {
                log::debug!("{:?} data path already active", kind);
                self.open(kind, None, ctx);
            }
            ActivateResult::Started => {
                log::debug!("{:?} data path requested, waiting for network", kind);
            }
            ActivateResult::Rejected => {
                log::warn!("{:?} data path request rejected", kind);
                self.fail(kind, ctx);
            }
        }
    }

    /// Engine released the data path of `kind`.
    pub fn request_close(&mut self, kind: ConnectionKind, ctx: &ConnectionContext<'_>) {
        let Some(info) = self.connections.get_mut(&kind) else {
            return;
        };
        if info.state == ConnectionState::Closed {
            return;
        }

        ctx.connectivity.deactivate_feature(kind);
        ctx.driver.agps_data_conn_closed(kind);
        info.reset();
        log::debug!("{:?} data path closed", kind);
    }

    /// Apply a network-state notification.
    pub fn on_network_state(&mut self, event: &NetworkStateEvent, ctx: &ConnectionContext<'_>) {
        let Some(kind) = event.kind.connection_kind() else {
            return;
        };

        if let Some(apn) = &event.apn {
            self.cached_apns.insert(kind, apn.clone());
        }

        match self.state(kind) {
            ConnectionState::Opening if event.available => {
                // An address from the engine's request takes precedence
                if let (Some(addr), Some(info)) = (event.address, self.connections.get_mut(&kind)) {
                    if info.bound_address.is_none() {
                        info.bearer = bearer_for(addr);
                    }
                }
                self.open(kind, event.apn.clone(), ctx)
            }
            ConnectionState::Opening | ConnectionState::Open if !event.available => {
                log::warn!("{:?} network lost while {:?}", kind, self.state(kind));
                self.fail(kind, ctx);
            }
            _ => {}
        }
    }

    fn open(&mut self, kind: ConnectionKind, apn: Option<String>, ctx: &ConnectionContext<'_>) {
        let apn = apn.unwrap_or_else(|| self.default_apn(Some(kind)));
        let Some(info) = self.connections.get_mut(&kind) else {
            return;
        };

        if let Some(addr) = info.bound_address {
            if !ctx.connectivity.bind_route(kind, addr) {
                log::warn!("Failed to bind route to {} for {:?}", addr, kind);
            }
        }

        ctx.driver.agps_data_conn_open(kind, &apn, info.bearer);
        info.apn = Some(apn);
        info.state = ConnectionState::Open;
        log::info!("{:?} data path open (apn={:?})", kind, info.apn);
    }

    fn fail(&mut self, kind: ConnectionKind, ctx: &ConnectionContext<'_>) {
        if let Some(info) = self.connections.get_mut(&kind) {
            info.reset();
        }
        ctx.driver.agps_data_conn_failed(kind);
    }
}

fn bearer_for(addr: IpAddr) -> Bearer {
    match addr {
        IpAddr::V4(_) => Bearer::Ipv4,
        IpAddr::V6(_) => Bearer::Ipv6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NetworkKind;
    use crate::mock::{DriverCall, MockConnectivity, MockDriver};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn setup(result: ActivateResult) -> (ConnectionManager, MockConnectivity, MockDriver) {
        let connectivity = MockConnectivity::new();
        connectivity.set_activate_result(result);
        (ConnectionManager::new("dummy-apn"), connectivity, MockDriver::new())
    }

    #[test]
    fn test_already_active_opens_synchronously() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::AlreadyActive);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.on_network_state(
            &NetworkStateEvent::available(NetworkKind::Assisted).with_apn("supl.carrier"),
            &ctx,
        );
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        conns.request_open(ConnectionKind::Assisted, Some(addr), &ctx);

        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Open);
        assert_eq!(connectivity.bound_routes(), vec![(ConnectionKind::Assisted, addr)]);
        assert!(driver.calls().contains(&DriverCall::ConnOpen(
            ConnectionKind::Assisted,
            "supl.carrier".to_string(),
            Bearer::Ipv4
        )));
    }

    #[test]
    fn test_async_open_waits_for_network() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Opening);
        assert!(driver.calls().is_empty());

        // Other kinds don't resolve the pending open
        conns.on_network_state(&NetworkStateEvent::available(NetworkKind::Cellular), &ctx);
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Opening);

        conns.on_network_state(
            &NetworkStateEvent::available(NetworkKind::Assisted).with_apn("agps.apn"),
            &ctx,
        );
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Open);
        assert_eq!(
            conns.info(ConnectionKind::Assisted).and_then(|i| i.apn.clone()),
            Some("agps.apn".to_string())
        );
    }

    #[test]
    fn test_rejected_reports_failure() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Rejected);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Cellular, None, &ctx);
        assert_eq!(conns.state(ConnectionKind::Cellular), ConnectionState::Closed);
        assert_eq!(driver.calls(), vec![DriverCall::ConnFailed(ConnectionKind::Cellular)]);
    }

    #[test]
    fn test_unavailable_while_opening_fails() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        conns.on_network_state(&NetworkStateEvent::unavailable(NetworkKind::Assisted), &ctx);

        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Closed);
        assert_eq!(driver.calls(), vec![DriverCall::ConnFailed(ConnectionKind::Assisted)]);
    }

    #[test]
    fn test_open_then_close_before_callback() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        conns.request_close(ConnectionKind::Assisted, &ctx);
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Closed);
        assert_eq!(connectivity.deactivated(), vec![ConnectionKind::Assisted]);

        // Late notification must not reopen anything
        conns.on_network_state(&NetworkStateEvent::available(NetworkKind::Assisted), &ctx);
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Closed);
        assert_eq!(driver.calls(), vec![DriverCall::ConnClosed(ConnectionKind::Assisted)]);
    }

    #[test]
    fn test_duplicate_open_is_noop() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        assert_eq!(connectivity.activations(), 1);
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_close(ConnectionKind::Cellular, &ctx);
        assert!(connectivity.deactivated().is_empty());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_fallback_apn_when_nothing_cached() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::AlreadyActive);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Cellular, None, &ctx);
        assert_eq!(
            driver.calls(),
            vec![DriverCall::ConnOpen(
                ConnectionKind::Cellular,
                "dummy-apn".to_string(),
                Bearer::Ipv4
            )]
        );
    }

    #[test]
    fn test_network_lost_while_open() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::AlreadyActive);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        conns.on_network_state(&NetworkStateEvent::unavailable(NetworkKind::Assisted), &ctx);
        assert_eq!(conns.state(ConnectionKind::Assisted), ConnectionState::Closed);
        assert_eq!(
            driver.calls().last(),
            Some(&DriverCall::ConnFailed(ConnectionKind::Assisted))
        );
    }

    #[test]
    fn test_network_address_picks_bearer() {
        let (mut conns, connectivity, driver) = setup(ActivateResult::Started);
        let ctx = ConnectionContext {
            connectivity: &connectivity,
            driver: &driver,
        };
        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

        conns.request_open(ConnectionKind::Assisted, None, &ctx);
        conns.on_network_state(
            &NetworkStateEvent::available(NetworkKind::Assisted)
                .with_apn("v6.apn")
                .with_address(v6),
            &ctx,
        );

        assert_eq!(
            driver.calls(),
            vec![DriverCall::ConnOpen(
                ConnectionKind::Assisted,
                "v6.apn".to_string(),
                Bearer::Ipv6
            )]
        );
        assert!(connectivity.bound_routes().is_empty());

        // A requested server address wins over the network's own
        conns.request_open(ConnectionKind::Cellular, Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))), &ctx);
        conns.on_network_state(
            &NetworkStateEvent::available(NetworkKind::Cellular).with_address(v6),
            &ctx,
        );
        assert_eq!(
            conns.info(ConnectionKind::Cellular).map(|i| i.bearer),
            Some(Bearer::Ipv4)
        );
    }
}
