//! Engine call/callback boundary
//!
//! The native positioning engine is reached through two traits: [`GnssDriver`]
//! carries calls from the coordinator down to the engine, and [`GnssCallbacks`]
//! carries reports from the engine back up. A test double can implement both
//! without touching hardware (see [`crate::mock`]).

use crate::error::GnssResult;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Positioning mode requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    Standalone,
    MsBased,
    MsAssisted,
}

/// Fix recurrence passed with the position mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    Periodic,
    Single,
}

/// Engine capability bitset reported through `report_capabilities`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const SCHEDULING: u32 = 1 << 0;
    pub const MSB: u32 = 1 << 1;
    pub const MSA: u32 = 1 << 2;
    pub const SINGLE_SHOT: u32 = 1 << 3;
    pub const ON_DEMAND_TIME: u32 = 1 << 4;

    pub fn from_bits(bits: u32) -> Self {
        Capabilities(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn has(&self, capability: u32) -> bool {
        self.0 & capability == capability
    }
}

/// Bitmask of aiding data to delete before the next start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AidingData(u16);

impl AidingData {
    pub const EPHEMERIS: u16 = 0x0001;
    pub const ALMANAC: u16 = 0x0002;
    pub const POSITION: u16 = 0x0004;
    pub const TIME: u16 = 0x0008;
    pub const IONO: u16 = 0x0010;
    pub const UTC: u16 = 0x0020;
    pub const HEALTH: u16 = 0x0040;
    pub const SVDIR: u16 = 0x0080;
    pub const SVSTEER: u16 = 0x0100;
    pub const SADATA: u16 = 0x0200;
    pub const RTI: u16 = 0x0400;
    pub const CELLDB_INFO: u16 = 0x8000;
    pub const ALL: u16 = 0xFFFF;

    pub fn from_bits(bits: u16) -> Self {
        AidingData(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Flag for a single aiding-data name as used by the extra command.
    pub fn flag_for(name: &str) -> Option<u16> {
        let flag = match name {
            "ephemeris" => Self::EPHEMERIS,
            "almanac" => Self::ALMANAC,
            "position" => Self::POSITION,
            "time" => Self::TIME,
            "iono" => Self::IONO,
            "utc" => Self::UTC,
            "health" => Self::HEALTH,
            "svdir" => Self::SVDIR,
            "svsteer" => Self::SVSTEER,
            "sadata" => Self::SADATA,
            "rti" => Self::RTI,
            "celldb-info" => Self::CELLDB_INFO,
            "all" => Self::ALL,
            _ => return None,
        };
        Some(flag)
    }
}

/// Kind of assisted-positioning server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgpsServer {
    Supl,
    C2k,
}

/// Connection kind the engine can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Dedicated assisted-positioning data path
    Assisted,
    /// Generic cellular data path
    Cellular,
}

impl ConnectionKind {
    pub const ALL: [ConnectionKind; 2] = [ConnectionKind::Assisted, ConnectionKind::Cellular];
}

/// IP bearer for an opened data path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bearer {
    #[default]
    Ipv4,
    Ipv6,
}

/// Engine status values carried by `report_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    None,
    SessionBegin,
    SessionEnd,
    EngineOn,
    EngineOff,
}

/// Flags describing which location fields are valid.
pub mod location_flags {
    pub const HAS_LAT_LONG: u16 = 1 << 0;
    pub const HAS_ALTITUDE: u16 = 1 << 1;
    pub const HAS_SPEED: u16 = 1 << 2;
    pub const HAS_BEARING: u16 = 1 << 3;
    pub const HAS_ACCURACY: u16 = 1 << 4;
}

/// Fix as reported by the engine, fields valid according to `flags`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFix {
    pub flags: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f32,
    pub bearing: f32,
    pub accuracy: f32,
    pub timestamp_ms: i64,
    pub source_flags: u32,
    pub raw: Vec<u8>,
}

impl RawFix {
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }
}

/// Location handed to the platform location sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f32>,
    pub bearing: Option<f32>,
    pub accuracy: Option<f32>,
    pub timestamp_ms: i64,
    pub source_flags: u32,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            ..Self::default()
        }
    }

    pub fn with_accuracy(mut self, accuracy: f32) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Build from an engine fix, keeping only the fields its flags mark valid.
    pub fn from_fix(fix: &RawFix) -> Self {
        use location_flags::*;
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.has(HAS_ALTITUDE).then_some(fix.altitude),
            speed: fix.has(HAS_SPEED).then_some(fix.speed),
            bearing: fix.has(HAS_BEARING).then_some(fix.bearing),
            accuracy: fix.has(HAS_ACCURACY).then_some(fix.accuracy),
            timestamp_ms: fix.timestamp_ms,
            source_flags: fix.source_flags,
            raw: fix.raw.clone(),
        }
    }
}

/// One tracked satellite
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SvInfo {
    pub prn: u32,
    pub snr: f32,
    pub elevation: f32,
    pub azimuth: f32,
}

/// Satellite status read back from the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SvStatus {
    pub svs: Vec<SvInfo>,
    pub ephemeris_mask: u32,
    pub almanac_mask: u32,
    pub used_in_fix_mask: u32,
}

impl SvStatus {
    pub fn used_in_fix_count(&self) -> u32 {
        self.used_in_fix_mask.count_ones()
    }
}

/// Kind of subscriber id sent back for `request_set_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIdType {
    None,
    Imsi,
    Msisdn,
}

/// Flags carried by `request_set_id`
pub mod set_id_flags {
    pub const IMSI: u32 = 1 << 0;
    pub const MSISDN: u32 = 1 << 1;
}

/// Radio technology of the serving cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Gsm,
    Umts,
}

/// Serving-cell reference location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceLocation {
    pub cell_type: CellType,
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cid: u32,
}

/// Network state forwarded to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStateReport {
    pub connected: bool,
    pub kind: Option<ConnectionKind>,
    pub roaming: bool,
    pub available: bool,
    pub extra_info: Option<String>,
    pub default_apn: String,
}

/// Outbound calls into the positioning engine.
///
/// Calls are expected to return promptly; anything slow in the engine is
/// reported back through [`GnssCallbacks`].
pub trait GnssDriver: Send + Sync {
    fn init(&self, callbacks: Arc<dyn GnssCallbacks>) -> GnssResult<()>;
    fn cleanup(&self);
    fn set_position_mode(
        &self,
        mode: PositionMode,
        recurrence: Recurrence,
        min_interval_ms: u32,
        preferred_accuracy_m: u32,
        preferred_time_ms: u32,
    ) -> GnssResult<()>;
    fn start(&self) -> GnssResult<()>;
    fn stop(&self) -> GnssResult<()>;
    fn delete_aiding_data(&self, flags: AidingData);
    fn inject_time(&self, time_ms: i64, reference_ms: i64, uncertainty_ms: i32);
    fn inject_location(&self, latitude: f64, longitude: f64, accuracy: f32);
    fn supports_xtra(&self) -> bool;
    fn inject_xtra_data(&self, data: &[u8]);
    fn set_agps_server(&self, server: AgpsServer, host: &str, port: u16);
    fn send_raw_command(&self, bytes: &[u8]);
    /// Fills in the current satellite status; the result holds the SV count.
    fn read_sv_status(&self) -> SvStatus;
    /// Copies the pending NMEA sentence into `buffer`, returning its length.
    fn read_nmea(&self, buffer: &mut [u8]) -> usize;
    fn update_network_state(&self, report: &NetworkStateReport);
    fn agps_data_conn_open(&self, kind: ConnectionKind, apn: &str, bearer: Bearer);
    fn agps_data_conn_closed(&self, kind: ConnectionKind);
    fn agps_data_conn_failed(&self, kind: ConnectionKind);
    fn set_set_id(&self, id_type: SetIdType, value: &str);
    fn set_reference_location(&self, location: &ReferenceLocation);
}

/// Inbound reports from the positioning engine.
///
/// Implementations must not block; the coordinator's implementation only
/// enqueues a message for the worker.
pub trait GnssCallbacks: Send + Sync {
    fn report_location(&self, fix: RawFix);
    fn report_status(&self, status: EngineStatus);
    fn report_sv_status(&self);
    fn report_nmea(&self, timestamp_ms: i64);
    fn report_capabilities(&self, capabilities: u32);
    fn report_xtra_requested(&self);
    fn request_network_connection(&self, kind: ConnectionKind, address: Option<IpAddr>);
    fn release_network_connection(&self, kind: ConnectionKind);
    fn request_utc_time(&self);
    fn request_set_id(&self, flags: u32);
    fn request_reference_location(&self, flags: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_bits() {
        let caps = Capabilities::from_bits(Capabilities::SCHEDULING | Capabilities::MSB);
        assert!(caps.has(Capabilities::SCHEDULING));
        assert!(caps.has(Capabilities::MSB));
        assert!(!caps.has(Capabilities::MSA));
        assert!(!caps.has(Capabilities::ON_DEMAND_TIME));
    }

    #[test]
    fn test_location_from_fix_respects_flags() {
        let fix = RawFix {
            flags: location_flags::HAS_LAT_LONG | location_flags::HAS_ACCURACY,
            latitude: 37.42,
            longitude: -122.08,
            altitude: 30.0,
            accuracy: 8.0,
            timestamp_ms: 1_000,
            ..RawFix::default()
        };

        let location = Location::from_fix(&fix);
        assert_eq!(location.latitude, 37.42);
        assert_eq!(location.accuracy, Some(8.0));
        assert_eq!(location.altitude, None);
        assert_eq!(location.speed, None);
    }

    #[test]
    fn test_aiding_data_names() {
        assert_eq!(AidingData::flag_for("ephemeris"), Some(0x0001));
        assert_eq!(AidingData::flag_for("celldb-info"), Some(0x8000));
        assert_eq!(AidingData::flag_for("all"), Some(0xFFFF));
        assert_eq!(AidingData::flag_for("bogus"), None);
    }

    #[test]
    fn test_sv_used_count() {
        let status = SvStatus {
            used_in_fix_mask: 0b1011,
            ..SvStatus::default()
        };
        assert_eq!(status.used_in_fix_count(), 3);
    }
}
