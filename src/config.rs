//! Static properties file (`gps.conf` style, `KEY=VALUE` lines, no sections).
//!
//! Read once when the provider is built. A missing file yields defaults.

use crate::error::GnssResult;
use ini::{Ini, Properties};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_APN: &str = "dummy-apn";
pub const DEFAULT_FIX_INTERVAL_MS: u32 = 1000;

/// Host/port pair for an auxiliary server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnssConfig {
    pub ntp_server: Option<String>,
    pub xtra_servers: Vec<String>,
    pub supl_server: Option<ServerAddress>,
    pub c2k_server: Option<ServerAddress>,
    /// Allow MS-based / MS-assisted modes
    pub assisted_gps_enabled: bool,
    /// APN used when neither the network event nor the cache has one
    pub default_apn: String,
    pub fix_interval_ms: u32,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            ntp_server: None,
            xtra_servers: Vec::new(),
            supl_server: None,
            c2k_server: None,
            assisted_gps_enabled: true,
            default_apn: DEFAULT_APN.to_string(),
            fix_interval_ms: DEFAULT_FIX_INTERVAL_MS,
        }
    }
}

impl GnssConfig {
    /// Load from a properties file. A missing file is not an error.
    pub fn load_from(path: &Path) -> GnssResult<Self> {
        if !path.exists() {
            log::info!("No GNSS config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path)?;
        Ok(Self::from_properties(ini.general_section()))
    }

    /// Parse from the contents of a properties file.
    pub fn parse(contents: &str) -> GnssResult<Self> {
        let ini = Ini::load_from_str(contents)?;
        Ok(Self::from_properties(ini.general_section()))
    }

    fn from_properties(props: &Properties) -> Self {
        let defaults = Self::default();

        let xtra_servers = ["XTRA_SERVER_1", "XTRA_SERVER_2", "XTRA_SERVER_3"]
            .iter()
            .filter_map(|key| non_empty(props.get(key)))
            .collect();

        Self {
            ntp_server: non_empty(props.get("NTP_SERVER")),
            xtra_servers,
            supl_server: server_address(props, "SUPL_HOST", "SUPL_PORT"),
            c2k_server: server_address(props, "C2K_HOST", "C2K_PORT"),
            assisted_gps_enabled: props
                .get("ASSISTED_GPS_ENABLED")
                .map(parse_bool)
                .unwrap_or(defaults.assisted_gps_enabled),
            default_apn: non_empty(props.get("DEFAULT_APN")).unwrap_or(defaults.default_apn),
            fix_interval_ms: match props.get("FIX_INTERVAL_MS").map(|v| v.trim().parse::<u32>()) {
                Some(Ok(ms)) if ms > 0 => ms,
                Some(_) => {
                    log::warn!("Ignoring invalid FIX_INTERVAL_MS");
                    defaults.fix_interval_ms
                }
                None => defaults.fix_interval_ms,
            },
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_bool(value: &str) -> bool {
    !matches!(value.trim(), "0" | "false" | "FALSE" | "no")
}

fn server_address(props: &Properties, host_key: &str, port_key: &str) -> Option<ServerAddress> {
    let host = non_empty(props.get(host_key))?;
    let port = match props.get(port_key).map(|p| p.trim().parse::<u16>()) {
        Some(Ok(port)) => port,
        _ => {
            log::warn!("Unable to parse {} for {}", port_key, host);
            return None;
        }
    };
    Some(ServerAddress { host, port })
}
