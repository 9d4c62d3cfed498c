//! Wall-clock helpers and host identity
//!
//! All timestamps in the store use the canonical `YYYY-MM-DD HH:MM:SS`
//! format in local time; comparisons on the text form are chronological.

use crate::error::{Error, Result};
use chrono::{Duration, Local, NaiveDateTime};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Canonical timestamp format shared by the store and HQ payloads
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time, truncated to whole seconds by formatting
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Current local time in the canonical string format
pub fn sdatetime() -> String {
    format(now())
}

/// Format a datetime in the canonical format
pub fn format(dt: NaiveDateTime) -> String {
    dt.format(DATE_FORMAT).to_string()
}

/// Parse a canonical timestamp back into a datetime
pub fn parse(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .map_err(|_| Error::InvalidTimestamp(text.to_string()))
}

/// Canonical timestamp for `hours` hours before now
pub fn minus_hours(hours: i64) -> String {
    format(now() - Duration::hours(hours))
}

/// Canonical timestamp for `seconds` seconds before now
pub fn minus_seconds(seconds: i64) -> String {
    format(now() - Duration::seconds(seconds))
}

/// Add seconds to a datetime
pub fn plus_seconds(dt: NaiveDateTime, seconds: i64) -> NaiveDateTime {
    dt + Duration::seconds(seconds)
}

/// Seconds since the Unix epoch
pub fn unix_time() -> i64 {
    Local::now().timestamp()
}

/// Hostname and primary IPv4 of the local machine, resolved once at startup
#[derive(Debug, Clone)]
pub struct Identity {
    pub hostname: String,
    pub ipv4: Ipv4Addr,
}

impl Identity {
    /// Resolve the local hostname and its primary IPv4 address
    ///
    /// Falls back to loopback when the hostname does not resolve.
    pub fn resolve() -> Self {
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        let ipv4 = (hostname.as_str(), 0u16)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| {
                addrs.find_map(|a| match a.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
            })
            .unwrap_or(Ipv4Addr::LOCALHOST);

        Self { hostname, ipv4 }
    }
}
