//! Bus address parsing and discovery
//!
//! Addresses are `scheme:key=value,key=value` entries, possibly several
//! separated by semicolons. Discovery order is: explicit address, then the
//! `DBUS_SESSION_BUS_ADDRESS` / `DBUS_SYSTEM_BUS_ADDRESS` environment
//! variable, then the well-known default for the bus kind.

use crate::error::{Error, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Default system bus socket
const SYSTEM_BUS_PATH: &str = "/var/run/dbus/system_bus_socket";

/// A parsed, connectable bus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// `unix:path=…`
    UnixPath(PathBuf),
    /// `unix:abstract=…`
    UnixAbstract(String),
    /// `tcp:host=…,port=…`
    Tcp { host: String, port: u16 },
    /// `launchd:env=…`, resolved through the named environment variable
    LaunchdEnv(String),
}

impl BusAddress {
    /// Parse an address string, taking the first entry that parses
    pub fn parse(address: &str) -> Result<Self> {
        let mut last_err = None;
        for entry in address.split(';').filter(|e| !e.is_empty()) {
            match Self::parse_entry(entry) {
                Ok(addr) => return Ok(addr),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::AddressParse(address.to_string())))
    }

    fn parse_entry(entry: &str) -> Result<Self> {
        let err = || Error::AddressParse(entry.to_string());
        let (scheme, rest) = entry.split_once(':').ok_or_else(err)?;

        let mut pairs = Vec::new();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(err)?;
            pairs.push((key, value));
        }
        let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

        match scheme {
            "unix" => {
                if let Some(path) = get("path") {
                    Ok(Self::UnixPath(PathBuf::from(path)))
                } else if let Some(name) = get("abstract") {
                    Ok(Self::UnixAbstract(name.to_string()))
                } else if get("runtime") == Some("yes") {
                    let dir = env::var("XDG_RUNTIME_DIR").map_err(|_| err())?;
                    Ok(Self::UnixPath(PathBuf::from(dir).join("bus")))
                } else {
                    Err(err())
                }
            }
            "tcp" => {
                let host = get("host").ok_or_else(err)?.to_string();
                let port = get("port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(err)?;
                Ok(Self::Tcp { host, port })
            }
            "launchd" => {
                let var = get("env").ok_or_else(err)?;
                Ok(Self::LaunchdEnv(var.to_string()))
            }
            _ => Err(err()),
        }
    }

    /// The session bus address for this environment
    pub fn session() -> Result<Self> {
        if let Ok(addr) = env::var("DBUS_SESSION_BUS_ADDRESS") {
            return Self::parse(&addr);
        }
        let dir = env::var("XDG_RUNTIME_DIR")
            .map_err(|_| Error::AddressParse("no DBUS_SESSION_BUS_ADDRESS and no XDG_RUNTIME_DIR".to_string()))?;
        Ok(Self::UnixPath(PathBuf::from(dir).join("bus")))
    }

    /// The system bus address for this environment
    pub fn system() -> Result<Self> {
        if let Ok(addr) = env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            return Self::parse(&addr);
        }
        Ok(Self::UnixPath(PathBuf::from(SYSTEM_BUS_PATH)))
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnixPath(path) => write!(f, "unix:path={}", path.display()),
            Self::UnixAbstract(name) => write!(f, "unix:abstract={}", name),
            Self::Tcp { host, port } => write!(f, "tcp:host={},port={}", host, port),
            Self::LaunchdEnv(var) => write!(f, "launchd:env={}", var),
        }
    }
}
