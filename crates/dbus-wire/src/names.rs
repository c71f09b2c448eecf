//! Validation of bus names, interface names, member names and object paths

use crate::error::{Result, WireError};

/// Maximum length of any name
pub const MAX_NAME_LEN: usize = 255;

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_bus_name_char(b: u8, first: bool, unique: bool) -> bool {
    if b == b'-' {
        return true;
    }
    if first && !unique {
        is_name_start(b)
    } else {
        is_name_char(b)
    }
}

/// Validate a member (method, property or signal) name
pub fn validate_member_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let err = || WireError::InvalidMemberName(name.to_string());
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return Err(err());
    }
    if !is_name_start(bytes[0]) {
        return Err(err());
    }
    if !bytes[1..].iter().all(|&b| is_name_char(b)) {
        return Err(err());
    }
    Ok(())
}

/// Validate an interface name: two or more dot-separated elements
pub fn validate_interface_name(name: &str) -> Result<()> {
    let err = || WireError::InvalidInterfaceName(name.to_string());
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(err());
    }
    let mut elements = 0;
    for element in name.split('.') {
        let bytes = element.as_bytes();
        if bytes.is_empty() || !is_name_start(bytes[0]) {
            return Err(err());
        }
        if !bytes[1..].iter().all(|&b| is_name_char(b)) {
            return Err(err());
        }
        elements += 1;
    }
    if elements < 2 {
        return Err(err());
    }
    Ok(())
}

/// Validate an error name (same grammar as interface names)
pub fn validate_error_name(name: &str) -> Result<()> {
    validate_interface_name(name)
        .map_err(|_| WireError::InvalidInterfaceName(name.to_string()))
}

/// Validate a bus name, either unique (`:1.42`) or well-known
pub fn validate_bus_name(name: &str) -> Result<()> {
    let err = || WireError::InvalidBusName(name.to_string());
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(err());
    }
    let (rest, unique) = match name.strip_prefix(':') {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let mut elements = 0;
    for element in rest.split('.') {
        let bytes = element.as_bytes();
        if bytes.is_empty() {
            return Err(err());
        }
        for (i, &b) in bytes.iter().enumerate() {
            if !is_bus_name_char(b, i == 0, unique) {
                return Err(err());
            }
        }
        elements += 1;
    }
    if elements < 2 {
        return Err(err());
    }
    Ok(())
}

/// Validate an object path: `/` or `/`-separated non-empty elements
pub fn validate_object_path(path: &str) -> Result<()> {
    let err = || WireError::BadObjectPath(path.to_string());
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'/') {
        return Err(err());
    }
    if bytes.len() == 1 {
        return Ok(());
    }
    if bytes.last() == Some(&b'/') {
        return Err(err());
    }
    for element in path[1..].split('/') {
        let bytes = element.as_bytes();
        if bytes.is_empty() || !bytes.iter().all(|&b| is_name_char(b)) {
            return Err(err());
        }
    }
    Ok(())
}
