//! D-Bus message model and frame codec
//!
//! Wire layout of a message:
//!
//! ```text
//! +--------+--------+--------+--------+
//! | endian |  type  | flags  |version |
//! +--------+--------+--------+--------+
//! |            body length            |
//! +--------+--------+--------+--------+
//! |              serial               |
//! +--------+--------+--------+--------+
//! |   header field array a(yv) ...    |
//! +-----------------------------------+
//! |   padding to 8-byte alignment     |
//! +-----------------------------------+
//! |              body                 |
//! +-----------------------------------+
//! ```

use crate::error::{Result, WireError, MAX_HEADER_FIELDS_SIZE, MAX_MESSAGE_SIZE};
use crate::marshal::{align_padding, Endianness, Marshaller};
use crate::names::{
    validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
    validate_object_path,
};
use crate::signature::{Signature, Type};
use crate::unmarshal::{unmarshal, Unmarshaller};
use crate::value::Value;
use bytes::Bytes;
use std::os::unix::io::RawFd;

/// D-Bus protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed part of the header: 12 bytes plus the field array length
const FIXED_HEADER_SIZE: usize = 16;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// The sender does not want a reply
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Do not launch an owner for the destination name
    pub const NO_AUTO_START: u8 = 0x02;
    /// The receiver may prompt the user for authorization
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x04;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value & 0x07)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn no_reply_expected(self) -> bool {
        self.0 & Self::NO_REPLY_EXPECTED != 0
    }

    pub fn set_no_reply_expected(&mut self) -> &mut Self {
        self.0 |= Self::NO_REPLY_EXPECTED;
        self
    }

    pub fn set_no_auto_start(&mut self) -> &mut Self {
        self.0 |= Self::NO_AUTO_START;
        self
    }
}

/// Header field codes
mod field_code {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

/// One D-Bus message: header fields plus a marshalled body
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: Flags,
    /// Assigned by the connection at send time; zero means unassigned
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Signature,
    pub body: Bytes,
    /// Descriptors travelling with this message, in body reference order
    pub fds: Vec<RawFd>,
    /// Declared fd count from a decoded header (descriptors attach later)
    pub unix_fds: u32,
    pub endianness: Endianness,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: Flags::new(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Bytes::new(),
            fds: Vec::new(),
            unix_fds: 0,
            endianness: Endianness::native(),
        }
    }

    /// Build a METHOD_CALL for `member` on the object at `path`
    pub fn method_call(path: &str, member: &str) -> Result<Self> {
        validate_object_path(path)?;
        validate_member_name(member)?;
        let mut m = Self::new(MessageType::MethodCall);
        m.path = Some(path.to_string());
        m.member = Some(member.to_string());
        Ok(m)
    }

    /// Build a SIGNAL emitted from `path`
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        validate_object_path(path)?;
        validate_interface_name(interface)?;
        validate_member_name(member)?;
        let mut m = Self::new(MessageType::Signal);
        m.path = Some(path.to_string());
        m.interface = Some(interface.to_string());
        m.member = Some(member.to_string());
        Ok(m)
    }

    /// Build a METHOD_RETURN answering `call`
    pub fn method_return(call: &Message) -> Self {
        let mut m = Self::new(MessageType::MethodReturn);
        m.reply_serial = Some(call.serial);
        m.destination = call.sender.clone();
        m
    }

    /// Build an ERROR answering `call`
    pub fn error(call: &Message, name: &str, text: &str) -> Result<Self> {
        validate_error_name(name)?;
        let mut m = Self::new(MessageType::Error);
        m.reply_serial = Some(call.serial);
        m.destination = call.sender.clone();
        m.error_name = Some(name.to_string());
        m.set_body(&[Value::Str(text.to_string())])?;
        Ok(m)
    }

    pub fn with_destination(mut self, destination: &str) -> Result<Self> {
        validate_bus_name(destination)?;
        self.destination = Some(destination.to_string());
        Ok(self)
    }

    pub fn with_interface(mut self, interface: &str) -> Result<Self> {
        validate_interface_name(interface)?;
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_no_reply(mut self) -> Self {
        self.flags.set_no_reply_expected();
        self
    }

    /// Marshal `values` as the body, replacing signature, body and fds
    pub fn set_body(&mut self, values: &[Value]) -> Result<()> {
        self.signature = values.iter().map(Value::ty).collect();
        let mut m = Marshaller::new(self.endianness);
        for value in values {
            m.write_value(value)?;
        }
        let (body, fds) = m.into_parts();
        self.body = body;
        self.unix_fds = fds.len() as u32;
        self.fds = fds;
        Ok(())
    }

    pub fn with_body(mut self, values: &[Value]) -> Result<Self> {
        self.set_body(values)?;
        Ok(self)
    }

    /// Unmarshal the body against the declared signature
    pub fn body_values(&self) -> Result<Vec<Value>> {
        unmarshal(&self.signature, &self.body, self.endianness, &self.fds)
    }

    /// Whether the sender expects a METHOD_RETURN or ERROR back
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && !self.flags.no_reply_expected()
    }

    /// Enforce the per-type mandatory header fields
    fn validate_headers(&self) -> Result<()> {
        let missing = |what: &str| WireError::InvalidHeader(what.to_string());
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(missing("method call requires path and member"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(missing("method return requires reply serial"));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() || self.reply_serial.is_none() {
                    return Err(missing("error requires error name and reply serial"));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(missing(
                        "signal requires path, interface and member",
                    ));
                }
            }
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![Value::Byte(code), value.into_variant()]));
        };
        if let Some(p) = &self.path {
            push(field_code::PATH, Value::ObjectPath(p.clone()));
        }
        if let Some(i) = &self.interface {
            push(field_code::INTERFACE, Value::Str(i.clone()));
        }
        if let Some(m) = &self.member {
            push(field_code::MEMBER, Value::Str(m.clone()));
        }
        if let Some(e) = &self.error_name {
            push(field_code::ERROR_NAME, Value::Str(e.clone()));
        }
        if let Some(r) = self.reply_serial {
            push(field_code::REPLY_SERIAL, Value::UInt32(r));
        }
        if let Some(d) = &self.destination {
            push(field_code::DESTINATION, Value::Str(d.clone()));
        }
        if let Some(s) = &self.sender {
            push(field_code::SENDER, Value::Str(s.clone()));
        }
        if !self.signature.is_empty() {
            push(field_code::SIGNATURE, Value::Signature(self.signature.clone()));
        }
        if !self.fds.is_empty() {
            push(field_code::UNIX_FDS, Value::UInt32(self.fds.len() as u32));
        }
        fields
    }

    /// Encode the complete frame. The serial must already be assigned.
    pub fn encode(&self) -> Result<Bytes> {
        if self.serial == 0 {
            return Err(WireError::InvalidHeader("serial not assigned".to_string()));
        }
        self.validate_headers()?;
        if self.body.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: self.body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut m = Marshaller::new(self.endianness);
        m.put_u8(self.endianness.tag());
        m.put_u8(self.message_type as u8);
        m.put_u8(self.flags.as_u8());
        m.put_u8(PROTOCOL_VERSION);
        m.put_u32(self.body.len() as u32);
        m.put_u32(self.serial);

        let entry_ty = Type::Struct(vec![Type::Byte, Type::Variant]);
        m.write_value(&Value::Array(entry_ty, self.header_fields()))?;
        let fields_len = m.position() - FIXED_HEADER_SIZE;
        if fields_len > MAX_HEADER_FIELDS_SIZE {
            return Err(WireError::MessageTooLarge {
                size: fields_len,
                max: MAX_HEADER_FIELDS_SIZE,
            });
        }

        m.align(8);
        m.put_slice(&self.body);
        let (frame, _) = m.into_parts();
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: frame.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the message (or `None` for frames of an unknown type, which
    /// are skipped) and the number of bytes consumed. Fails with
    /// [`WireError::Incomplete`] when fewer bytes than the declared frame
    /// size are available; the `needed` field is the full frame size.
    pub fn decode(buf: &[u8]) -> Result<(Option<Message>, usize)> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(WireError::Incomplete {
                needed: FIXED_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let order = Endianness::from_tag(buf[0])
            .ok_or_else(|| WireError::InvalidHeader("bad endian tag".to_string()))?;
        if buf[3] != PROTOCOL_VERSION {
            return Err(WireError::InvalidHeader(format!(
                "unsupported protocol version {}",
                buf[3]
            )));
        }

        let read_u32 = |bytes: &[u8]| -> u32 {
            let arr: [u8; 4] = bytes.try_into().expect("sized slice");
            match order {
                Endianness::Little => u32::from_le_bytes(arr),
                Endianness::Big => u32::from_be_bytes(arr),
            }
        };
        let body_len = read_u32(&buf[4..8]) as usize;
        let serial = read_u32(&buf[8..12]);
        let fields_len = read_u32(&buf[12..16]) as usize;

        if fields_len > MAX_HEADER_FIELDS_SIZE {
            return Err(WireError::MessageTooLarge {
                size: fields_len,
                max: MAX_HEADER_FIELDS_SIZE,
            });
        }
        let body_start = FIXED_HEADER_SIZE + fields_len;
        let body_start = body_start + align_padding(body_start, 8);
        let total = body_start + body_len;
        if body_len > MAX_MESSAGE_SIZE || total > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if buf.len() < total {
            return Err(WireError::Incomplete {
                needed: total,
                have: buf.len(),
            });
        }
        if serial == 0 {
            return Err(WireError::InvalidHeader("serial is zero".to_string()));
        }

        let message_type = match MessageType::from_u8(buf[1]) {
            Some(t) => t,
            // Unknown types are skipped, not fatal
            None => return Ok((None, total)),
        };

        let mut msg = Message::new(message_type);
        msg.endianness = order;
        msg.flags = Flags::from_u8(buf[2]);
        msg.serial = serial;

        let fields_end = FIXED_HEADER_SIZE + fields_len;
        let mut um = Unmarshaller::with_offset(&buf[..fields_end], FIXED_HEADER_SIZE, order, &[]);
        let entry_ty = Type::Struct(vec![Type::Byte, Type::Variant]);
        while um.position() < fields_end {
            let entry = um.read_value(&entry_ty)?;
            let (code, value) = match entry {
                Value::Struct(mut parts) if parts.len() == 2 => {
                    let value = parts.pop().map(Value::unwrap_variant);
                    match (parts.pop(), value) {
                        (Some(Value::Byte(code)), Some(value)) => (code, value),
                        _ => {
                            return Err(WireError::InvalidHeader(
                                "malformed header field".to_string(),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(WireError::InvalidHeader(
                        "malformed header field".to_string(),
                    ))
                }
            };
            match (code, value) {
                (field_code::PATH, Value::ObjectPath(p)) => msg.path = Some(p),
                (field_code::INTERFACE, Value::Str(s)) => {
                    validate_interface_name(&s)?;
                    msg.interface = Some(s);
                }
                (field_code::MEMBER, Value::Str(s)) => {
                    validate_member_name(&s)?;
                    msg.member = Some(s);
                }
                (field_code::ERROR_NAME, Value::Str(s)) => {
                    validate_error_name(&s)?;
                    msg.error_name = Some(s);
                }
                (field_code::REPLY_SERIAL, Value::UInt32(v)) => msg.reply_serial = Some(v),
                (field_code::DESTINATION, Value::Str(s)) => {
                    validate_bus_name(&s)?;
                    msg.destination = Some(s);
                }
                (field_code::SENDER, Value::Str(s)) => {
                    validate_bus_name(&s)?;
                    msg.sender = Some(s);
                }
                (field_code::SIGNATURE, Value::Signature(sig)) => msg.signature = sig,
                (field_code::UNIX_FDS, Value::UInt32(v)) => msg.unix_fds = v,
                // Unknown field codes are ignored for forward compatibility
                (code, _) if code > field_code::UNIX_FDS => {}
                _ => {
                    return Err(WireError::InvalidHeader(
                        "header field has wrong type".to_string(),
                    ))
                }
            }
        }

        msg.validate_headers()?;
        msg.body = Bytes::copy_from_slice(&buf[body_start..total]);
        Ok((Some(msg), total))
    }
}
