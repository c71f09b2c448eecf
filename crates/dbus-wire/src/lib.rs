//! D-Bus type system and wire codec
//!
//! This crate implements the marshalling layer of the D-Bus protocol:
//! type signatures, polymorphic values, the aligned dual-endian body
//! codec, and the message frame format. It performs no I/O; the
//! `dbus-peer` crate drives it against a socket.
//!
//! # Example
//!
//! ```
//! use dbus_wire::{marshal, unmarshal, Endianness, Signature, Value};
//!
//! let values = vec![Value::from("hello"), Value::from(42u32)];
//! let sig: Signature = values.iter().map(Value::ty).collect();
//! assert_eq!(sig.to_string(), "su");
//!
//! let (bytes, fds) = marshal(&values, Endianness::Little).unwrap();
//! let decoded = unmarshal(&sig, &bytes, Endianness::Little, &fds).unwrap();
//! assert_eq!(decoded, values);
//! ```

pub mod error;
pub mod marshal;
pub mod message;
pub mod names;
pub mod signature;
pub mod unmarshal;
pub mod value;

pub use error::{Result, WireError, MAX_ARRAY_SIZE, MAX_HEADER_FIELDS_SIZE, MAX_MESSAGE_SIZE};
pub use marshal::{align_padding, marshal, Endianness, Marshaller};
pub use message::{Flags, Message, MessageType, PROTOCOL_VERSION};
pub use names::{
    validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
    validate_object_path,
};
pub use signature::{Signature, Type, MAX_SIGNATURE_LEN};
pub use unmarshal::{unmarshal, Unmarshaller};
pub use value::Value;

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
