//! Polymorphic wire values
//!
//! A [`Value`] is the in-memory form of one complete D-Bus type. Dicts are
//! kept as ordered entry lists so a decode-encode cycle reproduces the
//! original bytes, and 64-bit integers are stored exactly.

use crate::signature::{Signature, Type};
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// One marshallable value, tagged by its wire type
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(Signature),
    /// A live descriptor; on the wire this becomes an index into the
    /// out-of-band fd array
    UnixFd(RawFd),
    /// Homogeneous array with an explicit element type so empty arrays
    /// keep their signature
    Array(Type, Vec<Value>),
    Struct(Vec<Value>),
    /// Array of dict entries: key type, value type, ordered entries
    Dict(Type, Type, Vec<(Value, Value)>),
    Variant(Box<Value>),
}

impl Value {
    /// The wire type of this value
    pub fn ty(&self) -> Type {
        match self {
            Self::Byte(_) => Type::Byte,
            Self::Boolean(_) => Type::Boolean,
            Self::Int16(_) => Type::Int16,
            Self::UInt16(_) => Type::UInt16,
            Self::Int32(_) => Type::Int32,
            Self::UInt32(_) => Type::UInt32,
            Self::Int64(_) => Type::Int64,
            Self::UInt64(_) => Type::UInt64,
            Self::Double(_) => Type::Double,
            Self::Str(_) => Type::String,
            Self::ObjectPath(_) => Type::ObjectPath,
            Self::Signature(_) => Type::Signature,
            Self::UnixFd(_) => Type::UnixFd,
            Self::Array(elem, _) => Type::Array(Box::new(elem.clone())),
            Self::Struct(fields) => Type::Struct(fields.iter().map(Value::ty).collect()),
            Self::Dict(key, value, _) => Type::Array(Box::new(Type::DictEntry(
                Box::new(key.clone()),
                Box::new(value.clone()),
            ))),
            Self::Variant(_) => Type::Variant,
        }
    }

    /// Wrap in a variant
    pub fn into_variant(self) -> Value {
        Value::Variant(Box::new(self))
    }

    /// Build a `a{sv}` dict from string keys and variant-wrapped values
    pub fn string_variant_dict<I>(entries: I) -> Value
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Value::Dict(
            Type::String,
            Type::Variant,
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), v.into_variant()))
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Unwrap one layer of variant, if present
    pub fn unwrap_variant(self) -> Value {
        match self {
            Self::Variant(inner) => *inner,
            other => other,
        }
    }

    /// View a `a{sv}`-shaped value as a map. Later duplicate keys win.
    pub fn as_string_map(&self) -> Option<HashMap<&str, &Value>> {
        match self {
            Self::Dict(_, _, entries) => {
                let mut map = HashMap::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.as_str()?, v);
                }
                Some(map)
            }
            _ => None,
        }
    }
}

macro_rules! impl_value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_value_from!(u8, Byte);
impl_value_from!(bool, Boolean);
impl_value_from!(i16, Int16);
impl_value_from!(u16, UInt16);
impl_value_from!(i32, Int32);
impl_value_from!(u32, UInt32);
impl_value_from!(i64, Int64);
impl_value_from!(u64, UInt64);
impl_value_from!(f64, Double);
impl_value_from!(String, Str);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
