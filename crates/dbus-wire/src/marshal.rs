//! Encoding of typed values into an aligned byte buffer

use crate::error::{Result, WireError, MAX_ARRAY_SIZE};
use crate::names::validate_object_path;
use crate::signature::{Signature, Type, MAX_SIGNATURE_LEN};
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::os::unix::io::RawFd;

/// Byte order of an encoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// The endian tag byte carried in the first byte of every message
    pub fn tag(self) -> u8 {
        match self {
            Self::Little => b'l',
            Self::Big => b'B',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'l' => Some(Self::Little),
            b'B' => Some(Self::Big),
            _ => None,
        }
    }

    /// The byte order of this machine
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Padding needed to move `position` up to `alignment`
#[inline]
pub fn align_padding(position: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return 0;
    }
    let remainder = position % alignment;
    if remainder == 0 {
        0
    } else {
        alignment - remainder
    }
}

/// Incremental encoder for one aligned stream.
///
/// Alignment is computed from the start of the buffer, so a message header
/// and its body can be produced by a single marshaller, and a body on its
/// own starts from offset zero (bodies begin at an 8-aligned boundary).
pub struct Marshaller {
    buf: BytesMut,
    order: Endianness,
    fds: Vec<RawFd>,
}

impl Marshaller {
    pub fn new(order: Endianness) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            order,
            fds: Vec::new(),
        }
    }

    pub fn order(&self) -> Endianness {
        self.order
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Write zero padding up to `alignment`
    pub fn align(&mut self, alignment: usize) {
        let padding = align_padding(self.buf.len(), alignment);
        for _ in 0..padding {
            self.buf.put_u8(0);
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.order {
            Endianness::Little => self.buf.put_u16_le(v),
            Endianness::Big => self.buf.put_u16(v),
        }
    }

    pub fn put_i16(&mut self, v: i16) {
        match self.order {
            Endianness::Little => self.buf.put_i16_le(v),
            Endianness::Big => self.buf.put_i16(v),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.order {
            Endianness::Little => self.buf.put_u32_le(v),
            Endianness::Big => self.buf.put_u32(v),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        match self.order {
            Endianness::Little => self.buf.put_i32_le(v),
            Endianness::Big => self.buf.put_i32(v),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.order {
            Endianness::Little => self.buf.put_u64_le(v),
            Endianness::Big => self.buf.put_u64(v),
        }
    }

    pub fn put_i64(&mut self, v: i64) {
        match self.order {
            Endianness::Little => self.buf.put_i64_le(v),
            Endianness::Big => self.buf.put_i64(v),
        }
    }

    pub fn put_f64(&mut self, v: f64) {
        match self.order {
            Endianness::Little => self.buf.put_f64_le(v),
            Endianness::Big => self.buf.put_f64(v),
        }
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        let bytes = match self.order {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    /// Write a length-prefixed string element (`s` / `o` layout)
    fn write_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(WireError::EmbeddedNul);
        }
        self.align(4);
        self.put_u32(s.len() as u32);
        self.put_slice(s.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Write a signature element (`g` layout, u8 length prefix)
    fn write_signature(&mut self, sig: &Signature) -> Result<()> {
        let s = sig.to_string();
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(WireError::InvalidSignature(s, "longer than 255 bytes"));
        }
        self.put_u8(s.len() as u8);
        self.put_slice(s.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Encode one value, padding first to its alignment
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => {
                self.align(4);
                self.put_u32(u32::from(*v));
            }
            Value::Int16(v) => {
                self.align(2);
                self.put_i16(*v);
            }
            Value::UInt16(v) => {
                self.align(2);
                self.put_u16(*v);
            }
            Value::Int32(v) => {
                self.align(4);
                self.put_i32(*v);
            }
            Value::UInt32(v) => {
                self.align(4);
                self.put_u32(*v);
            }
            Value::Int64(v) => {
                self.align(8);
                self.put_i64(*v);
            }
            Value::UInt64(v) => {
                self.align(8);
                self.put_u64(*v);
            }
            Value::Double(v) => {
                self.align(8);
                self.put_f64(*v);
            }
            Value::Str(s) => self.write_string(s)?,
            Value::ObjectPath(p) => {
                validate_object_path(p)?;
                self.write_string(p)?;
            }
            Value::Signature(sig) => self.write_signature(sig)?,
            Value::UnixFd(fd) => {
                let index = self.fds.len() as u32;
                self.fds.push(*fd);
                self.align(4);
                self.put_u32(index);
            }
            Value::Array(elem, items) => {
                for item in items {
                    let found = item.ty();
                    if found != *elem {
                        return Err(WireError::TypeMismatch {
                            expected: elem.to_string(),
                            found: found.to_string(),
                        });
                    }
                }
                self.write_array(elem, items.iter())?;
            }
            Value::Dict(key_ty, value_ty, entries) => {
                let entry_ty =
                    Type::DictEntry(Box::new(key_ty.clone()), Box::new(value_ty.clone()));
                self.align(4);
                let len_at = self.position();
                self.put_u32(0);
                self.align(entry_ty.alignment());
                let start = self.position();
                for (k, v) in entries {
                    if k.ty() != *key_ty || v.ty() != *value_ty {
                        return Err(WireError::TypeMismatch {
                            expected: entry_ty.to_string(),
                            found: Type::DictEntry(Box::new(k.ty()), Box::new(v.ty()))
                                .to_string(),
                        });
                    }
                    self.align(8);
                    self.write_value(k)?;
                    self.write_value(v)?;
                }
                self.finish_array(len_at, start)?;
            }
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::Variant(inner) => {
                self.write_signature(&Signature::from(inner.ty()))?;
                self.write_value(inner)?;
            }
        }
        Ok(())
    }

    fn write_array<'v>(
        &mut self,
        elem: &Type,
        items: impl Iterator<Item = &'v Value>,
    ) -> Result<()> {
        self.align(4);
        let len_at = self.position();
        self.put_u32(0);
        self.align(elem.alignment());
        let start = self.position();
        for item in items {
            self.write_value(item)?;
        }
        self.finish_array(len_at, start)
    }

    fn finish_array(&mut self, len_at: usize, start: usize) -> Result<()> {
        let len = self.position() - start;
        if len > MAX_ARRAY_SIZE {
            return Err(WireError::ArrayTooLong {
                len,
                max: MAX_ARRAY_SIZE,
            });
        }
        self.patch_u32(len_at, len as u32);
        Ok(())
    }

    /// Consume the marshaller, returning the bytes and collected fds
    pub fn into_parts(self) -> (Bytes, Vec<RawFd>) {
        (self.buf.freeze(), self.fds)
    }
}

/// Encode a sequence of values as a message body
pub fn marshal(values: &[Value], order: Endianness) -> Result<(Bytes, Vec<RawFd>)> {
    let mut m = Marshaller::new(order);
    for value in values {
        m.write_value(value)?;
    }
    Ok(m.into_parts())
}
