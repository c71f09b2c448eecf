//! Decoding of an aligned byte buffer into typed values

use crate::error::{Result, WireError, MAX_ARRAY_SIZE};
use crate::marshal::{align_padding, Endianness};
use crate::names::validate_object_path;
use crate::signature::{Signature, Type};
use crate::value::Value;
use std::os::unix::io::RawFd;

/// Incremental decoder over a complete byte buffer.
///
/// The position is absolute from the start of the buffer so alignment is
/// computed the same way the marshaller computed it. Padding content is not
/// checked on read.
pub struct Unmarshaller<'a> {
    data: &'a [u8],
    pos: usize,
    order: Endianness,
    fds: &'a [RawFd],
}

impl<'a> Unmarshaller<'a> {
    pub fn new(data: &'a [u8], order: Endianness, fds: &'a [RawFd]) -> Self {
        Self {
            data,
            pos: 0,
            order,
            fds,
        }
    }

    /// Start decoding at a nonzero offset (used for header fields)
    pub fn with_offset(data: &'a [u8], pos: usize, order: Endianness, fds: &'a [RawFd]) -> Self {
        Self {
            data,
            pos,
            order,
            fds,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn truncated(&self, needed: usize) -> WireError {
        WireError::Truncated {
            needed,
            have: self.remaining(),
        }
    }

    /// Skip padding up to `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = align_padding(self.pos, alignment);
        if self.remaining() < padding {
            return Err(self.truncated(padding));
        }
        self.pos += padding;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.truncated(n));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b: [u8; 2] = self.take(2)?.try_into().expect("sized slice");
        Ok(match self.order {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        })
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(match self.order {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        })
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(match self.order {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        })
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a length-prefixed string element (`s` / `o` layout)
    fn read_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len + 1)?;
        let content = &raw[..len];
        if content.contains(&0) {
            return Err(WireError::EmbeddedNul);
        }
        std::str::from_utf8(content)
            .map(str::to_owned)
            .map_err(|_| WireError::BadUtf8)
    }

    /// Read a signature element (`g` layout)
    fn read_signature(&mut self) -> Result<Signature> {
        let len = self.get_u8()? as usize;
        let raw = self.take(len + 1)?;
        let content = &raw[..len];
        if content.contains(&0) {
            return Err(WireError::EmbeddedNul);
        }
        let s = std::str::from_utf8(content).map_err(|_| WireError::BadUtf8)?;
        Signature::parse(s)
    }

    /// Decode one value of the given type
    pub fn read_value(&mut self, ty: &Type) -> Result<Value> {
        match ty {
            Type::Byte => Ok(Value::Byte(self.get_u8()?)),
            Type::Boolean => match self.get_u32()? {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                other => Err(WireError::BadBoolean(other)),
            },
            Type::Int16 => Ok(Value::Int16(self.get_i16()?)),
            Type::UInt16 => Ok(Value::UInt16(self.get_u16()?)),
            Type::Int32 => Ok(Value::Int32(self.get_i32()?)),
            Type::UInt32 => Ok(Value::UInt32(self.get_u32()?)),
            Type::Int64 => Ok(Value::Int64(self.get_i64()?)),
            Type::UInt64 => Ok(Value::UInt64(self.get_u64()?)),
            Type::Double => Ok(Value::Double(self.get_f64()?)),
            Type::String => Ok(Value::Str(self.read_string()?)),
            Type::ObjectPath => {
                let path = self.read_string()?;
                validate_object_path(&path)?;
                Ok(Value::ObjectPath(path))
            }
            Type::Signature => Ok(Value::Signature(self.read_signature()?)),
            Type::UnixFd => {
                let index = self.get_u32()?;
                self.fds
                    .get(index as usize)
                    .copied()
                    .map(Value::UnixFd)
                    .ok_or(WireError::MissingFd(index))
            }
            Type::Variant => {
                let sig = self.read_signature()?;
                let mut types = sig.into_types();
                if types.len() != 1 {
                    return Err(WireError::InvalidSignature(
                        Signature::new(types).to_string(),
                        "variant signature must hold one complete type",
                    ));
                }
                let inner = self.read_value(&types.remove(0))?;
                Ok(Value::Variant(Box::new(inner)))
            }
            Type::Array(elem) => {
                let len = self.get_u32()? as usize;
                if len > MAX_ARRAY_SIZE {
                    return Err(WireError::ArrayTooLong {
                        len,
                        max: MAX_ARRAY_SIZE,
                    });
                }
                self.align(elem.alignment())?;
                let end = self.pos + len;
                if end > self.data.len() {
                    return Err(self.truncated(len));
                }
                if let Type::DictEntry(key_ty, value_ty) = elem.as_ref() {
                    let mut entries = Vec::new();
                    while self.pos < end {
                        self.align(8)?;
                        let key = self.read_value(key_ty)?;
                        let value = self.read_value(value_ty)?;
                        entries.push((key, value));
                    }
                    if self.pos != end {
                        return Err(self.truncated(0));
                    }
                    Ok(Value::Dict(
                        key_ty.as_ref().clone(),
                        value_ty.as_ref().clone(),
                        entries,
                    ))
                } else {
                    let mut items = Vec::new();
                    while self.pos < end {
                        items.push(self.read_value(elem)?);
                    }
                    if self.pos != end {
                        return Err(self.truncated(0));
                    }
                    Ok(Value::Array(elem.as_ref().clone(), items))
                }
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(self.read_value(field)?);
                }
                Ok(Value::Struct(out))
            }
            Type::DictEntry(key_ty, value_ty) => {
                self.align(8)?;
                let key = self.read_value(key_ty)?;
                let value = self.read_value(value_ty)?;
                Ok(Value::Struct(vec![key, value]))
            }
        }
    }

    /// Decode a full signature worth of values
    pub fn read_all(&mut self, sig: &Signature) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(sig.len());
        for ty in sig.types() {
            out.push(self.read_value(ty)?);
        }
        Ok(out)
    }
}

/// Decode a message body against its signature
pub fn unmarshal(
    sig: &Signature,
    data: &[u8],
    order: Endianness,
    fds: &[RawFd],
) -> Result<Vec<Value>> {
    Unmarshaller::new(data, order, fds).read_all(sig)
}
