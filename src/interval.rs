use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Fixed part of an interval record: attribute i32, start i64, end i64,
/// value tag u8.
pub const INTERVAL_BASE_SIZE: usize = 21;

/// String and custom payloads carry a u16 length prefix.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const TAG_NULL: u8 = 0;
const TAG_INT32: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_CUSTOM: u8 = 5;

/// Typed state value carried by an interval.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    Str(String),
    Custom(Vec<u8>),
}

impl StateValue {
    /// Bytes behind the length prefix, for payload-carrying kinds.
    fn payload_len(&self) -> usize {
        match self {
            StateValue::Str(s) => s.len(),
            StateValue::Custom(b) => b.len(),
            _ => 0,
        }
    }

    /// Serialized size of the tag plus payload.
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            StateValue::Null => 0,
            StateValue::Int32(_) => 4,
            StateValue::Int64(_) | StateValue::Double(_) => 8,
            StateValue::Str(s) => 2 + s.len(),
            StateValue::Custom(b) => 2 + b.len(),
        }
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            StateValue::Null => writer
                .write_u8(TAG_NULL)
                .map_err(|e| Error::Encode("value tag", e))?,
            StateValue::Int32(v) => {
                writer
                    .write_u8(TAG_INT32)
                    .map_err(|e| Error::Encode("value tag", e))?;
                writer
                    .write_i32::<BigEndian>(*v)
                    .map_err(|e| Error::Encode("int32 value", e))?;
            }
            StateValue::Int64(v) => {
                writer
                    .write_u8(TAG_INT64)
                    .map_err(|e| Error::Encode("value tag", e))?;
                writer
                    .write_i64::<BigEndian>(*v)
                    .map_err(|e| Error::Encode("int64 value", e))?;
            }
            StateValue::Double(v) => {
                writer
                    .write_u8(TAG_DOUBLE)
                    .map_err(|e| Error::Encode("value tag", e))?;
                writer
                    .write_f64::<BigEndian>(*v)
                    .map_err(|e| Error::Encode("double value", e))?;
            }
            StateValue::Str(s) => {
                writer
                    .write_u8(TAG_STR)
                    .map_err(|e| Error::Encode("value tag", e))?;
                writer
                    .write_u16::<BigEndian>(s.len() as u16)
                    .map_err(|e| Error::Encode("string length", e))?;
                writer
                    .write_all(s.as_bytes())
                    .map_err(|e| Error::Encode("string value", e))?;
            }
            StateValue::Custom(b) => {
                writer
                    .write_u8(TAG_CUSTOM)
                    .map_err(|e| Error::Encode("value tag", e))?;
                writer
                    .write_u16::<BigEndian>(b.len() as u16)
                    .map_err(|e| Error::Encode("custom length", e))?;
                writer
                    .write_all(b)
                    .map_err(|e| Error::Encode("custom value", e))?;
            }
        }
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let tag = reader.read_u8().map_err(|e| Error::Decode("value tag", e))?;
        match tag {
            TAG_NULL => Ok(StateValue::Null),
            TAG_INT32 => {
                let v = reader
                    .read_i32::<BigEndian>()
                    .map_err(|e| Error::Decode("int32 value", e))?;
                Ok(StateValue::Int32(v))
            }
            TAG_INT64 => {
                let v = reader
                    .read_i64::<BigEndian>()
                    .map_err(|e| Error::Decode("int64 value", e))?;
                Ok(StateValue::Int64(v))
            }
            TAG_DOUBLE => {
                let v = reader
                    .read_f64::<BigEndian>()
                    .map_err(|e| Error::Decode("double value", e))?;
                Ok(StateValue::Double(v))
            }
            TAG_STR => {
                let len = reader
                    .read_u16::<BigEndian>()
                    .map_err(|e| Error::Decode("string length", e))?
                    as usize;
                let mut buf = vec![0u8; len];
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| Error::Decode("string value", e))?;
                let s = String::from_utf8(buf).map_err(|_| {
                    Error::Corrupted("string value is not valid UTF-8".to_string())
                })?;
                Ok(StateValue::Str(s))
            }
            TAG_CUSTOM => {
                let len = reader
                    .read_u16::<BigEndian>()
                    .map_err(|e| Error::Decode("custom length", e))?
                    as usize;
                let mut buf = vec![0u8; len];
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| Error::Decode("custom value", e))?;
                Ok(StateValue::Custom(buf))
            }
            other => Err(Error::Corrupted(format!("unknown value tag {}", other))),
        }
    }
}

/// A state value valid over `[start, end]` for one attribute key.
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    attribute: i32,
    start: i64,
    end: i64,
    value: StateValue,
}

impl Interval {
    pub fn new(attribute: i32, start: i64, end: i64, value: StateValue) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInterval { start, end });
        }
        let len = value.payload_len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            attribute,
            start,
            end,
            value,
        })
    }

    pub fn attribute(&self) -> i32 {
        self.attribute
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn value(&self) -> &StateValue {
        &self.value
    }

    /// True when `t` falls inside the validity range, bounds included.
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// True when the validity range intersects `[t0, t1]`.
    pub fn overlaps(&self, t0: i64, t1: i64) -> bool {
        self.start <= t1 && t0 <= self.end
    }

    pub fn serialized_size(&self) -> usize {
        INTERVAL_BASE_SIZE - 1 + self.value.serialized_size()
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_i32::<BigEndian>(self.attribute)
            .map_err(|e| Error::Encode("attribute", e))?;
        writer
            .write_i64::<BigEndian>(self.start)
            .map_err(|e| Error::Encode("interval start", e))?;
        writer
            .write_i64::<BigEndian>(self.end)
            .map_err(|e| Error::Encode("interval end", e))?;
        self.value.encode(writer)
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let attribute = reader
            .read_i32::<BigEndian>()
            .map_err(|e| Error::Decode("attribute", e))?;
        let start = reader
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("interval start", e))?;
        let end = reader
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("interval end", e))?;
        let value = StateValue::decode(reader)?;
        if start > end {
            return Err(Error::Corrupted(format!(
                "interval start {} after end {}",
                start, end
            )));
        }
        Ok(Self {
            attribute,
            start,
            end,
            value,
        })
    }
}
