//! Encoding and decoding of monitoring datagrams.
//!
//! A datagram is made of a per-destination header followed by a body shared by
//! every destination of the same send:
//!
//! ```text
//! [string] "v:<version>_rsp:<password>"
//! [int32]  instance id
//! [int32]  sequence number
//! ---------------------------------- body
//! [string] cluster name
//! [string] node name
//! [int32]  number of parameters
//! repeated: [string] name, [int32] type tag, [typed] value
//! [int32]  timestamp (optional)
//! ```

use std::fmt;

use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::logging::{Logger, warning};
use crate::xdr::{XdrError, XdrReader, XdrWriter, string_budget};

/// Hard limit of the size of a datagram, header included.
pub const MAX_DGRAM_SIZE: usize = 8192;
/// Space reserved for the header when checking the size of a body.
pub const MAX_HEADER_LENGTH: usize = 40;
/// Version announced in the header of every datagram.
pub const APMON_VERSION: &str = "2.2.8";
/// Implementation tag appended to the version.
pub const IMPL_TAG: &str = "rs";

/// Type tag of a parameter value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ValueType {
    String = 0,
    Int32 = 2,
    Real32 = 4,
    Real64 = 5,
}

/// The value of a parameter.
///
/// A string value may be absent: such a parameter is skipped when encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Option<String>),
    Int32(i32),
    Real32(f32),
    Real64(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Str(_) => ValueType::String,
            Value::Int32(_) => ValueType::Int32,
            Value::Real32(_) => ValueType::Real32,
            Value::Real64(_) => ValueType::Real64,
        }
    }

    /// Number of bytes reserved for the value in the size estimate.
    fn budget(&self) -> usize {
        match self {
            Value::Str(s) => string_budget(s.as_deref().map_or(0, str::len)),
            Value::Int32(_) | Value::Real32(_) => 4,
            Value::Real64(_) => 8,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(Some(s)) => f.write_str(s),
            Value::Str(None) => f.write_str("<null>"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Real32(v) => write!(f, "{v}"),
            Value::Real64(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Some(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Some(v.to_owned()))
    }
}

/// A named, typed value. The name may be absent, in which case the parameter is skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<String>,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }

    /// Returns true if the parameter is written to the wire.
    pub fn is_effective(&self) -> bool {
        self.name.is_some() && !matches!(self.value, Value::Str(None))
    }

    fn budget(&self) -> usize {
        let name_len = self.name.as_deref().map_or(0, str::len);
        string_budget(name_len) + 4 + self.value.budget()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("datagram too large: {size} bytes exceed the limit of {MAX_DGRAM_SIZE} bytes")]
    TooLarge { size: usize },
    #[error("xdr encoding failed")]
    Xdr(#[from] XdrError),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed datagram")]
    Xdr(#[from] XdrError),
    #[error("unknown value type {0}")]
    UnknownType(i32),
    #[error("invalid parameter count {0}")]
    InvalidCount(i32),
}

/// Estimated size of a body, header excluded.
///
/// Only the effective parameters are counted.
pub fn body_budget(cluster: &str, node: &str, params: &[Param], timestamp: Option<i32>) -> usize {
    let mut size = string_budget(cluster.len()) + string_budget(node.len()) + 4;
    size += params.iter().filter(|p| p.is_effective()).map(Param::budget).sum::<usize>();
    if effective_timestamp(timestamp).is_some() {
        size += 4;
    }
    size
}

fn effective_timestamp(timestamp: Option<i32>) -> Option<i32> {
    timestamp.filter(|t| *t > 0)
}

/// Encodes the body of datagrams, reusing the same buffer between sends.
pub struct BodyEncoder {
    buf: BytesMut,
    logger: Logger,
}

impl BodyEncoder {
    pub fn new(logger: Logger) -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_DGRAM_SIZE),
            logger,
        }
    }

    /// Encodes a body and returns it, along with the number of encoded parameters.
    ///
    /// Parameters without a name, and string parameters without a value, are skipped.
    /// A timestamp is only written if it is positive.
    /// Nothing is written if the body, plus [`MAX_HEADER_LENGTH`], could exceed [`MAX_DGRAM_SIZE`].
    pub fn encode(
        &mut self,
        cluster: &str,
        node: &str,
        params: &[Param],
        timestamp: Option<i32>,
    ) -> Result<(&[u8], usize), EncodeError> {
        self.buf.clear();

        let size = body_budget(cluster, node, params, timestamp) + MAX_HEADER_LENGTH;
        if size > MAX_DGRAM_SIZE {
            return Err(EncodeError::TooLarge { size });
        }

        let effective: Vec<&Param> = params
            .iter()
            .filter(|p| {
                if p.is_effective() {
                    true
                } else {
                    warning!(self.logger, "skipping parameter {:?}: null name or null string value", p.name);
                    false
                }
            })
            .collect();

        let mut w = XdrWriter::new(&mut self.buf, MAX_DGRAM_SIZE - MAX_HEADER_LENGTH);
        w.put_string(cluster)?;
        w.put_string(node)?;
        // usize to i32 cannot overflow: the size check limits the number of parameters
        w.put_i32(effective.len() as i32)?;
        for p in &effective {
            w.put_string(p.name.as_deref().unwrap_or_default())?;
            w.put_i32(p.value.value_type().into())?;
            match &p.value {
                Value::Str(s) => w.put_string(s.as_deref().unwrap_or_default())?,
                Value::Int32(v) => w.put_i32(*v)?,
                Value::Real32(v) => w.put_f32(*v)?,
                Value::Real64(v) => w.put_f64(*v)?,
            }
        }
        if let Some(t) = effective_timestamp(timestamp) {
            w.put_i32(t)?;
        }
        Ok((&self.buf[..], effective.len()))
    }
}

/// Encodes the header of a datagram for one destination.
pub fn encode_header(password: &str, instance_id: i32, seq: i32) -> Result<BytesMut, EncodeError> {
    let header = format!("v:{APMON_VERSION}_{IMPL_TAG}p:{password}");
    let mut buf = BytesMut::with_capacity(MAX_HEADER_LENGTH);
    let mut w = XdrWriter::new(&mut buf, MAX_DGRAM_SIZE);
    w.put_string(&header)?;
    w.put_i32(instance_id)?;
    w.put_i32(seq)?;
    Ok(buf)
}

/// Concatenates a header and a body into a datagram, checking the size limit.
pub fn assemble(header: &[u8], body: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let size = header.len() + body.len();
    if size > MAX_DGRAM_SIZE {
        return Err(EncodeError::TooLarge { size });
    }
    let mut datagram = Vec::with_capacity(size);
    datagram.extend_from_slice(header);
    datagram.extend_from_slice(body);
    Ok(datagram)
}

/// A decoded datagram, as seen by a collector.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub header: String,
    pub instance_id: i32,
    pub seq: i32,
    pub cluster: String,
    pub node: String,
    pub params: Vec<Param>,
    pub timestamp: Option<i32>,
}

impl Datagram {
    /// The password contained in the header, if the header is well-formed.
    pub fn password(&self) -> Option<&str> {
        self.header.split_once("p:").map(|(_, password)| password)
    }
}

/// Decodes a complete datagram.
pub fn decode(bytes: &[u8]) -> Result<Datagram, DecodeError> {
    let mut r = XdrReader::new(bytes);
    let header = r.get_string()?;
    let instance_id = r.get_i32()?;
    let seq = r.get_i32()?;
    let cluster = r.get_string()?;
    let node = r.get_string()?;
    let count = r.get_i32()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::InvalidCount(count))?;

    let mut params = Vec::with_capacity(count.min(MAX_DGRAM_SIZE / 12));
    for _ in 0..count {
        let name = r.get_string()?;
        let tag = r.get_i32()?;
        let value = match ValueType::try_from(tag).map_err(|_| DecodeError::UnknownType(tag))? {
            ValueType::String => Value::Str(Some(r.get_string()?)),
            ValueType::Int32 => Value::Int32(r.get_i32()?),
            ValueType::Real32 => Value::Real32(r.get_f32()?),
            ValueType::Real64 => Value::Real64(r.get_f64()?),
        };
        params.push(Param { name: Some(name), value });
    }

    let timestamp = if r.remaining() >= 4 { Some(r.get_i32()?) } else { None };
    Ok(Datagram {
        header,
        instance_id,
        seq,
        cluster,
        node,
        params,
        timestamp,
    })
}
