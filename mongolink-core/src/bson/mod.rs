//! Minimal BSON document support for the driver runtime.
//!
//! The runtime only needs to build command documents (`ismaster`,
//! `getlasterror`, `getnonce`, ...) and read scalar, array, and
//! subdocument fields out of server replies. User payloads pass through
//! a [`Document`] untouched; the connection layer never interprets them
//! beyond their encoded size.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Element tag for a 64-bit floating point value.
const TAG_DOUBLE: u8 = 0x01;
/// Element tag for a UTF-8 string.
const TAG_STRING: u8 = 0x02;
/// Element tag for an embedded document.
const TAG_DOCUMENT: u8 = 0x03;
/// Element tag for an array.
const TAG_ARRAY: u8 = 0x04;
/// Element tag for binary data.
const TAG_BINARY: u8 = 0x05;
/// Element tag for an object id.
const TAG_OBJECT_ID: u8 = 0x07;
/// Element tag for a boolean.
const TAG_BOOLEAN: u8 = 0x08;
/// Element tag for a UTC datetime (milliseconds since the epoch).
const TAG_DATETIME: u8 = 0x09;
/// Element tag for a null value.
const TAG_NULL: u8 = 0x0A;
/// Element tag for a regular expression.
const TAG_REGEX: u8 = 0x0B;
/// Element tag for a 32-bit integer.
const TAG_INT32: u8 = 0x10;
/// Element tag for an internal timestamp.
const TAG_TIMESTAMP: u8 = 0x11;
/// Element tag for a 64-bit integer.
const TAG_INT64: u8 = 0x12;

/// A single value within a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A 64-bit floating point value.
    Double(f64),
    /// A UTF-8 string.
    String(String),
    /// An embedded document.
    Document(Document),
    /// An array of values.
    Array(Vec<Value>),
    /// Binary data with its subtype byte.
    Binary(u8, Bytes),
    /// A 12-byte object id.
    ObjectId([u8; 12]),
    /// A boolean.
    Boolean(bool),
    /// Milliseconds since the UNIX epoch.
    DateTime(i64),
    /// An explicit null.
    Null,
    /// A regular expression pattern and its option flags.
    Regex(String, String),
    /// A 32-bit integer.
    Int32(i32),
    /// An internal replication timestamp.
    Timestamp(u64),
    /// A 64-bit integer.
    Int64(i64),
}

impl Value {
    /// Returns the value as an `i64` if it is numeric.
    ///
    /// Doubles are truncated, matching how the server's numeric status
    /// fields (`ok`, `code`) are interpreted regardless of their encoded
    /// type.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Double(v) => Some(*v as i64),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::Boolean(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Returns the value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
            Value::Document(_) => TAG_DOCUMENT,
            Value::Array(_) => TAG_ARRAY,
            Value::Binary(..) => TAG_BINARY,
            Value::ObjectId(_) => TAG_OBJECT_ID,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::DateTime(_) => TAG_DATETIME,
            Value::Null => TAG_NULL,
            Value::Regex(..) => TAG_REGEX,
            Value::Int32(_) => TAG_INT32,
            Value::Timestamp(_) => TAG_TIMESTAMP,
            Value::Int64(_) => TAG_INT64,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Double(_) => 8,
            Value::String(v) => 4 + v.len() + 1,
            Value::Document(v) => v.encoded_len(),
            Value::Array(v) => array_encoded_len(v),
            Value::Binary(_, data) => 4 + 1 + data.len(),
            Value::ObjectId(_) => 12,
            Value::Boolean(_) => 1,
            Value::DateTime(_) => 8,
            Value::Null => 0,
            Value::Regex(pattern, options) => pattern.len() + 1 + options.len() + 1,
            Value::Int32(_) => 4,
            Value::Timestamp(_) => 8,
            Value::Int64(_) => 8,
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Value::Double(v) => dst.put_f64_le(*v),
            Value::String(v) => {
                dst.put_i32_le(v.len() as i32 + 1);
                dst.put_slice(v.as_bytes());
                dst.put_u8(0);
            }
            Value::Document(v) => v.write_to(dst),
            Value::Array(v) => write_array(v, dst),
            Value::Binary(subtype, data) => {
                dst.put_i32_le(data.len() as i32);
                dst.put_u8(*subtype);
                dst.put_slice(data);
            }
            Value::ObjectId(v) => dst.put_slice(v),
            Value::Boolean(v) => dst.put_u8(u8::from(*v)),
            Value::DateTime(v) => dst.put_i64_le(*v),
            Value::Null => {}
            Value::Regex(pattern, options) => {
                dst.put_slice(pattern.as_bytes());
                dst.put_u8(0);
                dst.put_slice(options.as_bytes());
                dst.put_u8(0);
            }
            Value::Int32(v) => dst.put_i32_le(*v),
            Value::Timestamp(v) => dst.put_u64_le(*v),
            Value::Int64(v) => dst.put_i64_le(*v),
        }
    }

    fn read_from(tag: u8, src: &mut BytesMut) -> Result<Value> {
        match tag {
            TAG_DOUBLE => {
                ensure(src, 8)?;
                Ok(Value::Double(src.get_f64_le()))
            }
            TAG_STRING => {
                ensure(src, 4)?;
                let len = src.get_i32_le();
                if len < 1 || src.len() < len as usize {
                    return Err(Error::Protocol("truncated string element".to_string()));
                }
                let mut raw = src.split_to(len as usize);
                raw.truncate(len as usize - 1);
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::Protocol("string element is not UTF-8".to_string()))?;
                Ok(Value::String(text))
            }
            TAG_DOCUMENT => Ok(Value::Document(Document::read_from(src)?)),
            TAG_ARRAY => {
                let doc = Document::read_from(src)?;
                Ok(Value::Array(
                    doc.elements.into_iter().map(|(_, value)| value).collect(),
                ))
            }
            TAG_BINARY => {
                ensure(src, 5)?;
                let len = src.get_i32_le();
                let subtype = src.get_u8();
                if len < 0 || src.len() < len as usize {
                    return Err(Error::Protocol("truncated binary element".to_string()));
                }
                Ok(Value::Binary(subtype, src.split_to(len as usize).freeze()))
            }
            TAG_OBJECT_ID => {
                ensure(src, 12)?;
                let mut id = [0u8; 12];
                src.copy_to_slice(&mut id);
                Ok(Value::ObjectId(id))
            }
            TAG_BOOLEAN => {
                ensure(src, 1)?;
                Ok(Value::Boolean(src.get_u8() != 0))
            }
            TAG_DATETIME => {
                ensure(src, 8)?;
                Ok(Value::DateTime(src.get_i64_le()))
            }
            TAG_NULL => Ok(Value::Null),
            TAG_REGEX => {
                let pattern = read_cstring(src)?;
                let options = read_cstring(src)?;
                Ok(Value::Regex(pattern, options))
            }
            TAG_INT32 => {
                ensure(src, 4)?;
                Ok(Value::Int32(src.get_i32_le()))
            }
            TAG_TIMESTAMP => {
                ensure(src, 8)?;
                Ok(Value::Timestamp(src.get_u64_le()))
            }
            TAG_INT64 => {
                ensure(src, 8)?;
                Ok(Value::Int64(src.get_i64_le()))
            }
            other => Err(Error::Protocol(format!(
                "unsupported document element type {other:#04x}"
            ))),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

fn array_encoded_len(values: &[Value]) -> usize {
    let mut len = 4 + 1;
    for (index, value) in values.iter().enumerate() {
        len += 1 + index_key_len(index) + 1 + value.encoded_len();
    }
    len
}

fn write_array(values: &[Value], dst: &mut BytesMut) {
    dst.put_i32_le(array_encoded_len(values) as i32);
    for (index, value) in values.iter().enumerate() {
        dst.put_u8(value.tag());
        dst.put_slice(index.to_string().as_bytes());
        dst.put_u8(0);
        value.write_to(dst);
    }
    dst.put_u8(0);
}

fn index_key_len(index: usize) -> usize {
    index.to_string().len()
}

fn ensure(src: &BytesMut, needed: usize) -> Result<()> {
    if src.len() < needed {
        return Err(Error::Protocol("truncated document".to_string()));
    }
    Ok(())
}

fn read_cstring(src: &mut BytesMut) -> Result<String> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("unterminated cstring".to_string()))?;
    let raw = src.split_to(end);
    src.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Protocol("cstring is not UTF-8".to_string()))
}

/// An ordered BSON document.
///
/// Field order is preserved, matching the wire encoding. Lookups are
/// linear; documents the runtime inspects are small (identity replies,
/// command acknowledgements).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    elements: Vec<(String, Value)>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, consuming and returning the document for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds a field to the end of the document.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.elements.push((key.into(), value.into()));
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns true if the document contains the named field.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns the first field with the given name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.elements
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Returns the named field as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Returns the named field as a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Value::Boolean(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the named field coerced to an `i64`, if numeric.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    /// Returns the named field as an embedded document.
    pub fn get_document(&self, key: &str) -> Option<&Document> {
        match self.get(key) {
            Some(Value::Document(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the named field as an array of values.
    pub fn get_array(&self, key: &str) -> Option<&[Value]> {
        match self.get(key) {
            Some(Value::Array(v)) => Some(v),
            _ => None,
        }
    }

    /// Iterates over the document's fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.elements
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the encoded size of the document in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut len = 4 + 1;
        for (name, value) in &self.elements {
            len += 1 + name.len() + 1 + value.encoded_len();
        }
        len
    }

    /// Appends the encoded document to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i32_le(self.encoded_len() as i32);
        for (name, value) in &self.elements {
            dst.put_u8(value.tag());
            dst.put_slice(name.as_bytes());
            dst.put_u8(0);
            value.write_to(dst);
        }
        dst.put_u8(0);
    }

    /// Encodes the document into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Reads one encoded document from the front of `src`.
    ///
    /// Consumes exactly the document's encoded length on success.
    pub fn read_from(src: &mut BytesMut) -> Result<Document> {
        if src.len() < 5 {
            return Err(Error::Protocol("truncated document".to_string()));
        }
        let total = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if total < 5 || src.len() < total as usize {
            return Err(Error::Protocol("truncated document".to_string()));
        }

        let mut body = src.split_to(total as usize);
        body.advance(4);

        let mut elements = Vec::new();
        loop {
            if body.is_empty() {
                return Err(Error::Protocol("document missing terminator".to_string()));
            }
            let tag = body.get_u8();
            if tag == 0 {
                break;
            }
            let name = read_cstring(&mut body)?;
            let value = Value::read_from(tag, &mut body)?;
            elements.push((name, value));
        }

        Ok(Document { elements })
    }

    /// Parses a document from a complete byte slice.
    pub fn from_slice(raw: &[u8]) -> Result<Document> {
        let mut buf = BytesMut::from(raw);
        Self::read_from(&mut buf)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Document {
            elements: iter.into_iter().collect(),
        }
    }
}
