use std::collections::BTreeMap;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crate::util::buf::{put_bytes, put_opt_string, put_string, try_get_bytes, try_get_opt_string, try_get_string};

const FORMAT_VERSION: u8 = 1;

/// The subset of the AMQP properties section that the hub protocol uses
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// milliseconds since the Unix epoch
    pub absolute_expiry_time: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            PropertyValue::Int(n) => Some(*n),
            PropertyValue::Long(n) => i32::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum MessageBody {
    #[default]
    Empty,
    Data(Bytes),
    Value(String),
}

impl MessageBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MessageBody::Empty => &[],
            MessageBody::Data(data) => data,
            MessageBody::Value(s) => s.as_bytes(),
        }
    }
}

/// Returned by [AmqpMessage::encode] if the target buffer is too small. The caller is expected
///  to retry with a bigger buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferOverflow {
    pub required: usize,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AmqpMessage {
    pub properties: MessageProperties,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub body: MessageBody,
}

impl AmqpMessage {
    pub fn application_property(&self, key: &str) -> Option<&PropertyValue> {
        self.application_properties.get(key)
    }

    pub fn set_application_property(&mut self, key: &str, value: PropertyValue) {
        self.application_properties.insert(key.to_string(), value);
    }

    /// Encodes the message into a caller-provided buffer, returning the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, BufferOverflow> {
        let mut encoded = BytesMut::new();
        self.ser(&mut encoded);
        if encoded.len() > buf.len() {
            return Err(BufferOverflow { required: encoded.len() });
        }
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    }

    pub fn decode(mut buf: &[u8]) -> anyhow::Result<AmqpMessage> {
        let result = Self::deser(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after message", buf.remaining());
        }
        Ok(result)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(FORMAT_VERSION);

        let p = &self.properties;
        put_opt_string(buf, p.message_id.as_deref());
        put_opt_string(buf, p.user_id.as_deref());
        put_opt_string(buf, p.to.as_deref());
        put_opt_string(buf, p.reply_to.as_deref());
        put_opt_string(buf, p.correlation_id.as_deref());
        put_opt_string(buf, p.content_type.as_deref());
        put_opt_string(buf, p.content_encoding.as_deref());
        match p.absolute_expiry_time {
            Some(t) => {
                buf.put_u8(1);
                buf.put_u64(t);
            }
            None => buf.put_u8(0),
        }

        buf.put_usize_varint(self.application_properties.len());
        for (key, value) in &self.application_properties {
            put_string(buf, key);
            match value {
                PropertyValue::String(s) => {
                    buf.put_u8(0);
                    put_string(buf, s);
                }
                PropertyValue::Int(n) => {
                    buf.put_u8(1);
                    buf.put_i32(*n);
                }
                PropertyValue::Long(n) => {
                    buf.put_u8(2);
                    buf.put_i64(*n);
                }
                PropertyValue::Bool(b) => {
                    buf.put_u8(3);
                    buf.put_u8(*b as u8);
                }
            }
        }

        match &self.body {
            MessageBody::Empty => buf.put_u8(0),
            MessageBody::Data(data) => {
                buf.put_u8(1);
                put_bytes(buf, data);
            }
            MessageBody::Value(s) => {
                buf.put_u8(2);
                put_string(buf, s);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AmqpMessage> {
        let version = buf.try_get_u8()?;
        if version != FORMAT_VERSION {
            bail!("unsupported message format version {}", version);
        }

        let properties = MessageProperties {
            message_id: try_get_opt_string(buf)?,
            user_id: try_get_opt_string(buf)?,
            to: try_get_opt_string(buf)?,
            reply_to: try_get_opt_string(buf)?,
            correlation_id: try_get_opt_string(buf)?,
            content_type: try_get_opt_string(buf)?,
            content_encoding: try_get_opt_string(buf)?,
            absolute_expiry_time: match buf.try_get_u8()? {
                0 => None,
                1 => Some(buf.try_get_u64()?),
                other => bail!("invalid presence marker {}", other),
            },
        };

        let num_properties = buf.try_get_usize_varint()?;
        let mut application_properties = BTreeMap::new();
        for _ in 0..num_properties {
            let key = try_get_string(buf)?;
            let value = match buf.try_get_u8()? {
                0 => PropertyValue::String(try_get_string(buf)?),
                1 => PropertyValue::Int(buf.try_get_i32()?),
                2 => PropertyValue::Long(buf.try_get_i64()?),
                3 => PropertyValue::Bool(buf.try_get_u8()? != 0),
                other => bail!("invalid property type {}", other),
            };
            application_properties.insert(key, value);
        }

        let body = match buf.try_get_u8()? {
            0 => MessageBody::Empty,
            1 => MessageBody::Data(try_get_bytes(buf)?),
            2 => MessageBody::Value(try_get_string(buf)?),
            other => bail!("invalid body type {}", other),
        };

        Ok(AmqpMessage {
            properties,
            application_properties,
            body,
        })
    }
}
