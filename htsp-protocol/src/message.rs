//! HTSP message model.
//!
//! A message is an ordered list of named fields. Outbound messages are
//! assembled with [`MessageBuilder`] and frozen into a [`Message`] before
//! they are encoded; decoded messages are read-only.

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::{FIELD_METHOD, FIELD_SEQ};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Signed integer.
    Int(i64),
    /// Byte string; also carries UTF-8 text.
    Bytes(Bytes),
    /// Nested message.
    Map(Message),
    /// Sequence of nested messages.
    List(Vec<Message>),
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Int(value)
    }
}

impl From<i32> for Field {
    fn from(value: i32) -> Self {
        Field::Int(value as i64)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Bytes(Bytes::from(value.into_bytes()))
    }
}

impl From<Vec<u8>> for Field {
    fn from(value: Vec<u8>) -> Self {
        Field::Bytes(Bytes::from(value))
    }
}

impl From<Message> for Field {
    fn from(value: Message) -> Self {
        Field::Map(value)
    }
}

impl From<Vec<Message>> for Field {
    fn from(value: Vec<Message>) -> Self {
        Field::List(value)
    }
}

/// An immutable HTSP message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: Vec<(String, Field)>,
}

impl Message {
    /// Start building a request for the given method.
    pub fn request(method: &str) -> MessageBuilder {
        MessageBuilder::new().method(method)
    }

    /// Reopen this message for modification.
    pub fn into_builder(self) -> MessageBuilder {
        MessageBuilder {
            fields: self.fields,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, field)| field)
    }

    /// The `method` field, if present and valid UTF-8.
    pub fn method(&self) -> Option<&str> {
        match self.get(FIELD_METHOD) {
            Some(Field::Bytes(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The `seq` field, if present.
    pub fn seq(&self) -> Option<i64> {
        match self.get(FIELD_SEQ) {
            Some(Field::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Result<i64, ProtocolError> {
        match self.require(name)? {
            Field::Int(v) => Ok(*v),
            _ => Err(wrong_type(name, "an integer")),
        }
    }

    /// Integer field with a fallback when the field is absent.
    pub fn get_int_or(&self, name: &str, default: i64) -> Result<i64, ProtocolError> {
        match self.get(name) {
            None => Ok(default),
            Some(_) => self.get_int(name),
        }
    }

    pub fn get_bytes(&self, name: &str) -> Result<&Bytes, ProtocolError> {
        match self.require(name)? {
            Field::Bytes(b) => Ok(b),
            _ => Err(wrong_type(name, "a byte string")),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ProtocolError> {
        let bytes = self.get_bytes(name)?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(name.to_string()))
    }

    pub fn get_map(&self, name: &str) -> Result<&Message, ProtocolError> {
        match self.require(name)? {
            Field::Map(m) => Ok(m),
            _ => Err(wrong_type(name, "a map")),
        }
    }

    pub fn get_list(&self, name: &str) -> Result<&[Message], ProtocolError> {
        match self.require(name)? {
            Field::List(l) => Ok(l),
            _ => Err(wrong_type(name, "a list")),
        }
    }

    fn require(&self, name: &str) -> Result<&Field, ProtocolError> {
        self.get(name)
            .ok_or_else(|| ProtocolError::MissingField(name.to_string()))
    }
}

fn wrong_type(name: &str, expected: &'static str) -> ProtocolError {
    ProtocolError::WrongFieldType {
        name: name.to_string(),
        expected,
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: ", name)?;
            match field {
                Field::Int(v) => write!(f, "{}", v)?,
                Field::Bytes(b) => match std::str::from_utf8(b) {
                    Ok(s) => write!(f, "{:?}", s)?,
                    Err(_) => write!(f, "<{} bytes>", b.len())?,
                },
                Field::Map(m) => write!(f, "{}", m)?,
                Field::List(l) => {
                    f.write_str("[")?;
                    for (j, m) in l.iter().enumerate() {
                        if j > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", m)?;
                    }
                    f.write_str("]")?;
                }
            }
        }
        f.write_str("}")
    }
}

/// Mutable message under construction.
///
/// Setting a field that already exists removes the old entry first, so a
/// builder never holds two fields with the same name.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    fields: Vec<(String, Field)>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(self, method: &str) -> Self {
        self.field(FIELD_METHOD, method)
    }

    /// Chainable form of [`set`](Self::set).
    pub fn field(mut self, name: &str, value: impl Into<Field>) -> Self {
        self.set(name, value);
        self
    }

    /// Remove any existing field with this name, then append the new value.
    pub fn set(&mut self, name: &str, value: impl Into<Field>) {
        self.remove(name);
        self.fields.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn build(self) -> Message {
        Message {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_existing_field() {
        let mut builder = Message::request("hello").field("htspversion", 20);
        builder.set("htspversion", 25);
        let msg = builder.build();

        assert_eq!(msg.len(), 2);
        assert_eq!(msg.get_int("htspversion").unwrap(), 25);
        assert_eq!(msg.method(), Some("hello"));
    }

    #[test]
    fn test_typed_getters() {
        let service = Message::default().into_builder().field("type", "HDTV").build();
        let msg = MessageBuilder::new()
            .field("channelId", 7)
            .field("channelName", "News")
            .field("services", vec![service])
            .build();

        assert_eq!(msg.get_int("channelId").unwrap(), 7);
        assert_eq!(msg.get_str("channelName").unwrap(), "News");
        assert_eq!(msg.get_list("services").unwrap().len(), 1);
        assert_eq!(msg.get_int_or("channelNumberMinor", 0).unwrap(), 0);
        assert!(matches!(
            msg.get_int("channelName"),
            Err(ProtocolError::WrongFieldType { .. })
        ));
        assert!(matches!(
            msg.get_str("missing"),
            Err(ProtocolError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let msg = MessageBuilder::new()
            .field("challenge", vec![0xAB, 0xCD])
            .build();
        assert!(msg.get_bytes("challenge").is_ok());
        assert_eq!(
            msg.get_str("challenge"),
            Err(ProtocolError::InvalidUtf8("challenge".to_string()))
        );
    }

    #[test]
    fn test_display() {
        let msg = Message::request("getTicket").field("channelId", 3).build();
        assert_eq!(msg.to_string(), r#"{method: "getTicket", channelId: 3}"#);
    }
}
