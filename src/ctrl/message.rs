//! Handshake message codec.
//!
//! A message is a comma-separated list of `key:type:value` items. An empty
//! item list is sent as [`SENTINEL`] instead.

use std::fmt;

use thiserror::Error;

use crate::rdma::gid::Gid;

/// The message exchanged by a handshake that carries no items.
pub const SENTINEL: &str = "Aloha!";

const ITEM_SEP: char = ',';
const FIELD_SEP: char = ':';

/// Typed value of a handshake item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(u64),
    Gid(Gid),
}

impl Value {
    /// Name of the value type on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Int(_) => "int",
            Self::Gid(_) => "GID",
        }
    }

    /// Rebuild a value from its wire type name and text.
    fn parse(key: &str, ty: &str, text: &str) -> Result<Self, MessageError> {
        let invalid = || MessageError::InvalidValue {
            key: key.to_owned(),
            ty: ty.to_owned(),
            value: text.to_owned(),
        };
        match ty {
            "str" => Ok(Self::Str(text.to_owned())),
            "int" => text.parse().map(Self::Int).map_err(|_| invalid()),
            "GID" => text.parse().map(Self::Gid).map_err(|_| invalid()),
            _ => Err(MessageError::UnknownType(ty.to_owned())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{}", n),
            Self::Gid(gid) => write!(f, "{}", gid),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(n as u64)
    }
}

impl From<Gid> for Value {
    fn from(gid: Gid) -> Self {
        Self::Gid(gid)
    }
}

/// Handshake codec error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The message is empty.
    #[error("empty handshake message")]
    Empty,

    /// An item is not of the form `key:type:value`.
    #[error("malformed handshake item {0:?}")]
    Malformed(String),

    /// An item names a type outside `str`, `int` and `GID`.
    #[error("unknown handshake value type {0:?}")]
    UnknownType(String),

    /// A value does not parse as its declared type.
    #[error("invalid {ty} value {value:?} for key {key:?}")]
    InvalidValue {
        key: String,
        ty: String,
        value: String,
    },

    /// A key or string value contains a separator and cannot be encoded.
    #[error("{0:?} cannot be encoded in a handshake message")]
    Unencodable(String),

    /// The peer did not send an expected key.
    #[error("peer did not send {0:?}")]
    MissingKey(String),

    /// The peer sent a key with a different type than expected.
    #[error("peer sent {key:?} as {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Encode items into a handshake message, or [`SENTINEL`] if there are none.
pub fn encode(items: &[(&str, Value)]) -> Result<String, MessageError> {
    if items.is_empty() {
        return Ok(SENTINEL.to_owned());
    }

    let mut msg = String::new();
    for (i, (key, value)) in items.iter().enumerate() {
        if key.is_empty() || key.contains([ITEM_SEP, FIELD_SEP]) {
            return Err(MessageError::Unencodable((*key).to_owned()));
        }
        let text = value.to_string();
        if text.contains(ITEM_SEP) {
            return Err(MessageError::Unencodable(text));
        }

        if i > 0 {
            msg.push(ITEM_SEP);
        }
        msg.push_str(key);
        msg.push(FIELD_SEP);
        msg.push_str(value.type_name());
        msg.push(FIELD_SEP);
        msg.push_str(&text);
    }
    Ok(msg)
}

/// Parse a handshake message into its items.
///
/// The sentinel is not special here; it fails as a malformed item.
pub fn parse(msg: &str) -> Result<RemoteInfo, MessageError> {
    if msg.trim().is_empty() {
        return Err(MessageError::Empty);
    }

    let items = msg
        .split(ITEM_SEP)
        .map(|item| {
            let mut fields = item.splitn(3, FIELD_SEP);
            match (fields.next(), fields.next(), fields.next()) {
                (Some(key), Some(ty), Some(text)) if !key.trim().is_empty() => {
                    let key = key.trim();
                    Ok((key.to_owned(), Value::parse(key, ty.trim(), text.trim())?))
                }
                _ => Err(MessageError::Malformed(item.to_owned())),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RemoteInfo { items })
}

/// Items received from the peer, in the order sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    items: Vec<(String, Value)>,
}

impl RemoteInfo {
    /// Get the received items.
    pub fn items(&self) -> &[(String, Value)] {
        &self.items
    }

    /// Get the value of `key`.
    pub fn get(&self, key: &str) -> Result<&Value, MessageError> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| MessageError::MissingKey(key.to_owned()))
    }

    /// Get the value of `key` as an integer.
    pub fn int(&self, key: &str) -> Result<u64, MessageError> {
        match self.get(key)? {
            Value::Int(n) => Ok(*n),
            other => Err(self.mismatch(key, "int", other)),
        }
    }

    /// Get the value of `key` as a GID.
    pub fn gid(&self, key: &str) -> Result<Gid, MessageError> {
        match self.get(key)? {
            Value::Gid(gid) => Ok(*gid),
            other => Err(self.mismatch(key, "GID", other)),
        }
    }

    fn mismatch(&self, key: &str, expected: &'static str, found: &Value) -> MessageError {
        MessageError::TypeMismatch {
            key: key.to_owned(),
            expected,
            found: found.type_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid() -> Gid {
        "fe80::202:c9ff:fe00:1".parse().unwrap()
    }

    #[test]
    fn encode_typed_items() {
        let msg = encode(&[("qpn", Value::from(42u32)), ("gid", Value::from(gid()))]).unwrap();
        assert_eq!(
            msg,
            "qpn:int:42,gid:GID:fe80:0000:0000:0000:0202:c9ff:fe00:0001"
        );
    }

    #[test]
    fn empty_items_encode_to_sentinel() {
        assert_eq!(encode(&[]).unwrap(), SENTINEL);
    }

    #[test]
    fn parse_keeps_colons_in_values() {
        let info = parse("gid:GID:fe80::202:c9ff:fe00:1,name:str:a:b").unwrap();
        assert_eq!(info.gid("gid").unwrap(), gid());
        assert_eq!(info.get("name").unwrap(), &Value::Str("a:b".to_owned()));
    }

    #[test]
    fn parse_trims_fields() {
        let info = parse(" qpn : int : 7 , addr :int:140737488355328").unwrap();
        assert_eq!(info.int("qpn").unwrap(), 7);
        assert_eq!(info.int("addr").unwrap(), 140737488355328);
        assert_eq!(info.items().len(), 2);
    }

    #[test]
    fn encoded_message_parses_back() {
        let items = [
            ("gid", Value::from(gid())),
            ("qpn", Value::from(1234u32)),
            ("who", Value::from("server")),
        ];
        let info = parse(&encode(&items).unwrap()).unwrap();
        assert_eq!(info.gid("gid").unwrap(), gid());
        assert_eq!(info.int("qpn").unwrap(), 1234);
        assert_eq!(info.get("who").unwrap().to_string(), "server");
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert_eq!(
            parse("qpn:float:1.5"),
            Err(MessageError::UnknownType("float".to_owned()))
        );
        // The type registry is closed, so host type names mean nothing.
        assert!(matches!(
            parse("x:__import__:os"),
            Err(MessageError::UnknownType(_))
        ));
    }

    #[test]
    fn malformed_items_are_rejected() {
        assert_eq!(parse(""), Err(MessageError::Empty));
        assert_eq!(
            parse(SENTINEL),
            Err(MessageError::Malformed(SENTINEL.to_owned()))
        );
        assert_eq!(
            parse("qpn:int:1,qpn"),
            Err(MessageError::Malformed("qpn".to_owned()))
        );
        assert!(matches!(parse(":int:1"), Err(MessageError::Malformed(_))));
        assert!(matches!(
            parse("qpn:int:-1"),
            Err(MessageError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse("gid:GID:nope"),
            Err(MessageError::InvalidValue { .. })
        ));
    }

    #[test]
    fn separators_cannot_be_encoded() {
        assert!(encode(&[("a,b", Value::from(1u64))]).is_err());
        assert!(encode(&[("a:b", Value::from(1u64))]).is_err());
        assert!(encode(&[("a", Value::from("x,y"))]).is_err());
        assert!(encode(&[("", Value::from(1u64))]).is_err());
    }

    #[test]
    fn typed_lookups() {
        let info = parse("qpn:int:1").unwrap();
        assert_eq!(
            info.gid("qpn"),
            Err(MessageError::TypeMismatch {
                key: "qpn".to_owned(),
                expected: "GID",
                found: "int",
            })
        );
        assert_eq!(
            info.int("rkey"),
            Err(MessageError::MissingKey("rkey".to_owned()))
        );
    }
}
