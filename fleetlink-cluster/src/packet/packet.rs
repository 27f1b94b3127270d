use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, Result};

/// Current structured packet version
pub const PACKET_VERSION: u32 = 1;

/// Routing key of a packet: `namespace` + `code`, written `NS-CODE`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PacketIdentification {
    namespace: Cow<'static, str>,
    code: Cow<'static, str>,
}

impl PacketIdentification {
    #[must_use]
    pub fn new(namespace: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            namespace: Cow::Owned(namespace.into()),
            code: Cow::Owned(code.into()),
        }
    }

    /// Identification in the built-in `RC` namespace
    #[must_use]
    pub const fn builtin(code: &'static str) -> Self {
        Self {
            namespace: Cow::Borrowed("RC"),
            code: Cow::Borrowed(code),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('-') {
            Some((ns, code)) if !ns.is_empty() && !code.is_empty() => Ok(Self::new(ns, code)),
            _ => Err(Error::Protocol(format!("invalid packet identification `{raw}`"))),
        }
    }
}

impl fmt::Display for PacketIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.namespace, self.code)
    }
}

impl TryFrom<String> for PacketIdentification {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PacketIdentification> for String {
    fn from(value: PacketIdentification) -> Self {
        value.to_string()
    }
}

/// Which side of the magic link sent a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketOrigin {
    Frontend,
    Worker,
}

impl PacketOrigin {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "F" | "FRONTEND" | "PROXY" => Ok(Self::Frontend),
            "W" | "WORKER" | "SERVER" | "MCLOADER" => Ok(Self::Worker),
            _ => Err(Error::Protocol(format!("unknown packet origin `{raw}`"))),
        }
    }

    #[must_use]
    pub const fn short(self) -> &'static str {
        match self {
            Self::Frontend => "F",
            Self::Worker => "W",
        }
    }
}

/// Primitive parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view. Text holding a number is accepted, since legacy
    /// encodings cannot distinguish the two.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Parse a legacy (untyped) value: bool, then integer, then float, then text.
    #[must_use]
    pub fn infer(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return Self::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                if f.is_finite() {
                    return Self::Float(f);
                }
            }
        }
        Self::Text(raw.to_string())
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// A single message on the packet bus. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "v")]
    version: u32,
    /// Dedup identity
    #[serde(rename = "mid", default, skip_serializing_if = "String::is_empty")]
    message_id: String,
    #[serde(rename = "i")]
    identification: PacketIdentification,
    #[serde(rename = "o")]
    origin: PacketOrigin,
    /// Worker the packet concerns: sender for worker packets, recipient for
    /// front-end packets
    #[serde(rename = "a")]
    address: String,
    #[serde(rename = "p", default)]
    parameters: IndexMap<String, ParameterValue>,
}

impl Packet {
    #[must_use]
    pub fn builder() -> PacketBuilder {
        PacketBuilder::default()
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub const fn identification(&self) -> &PacketIdentification {
        &self.identification
    }

    #[must_use]
    pub const fn origin(&self) -> PacketOrigin {
        self.origin
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn parameters(&self) -> &IndexMap<String, ParameterValue> {
        &self.parameters
    }

    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&ParameterValue> {
        self.parameters.get(key)
    }

    /// Parameter rendered as text, whatever its primitive type
    #[must_use]
    pub fn text(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(ToString::to_string)
    }

    #[must_use]
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.parameters.get(key).and_then(ParameterValue::as_i64)
    }

    pub fn require_text(&self, key: &str) -> Result<String> {
        self.text(key).ok_or_else(|| self.missing(key))
    }

    pub fn require_u32(&self, key: &str) -> Result<u32> {
        let value = self.integer(key).ok_or_else(|| self.missing(key))?;
        u32::try_from(value).map_err(|_| {
            Error::Protocol(format!(
                "parameter `{key}` of {} is out of range: {value}",
                self.identification
            ))
        })
    }

    fn missing(&self, key: &str) -> Error {
        Error::Protocol(format!(
            "packet {} is missing parameter `{key}`",
            self.identification
        ))
    }

    pub(crate) fn with_message_id(mut self, message_id: String) -> Self {
        self.message_id = message_id;
        self
    }

    pub(crate) fn from_parts(
        version: u32,
        message_id: String,
        identification: PacketIdentification,
        origin: PacketOrigin,
        address: String,
        parameters: IndexMap<String, ParameterValue>,
    ) -> Self {
        Self {
            version,
            message_id,
            identification,
            origin,
            address,
            parameters,
        }
    }
}

#[derive(Debug, Default)]
pub struct PacketBuilder {
    identification: Option<PacketIdentification>,
    origin: Option<PacketOrigin>,
    address: Option<String>,
    parameters: IndexMap<String, ParameterValue>,
}

impl PacketBuilder {
    #[must_use]
    pub fn identification(mut self, identification: PacketIdentification) -> Self {
        self.identification = Some(identification);
        self
    }

    /// Packet sent by a worker to the front-end
    #[must_use]
    pub fn from_worker(mut self) -> Self {
        self.origin = Some(PacketOrigin::Worker);
        self
    }

    /// Packet sent by the front-end to a worker
    #[must_use]
    pub fn from_frontend(mut self) -> Self {
        self.origin = Some(PacketOrigin::Frontend);
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: PacketOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Packet> {
        let identification = self
            .identification
            .ok_or_else(|| Error::Protocol("packet needs an identification".to_string()))?;
        let origin = self
            .origin
            .ok_or_else(|| Error::Protocol(format!("packet {identification} needs an origin")))?;
        let address = self
            .address
            .ok_or_else(|| Error::Protocol(format!("packet {identification} needs an address")))?;

        Ok(Packet {
            version: PACKET_VERSION,
            message_id: nanoid::nanoid!(16),
            identification,
            origin,
            address,
            parameters: self.parameters,
        })
    }
}
