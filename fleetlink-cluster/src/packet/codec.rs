//! Wire encodings
//!
//! Packets are written as JSON:
//!
//! ```text
//! {"v":1,"mid":"...","i":"RC-MLH","o":"WORKER","a":"10.0.0.2:25565","p":{"player_count":3}}
//! ```
//!
//! Older workers use a flat `key:value;key:value` form with parameters under
//! `p.<name>` keys and untyped values. Both are accepted on decode; a payload
//! starting with `{` is JSON.

use indexmap::IndexMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::packet::{Packet, PacketIdentification, PacketOrigin, ParameterValue, PACKET_VERSION};
use crate::error::{Error, Result};

const LEGACY_SEPARATOR: char = ';';
const LEGACY_PARAMETER_PREFIX: &str = "p.";

pub fn encode(packet: &Packet) -> Result<String> {
    Ok(serde_json::to_string(packet)?)
}

/// Decode either encoding. A packet without a message id gets one derived
/// from its raw payload, so identical redeliveries still dedupe.
pub fn decode(raw: &str) -> Result<Packet> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Protocol("empty payload".to_string()));
    }

    let packet = if trimmed.starts_with('{') {
        serde_json::from_str::<Packet>(trimmed)
            .map_err(|e| Error::Protocol(format!("malformed packet: {e}")))?
    } else {
        decode_legacy(trimmed)?
    };

    if packet.message_id().is_empty() {
        let derived = payload_identity(trimmed);
        return Ok(packet.with_message_id(derived));
    }
    Ok(packet)
}

/// Legacy flat encoding.
///
/// Values carry no type: the decoder infers bool, then integer, then float,
/// then text. A text parameter that reads as one of the others, like `"3"`,
/// comes back as that type. Anything containing `;`, and parameter names
/// containing `:`, cannot be written and are a [`Error::Protocol`].
pub fn encode_legacy(packet: &Packet) -> Result<String> {
    let mut fields = vec![
        format!("v:{}", packet.version()),
        format!("m:{}", legacy_safe("message id", packet.message_id())?),
        format!("i:{}", packet.identification()),
        format!("o:{}", packet.origin().short()),
        format!("a:{}", legacy_safe("address", packet.address())?),
    ];
    for (key, value) in packet.parameters() {
        if key.contains(':') {
            return Err(Error::Protocol(format!(
                "parameter name `{key}` cannot be written in the legacy encoding"
            )));
        }
        let value = value.to_string();
        fields.push(format!(
            "{LEGACY_PARAMETER_PREFIX}{}:{}",
            legacy_safe("parameter name", key)?,
            legacy_safe(key, &value)?
        ));
    }
    Ok(fields.join(";"))
}

fn legacy_safe<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    if value.contains(LEGACY_SEPARATOR) {
        return Err(Error::Protocol(format!(
            "{what} `{value}` contains `{LEGACY_SEPARATOR}` and cannot be written in the legacy encoding"
        )));
    }
    Ok(value)
}

fn decode_legacy(raw: &str) -> Result<Packet> {
    let mut version = PACKET_VERSION;
    let mut message_id = String::new();
    let mut identification = None;
    let mut origin = None;
    let mut address = None;
    let mut parameters = IndexMap::new();

    for field in raw.split(LEGACY_SEPARATOR).filter(|f| !f.is_empty()) {
        let (key, value) = field
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed legacy field `{field}`")))?;

        match key {
            "v" => {
                version = value
                    .parse()
                    .map_err(|_| Error::Protocol(format!("invalid packet version `{value}`")))?;
            }
            "m" => message_id = value.to_string(),
            "i" => identification = Some(PacketIdentification::parse(value)?),
            "o" => origin = Some(PacketOrigin::parse(value)?),
            "a" => address = Some(value.to_string()),
            _ => {
                if let Some(name) = key.strip_prefix(LEGACY_PARAMETER_PREFIX) {
                    parameters.insert(name.to_string(), ParameterValue::infer(value));
                }
                // unknown top-level keys are ignored
            }
        }
    }

    let identification = identification
        .ok_or_else(|| Error::Protocol("legacy packet has no identification".to_string()))?;
    let origin =
        origin.ok_or_else(|| Error::Protocol(format!("packet {identification} has no origin")))?;
    let address =
        address.ok_or_else(|| Error::Protocol(format!("packet {identification} has no address")))?;

    Ok(Packet::from_parts(
        version,
        message_id,
        identification,
        origin,
        address,
        parameters,
    ))
}

fn payload_identity(raw: &str) -> String {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("payload-{:016x}", hasher.finish())
}
