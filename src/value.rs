//! Logical values and the tagged envelope layout plugins persist.
//!
//! The coordination layer stores `serde_json::Value`s and never interprets
//! them. Plugins that wrap values (expiry, encryption, compression) persist
//! a tagged map distinguishable by a reserved marker key; envelopes compose
//! by nesting the previous payload under `payload`.

use serde_json::{Map, Value};

/// Reserved marker key identifying an envelope map.
pub const ENVELOPE_MARKER: &str = "__akv_envelope__";

/// Envelope key holding the wrapped payload.
pub const ENVELOPE_PAYLOAD: &str = "payload";

/// Known envelope kinds. The core only needs to recognize the tag; the
/// semantics belong to the plugin that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Expiry,
    Encryption,
    Compression,
}

impl EnvelopeKind {
    pub fn tag(self) -> &'static str {
        match self {
            EnvelopeKind::Expiry => "expiry",
            EnvelopeKind::Encryption => "encryption",
            EnvelopeKind::Compression => "compression",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "expiry" => Some(EnvelopeKind::Expiry),
            "encryption" => Some(EnvelopeKind::Encryption),
            "compression" => Some(EnvelopeKind::Compression),
            _ => None,
        }
    }
}

/// Wraps `payload` in an envelope of the given kind with extra metadata
/// fields merged in.
pub fn wrap(kind: EnvelopeKind, payload: Value, meta: Map<String, Value>) -> Value {
    let mut map = meta;
    map.insert(ENVELOPE_MARKER.into(), Value::String(kind.tag().into()));
    map.insert(ENVELOPE_PAYLOAD.into(), payload);
    Value::Object(map)
}

/// Returns the envelope kind when `value` is a tagged envelope map.
pub fn envelope_kind(value: &Value) -> Option<EnvelopeKind> {
    value
        .as_object()
        .and_then(|map| map.get(ENVELOPE_MARKER))
        .and_then(Value::as_str)
        .and_then(EnvelopeKind::from_tag)
}

/// Splits an envelope into its payload and metadata. Returns `None` when
/// `value` is not an envelope.
pub fn unwrap(value: Value) -> Option<(EnvelopeKind, Value, Map<String, Value>)> {
    let kind = envelope_kind(&value)?;
    let mut map = match value {
        Value::Object(map) => map,
        _ => return None,
    };
    map.remove(ENVELOPE_MARKER);
    let payload = map.remove(ENVELOPE_PAYLOAD).unwrap_or(Value::Null);
    Some((kind, payload, map))
}
