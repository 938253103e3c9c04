//! Translation between broker messages and pipeline records.
//!
//! The bridge is byte-payload only at its pipeline boundary: text messages are
//! encoded to UTF-8 on the way in and every outbound message is a byte message.

use crate::broker::{MessageBody, PropertyValue, WireMessage};
use crate::message::Record;
use crate::{BridgeError, BridgeResult};

/// Reserved property carrying the record routing key across the bridge
pub const GROUP_ID_PROPERTY: &str = "JMSXGroupID";

/// Convert an inbound broker message into a record.
///
/// The returned record is detached; the source attaches the session
/// acknowledger. Body kinds other than bytes and text are rejected with
/// [`BridgeError::UnsupportedMessageType`].
pub fn to_record(message: WireMessage) -> BridgeResult<Record> {
    let WireMessage {
        message_id,
        body,
        properties,
        timestamp,
        redelivered,
    } = message;

    let value = match body {
        MessageBody::Bytes(bytes) => bytes,
        MessageBody::Text(text) => text.into_bytes(),
        other => {
            return Err(BridgeError::UnsupportedMessageType {
                kind: other.kind().to_string(),
                message_id: message_id.map(|id| id.to_string()),
            })
        }
    };

    let key = properties
        .get(GROUP_ID_PROPERTY)
        .map(|group| group.to_string())
        .filter(|group| !group.is_empty());

    let mut record = Record::new(value);
    record.key = key;
    record.properties = properties
        .into_iter()
        .map(|(name, value)| (name, value.to_string()))
        .collect();
    record.message_id = message_id;
    record.timestamp = timestamp;
    record.redelivered = redelivered;

    Ok(record)
}

/// Convert an outbound record into a byte message.
///
/// Record properties are copied verbatim; the key is written to
/// [`GROUP_ID_PROPERTY`] afterwards, so it wins over a property of that name.
pub fn to_message(record: &Record) -> WireMessage {
    let mut message = WireMessage::bytes(record.value.clone());

    for (name, value) in &record.properties {
        message
            .properties
            .insert(name.clone(), PropertyValue::String(value.clone()));
    }

    if let Some(key) = &record.key {
        message
            .properties
            .insert(GROUP_ID_PROPERTY.to_string(), PropertyValue::String(key.clone()));
    }

    message
}
