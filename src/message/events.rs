//! Typed binary events pushed by the Miniserver after status subscription.
//!
//! Value events carry a UUID and a double, text events a UUID, an icon UUID
//! and a padded UTF-8 string. All integers and floats are little-endian.

use crate::error::{LoxoneError, Result};
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

/// 16-byte Loxone object identifier.
///
/// The textual form is `xxxxxxxx-xxxx-xxxx-xxxxxxxxxxxxxxxx` with the first
/// three groups read as little-endian words, the last as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoxoneUuid([u8; 16]);

impl LoxoneUuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for LoxoneUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d1 = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let d2 = u16::from_le_bytes([self.0[4], self.0[5]]);
        let d3 = u16::from_le_bytes([self.0[6], self.0[7]]);
        write!(f, "{d1:08x}-{d2:04x}-{d3:04x}-")?;
        for byte in &self.0[8..] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for LoxoneUuid {
    type Err = LoxoneError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 || parts[0].len() != 8 || parts[1].len() != 4 || parts[2].len() != 4 || parts[3].len() != 16
        {
            return Err(LoxoneError::parsing(format!("Invalid Loxone UUID: {s}")));
        }
        let parse_word = |part: &str| {
            u64::from_str_radix(part, 16)
                .map_err(|e| LoxoneError::parsing(format!("Invalid Loxone UUID {s}: {e}")))
        };
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&(parse_word(parts[0])? as u32).to_le_bytes());
        bytes[4..6].copy_from_slice(&(parse_word(parts[1])? as u16).to_le_bytes());
        bytes[6..8].copy_from_slice(&(parse_word(parts[2])? as u16).to_le_bytes());
        let tail = hex::decode(parts[3])
            .map_err(|e| LoxoneError::parsing(format!("Invalid Loxone UUID {s}: {e}")))?;
        bytes[8..16].copy_from_slice(&tail);
        Ok(Self(bytes))
    }
}

/// State update carrying a numeric value
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEvent {
    pub uuid: LoxoneUuid,
    pub value: f64,
}

impl ValueEvent {
    /// Wire size of a single value event
    pub const SIZE: usize = 24;

    pub fn new(uuid: LoxoneUuid, value: f64) -> Self {
        Self { uuid, value }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(self.uuid.as_bytes());
        bytes.extend_from_slice(&self.value.to_le_bytes());
        bytes
    }
}

/// State update carrying a text value
#[derive(Debug, Clone, PartialEq)]
pub struct TextEvent {
    pub uuid: LoxoneUuid,
    pub icon_uuid: LoxoneUuid,
    pub text: String,
}

impl TextEvent {
    pub fn new(uuid: LoxoneUuid, icon_uuid: LoxoneUuid, text: impl Into<String>) -> Self {
        Self {
            uuid,
            icon_uuid,
            text: text.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let text = self.text.as_bytes();
        let padding = (4 - text.len() % 4) % 4;
        let mut bytes = Vec::with_capacity(36 + text.len() + padding);
        bytes.extend_from_slice(self.uuid.as_bytes());
        bytes.extend_from_slice(self.icon_uuid.as_bytes());
        bytes.extend_from_slice(&(text.len() as u32).to_le_bytes());
        bytes.extend_from_slice(text);
        bytes.resize(bytes.len() + padding, 0);
        bytes
    }
}

/// Parse a value-event table. Any remainder modulo the record size is a fault.
pub fn read_value_events(payload: &[u8]) -> Result<Vec<ValueEvent>> {
    if payload.len() % ValueEvent::SIZE != 0 {
        return Err(LoxoneError::parsing(format!(
            "Value event table has {} trailing bytes",
            payload.len() % ValueEvent::SIZE
        )));
    }
    let mut events = Vec::with_capacity(payload.len() / ValueEvent::SIZE);
    for record in payload.chunks_exact(ValueEvent::SIZE) {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&record[0..16]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&record[16..24]);
        events.push(ValueEvent {
            uuid: LoxoneUuid::from_bytes(uuid),
            value: f64::from_le_bytes(value),
        });
    }
    Ok(events)
}

/// Parse a text-event table. Length fields overrunning the buffer and
/// trailing bytes after the last complete record are faults.
pub fn read_text_events(payload: &[u8]) -> Result<Vec<TextEvent>> {
    let mut cursor = Cursor::new(payload);
    let mut events = Vec::new();
    while (cursor.position() as usize) < payload.len() {
        let mut uuid = [0u8; 16];
        let mut icon_uuid = [0u8; 16];
        let mut len = [0u8; 4];
        cursor
            .read_exact(&mut uuid)
            .and_then(|_| cursor.read_exact(&mut icon_uuid))
            .and_then(|_| cursor.read_exact(&mut len))
            .map_err(|_| LoxoneError::parsing("Truncated text event record"))?;

        let text_len = u32::from_le_bytes(len) as usize;
        let padded_len = text_len + (4 - text_len % 4) % 4;
        let mut text = vec![0u8; text_len];
        cursor
            .read_exact(&mut text)
            .map_err(|_| LoxoneError::parsing("Text event length overruns the buffer"))?;
        let mut padding = vec![0u8; padded_len - text_len];
        cursor
            .read_exact(&mut padding)
            .map_err(|_| LoxoneError::parsing("Text event padding overruns the buffer"))?;

        events.push(TextEvent {
            uuid: LoxoneUuid::from_bytes(uuid),
            icon_uuid: LoxoneUuid::from_bytes(icon_uuid),
            text: String::from_utf8(text)
                .map_err(|e| LoxoneError::parsing(format!("Text event is not UTF-8: {e}")))?,
        });
    }
    Ok(events)
}
