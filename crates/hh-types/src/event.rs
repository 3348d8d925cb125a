//! The event record and its line-oriented wire codec.
//!
//! An event travels as one line: `type \t id \t arg1 \t arg2 ... \n`. This is
//! exactly what `herbstclient --idle` prints, so idle output can be forwarded
//! to the hub without any reformatting.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Separates the fields of one record.
pub const FIELD_SEPARATOR: char = '\t';

/// Terminates one record.
pub const RECORD_SEPARATOR: char = '\n';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The record could not be parsed into at least `type` and `id`.
    #[error("malformed event record: {reason}: {record:?}")]
    Malformed { record: String, reason: &'static str },
    #[error("event type must not be empty")]
    EmptyType,
    /// A field contained a tab, newline or carriage return and would not
    /// survive the wire.
    #[error("event field {field} contains a separator: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// One notification flowing through the hub.
///
/// Construction validates every field, so an `Event` value always encodes
/// losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    args: Vec<String>,
}

impl Event {
    pub fn new<I, S>(
        kind: impl Into<String>,
        id: impl Into<String>,
        args: I,
    ) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kind = kind.into();
        let id = id.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        if kind.is_empty() {
            return Err(CodecError::EmptyType);
        }
        check_field("type", &kind)?;
        check_field("id", &id)?;
        for arg in &args {
            check_field("arg", arg)?;
        }

        Ok(Self { kind, id, args })
    }

    /// Build an event from a raw idle-source line.
    ///
    /// herbstclient emits a few hooks (`reload`, `tag_flags`, ...) without an
    /// id column. Those bare lines become events with an empty id; anything
    /// with a tab goes through the strict decoder.
    pub fn from_idle_line(line: &str) -> Result<Self, CodecError> {
        let trimmed = strip_terminator(line);
        if !trimmed.is_empty() && !trimmed.contains(FIELD_SEPARATOR) {
            return Event::new(trimmed, "", Vec::<String>::new());
        }
        decode(line.as_bytes())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Serialize to the wire form, including the trailing newline.
    pub fn encode(&self) -> String {
        let mut out = self.to_string();
        out.push(RECORD_SEPARATOR);
        out
    }
}

/// The wire line without its record separator.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{FIELD_SEPARATOR}{}", self.kind, self.id)?;
        for arg in &self.args {
            write!(f, "{FIELD_SEPARATOR}{arg}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Event {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s.as_bytes())
    }
}

pub fn encode(event: &Event) -> Vec<u8> {
    event.encode().into_bytes()
}

/// Parse one record. A single trailing `\n` (and `\r` before it) is ignored.
pub fn decode(bytes: &[u8]) -> Result<Event, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Malformed {
        record: String::from_utf8_lossy(bytes).into_owned(),
        reason: "not valid UTF-8",
    })?;
    let record = strip_terminator(text);

    if record.contains(RECORD_SEPARATOR) {
        return Err(malformed(record, "embedded newline"));
    }
    if record.contains('\r') {
        return Err(malformed(record, "embedded carriage return"));
    }

    let mut fields = record.split(FIELD_SEPARATOR);
    let kind = fields.next().unwrap_or_default();
    let id = match fields.next() {
        Some(id) => id,
        None => return Err(malformed(record, "expected at least type and id fields")),
    };
    if kind.is_empty() {
        return Err(malformed(record, "empty event type"));
    }

    Ok(Event {
        kind: kind.to_string(),
        id: id.to_string(),
        args: fields.map(str::to_string).collect(),
    })
}

fn strip_terminator(text: &str) -> &str {
    let text = text.strip_suffix(RECORD_SEPARATOR).unwrap_or(text);
    text.strip_suffix('\r').unwrap_or(text)
}

fn malformed(record: &str, reason: &'static str) -> CodecError {
    CodecError::Malformed {
        record: record.to_string(),
        reason,
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), CodecError> {
    // '\r' at the end of a line reads back as part of a CRLF terminator.
    if value.contains(|c: char| c == FIELD_SEPARATOR || c == RECORD_SEPARATOR || c == '\r') {
        return Err(CodecError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
