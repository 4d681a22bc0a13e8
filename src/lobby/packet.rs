/// Lobby packet — an ordered sequence of text fields.
///
/// On the wire a packet is a 16-bit big-endian length (which counts the
/// 2-byte header itself) followed by each field's UTF-8 bytes terminated
/// by a single NUL. Framing lives in [`super::codec`]; this type is the
/// decoded value plus typed cursor access to its fields.
use std::fmt;

/// Errors produced by the typed field accessors.
///
/// The `Display` form of these is sent verbatim to the peer as the
/// diagnostic field of an `ERROR` reply, so the wording is part of the
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Unexpected end of packet")]
    EndOfPacket,
    #[error("Invalid integer: '{0}'")]
    InvalidInteger(String),
    #[error("Invalid boolean: '{0}'")]
    InvalidBoolean(String),
}

/// A value that can be rendered as a packet field.
///
/// Integers render base-10, booleans as `"true"`/`"false"`.
pub trait ToField {
    fn to_field(self) -> String;
}

impl ToField for String {
    fn to_field(self) -> String {
        self
    }
}

impl ToField for &String {
    fn to_field(self) -> String {
        self.clone()
    }
}

impl ToField for &str {
    fn to_field(self) -> String {
        self.to_owned()
    }
}

impl ToField for bool {
    fn to_field(self) -> String {
        if self { "true" } else { "false" }.to_owned()
    }
}

macro_rules! int_to_field {
    ($($ty:ty),*) => {
        $(impl ToField for $ty {
            fn to_field(self) -> String {
                self.to_string()
            }
        })*
    };
}

int_to_field!(i32, i64, u16, u32, u64, usize);

/// A decoded (or under-construction) lobby packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    fields: Vec<String>,
    cursor: usize,
}

impl Packet {
    /// Start an empty packet to be filled with [`Packet::add`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap already-decoded fields, cursor at the first field.
    pub fn from_fields(fields: Vec<String>) -> Self {
        Packet { fields, cursor: 0 }
    }

    /// Append one field in its canonical text form.
    pub fn add(&mut self, field: impl ToField) {
        self.fields.push(field.to_field());
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Read the next field as a string, advancing the cursor.
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let field = self
            .fields
            .get(self.cursor)
            .ok_or(PacketError::EndOfPacket)?;
        self.cursor += 1;
        Ok(field.clone())
    }

    /// Read the next field as a base-10 integer.
    pub fn read_int(&mut self) -> Result<i64, PacketError> {
        let raw = self.read_string()?;
        raw.parse()
            .map_err(|_| PacketError::InvalidInteger(raw))
    }

    /// Read the next field as a boolean (`"true"` / `"false"`).
    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        let raw = self.read_string()?;
        match raw.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(PacketError::InvalidBoolean(raw)),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fields.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Building ─────────────────────────────────────────────────

    #[test]
    fn add_renders_canonical_forms() {
        let mut p = Packet::new();
        p.add("LOGIN");
        p.add(0);
        p.add("bert".to_owned());
        p.add(false);
        p.add(1_700_000_000_u64);
        assert_eq!(
            p.fields(),
            &["LOGIN", "0", "bert", "false", "1700000000"]
        );
    }

    // ── Typed accessors ──────────────────────────────────────────

    #[test]
    fn read_string_advances_cursor() {
        let mut p = Packet::from_fields(vec!["a".into(), "b".into()]);
        assert_eq!(p.read_string().unwrap(), "a");
        assert_eq!(p.read_string().unwrap(), "b");
        assert_eq!(p.read_string(), Err(PacketError::EndOfPacket));
    }

    #[test]
    fn read_int_parses_base_ten() {
        let mut p = Packet::from_fields(vec!["-42".into()]);
        assert_eq!(p.read_int().unwrap(), -42);
    }

    #[test]
    fn read_int_reports_offending_literal() {
        let mut p = Packet::from_fields(vec!["hi".into()]);
        let err = p.read_int().unwrap_err();
        assert_eq!(err.to_string(), "Invalid integer: 'hi'");
    }

    #[test]
    fn read_bool_accepts_true_false_only() {
        let mut p = Packet::from_fields(vec!["true".into(), "false".into(), "1".into()]);
        assert_eq!(p.read_bool().unwrap(), true);
        assert_eq!(p.read_bool().unwrap(), false);
        assert_eq!(
            p.read_bool().unwrap_err().to_string(),
            "Invalid boolean: '1'"
        );
    }

    #[test]
    fn read_past_end_is_an_error() {
        let mut p = Packet::from_fields(vec![]);
        assert_eq!(p.read_string(), Err(PacketError::EndOfPacket));
        assert_eq!(p.read_int(), Err(PacketError::EndOfPacket));
        assert_eq!(p.read_bool(), Err(PacketError::EndOfPacket));
    }
}
